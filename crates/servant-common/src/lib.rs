//! Shared types and ambient utilities used across the compute-servant workspace.
//!
//! This crate has no domain logic of its own: it is the seam every other
//! crate in the workspace depends on for identifiers (`GrantId`, `TaskId`),
//! the environment descriptor, cache keys, scratch-file handling, size and
//! duration parsing, and a small throttled-logging helper.

pub mod config;
pub mod ids;
pub mod scheduler_protocol;
pub mod size;
pub mod temp_file;
pub mod throttle;

pub use ids::{CacheKey, EnvironmentDescriptor, GrantId, TaskId};
pub use temp_file::TemporaryFile;
