//! Test/dev-only scheduler scaffolding: the running-task bookkeeper and a
//! minimal in-process heartbeat server, used to drive
//! `servant-daemon`'s heartbeat loop end to end without a real scheduler.
//! The scheduler's placement algorithm itself is out of scope here.
//!
//! The heartbeat wire contract these test doubles speak
//! (`HeartbeatRequest`/`HeartbeatResponse`/`SchedulerService`) is defined in
//! `servant_common::scheduler_protocol`, not here — it's production code the
//! real daemon depends on — and re-exported for convenience.

mod bookkeeper;
mod rpc;

pub use bookkeeper::{RunningTask, RunningTaskBookkeeper};
pub use rpc::{HeartbeatRequest, HeartbeatResponse, SchedulerServiceClient, SchedulerServiceServer, SchedulerSim};
