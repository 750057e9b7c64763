//! Subprocess execution engine for compile tasks: admission control, a
//! dedicated reaper thread, rendezvous for waiters, cancellation, plus the
//! local-socket multi-chunk framing codec, ported from
//! `original_source/yadcc/daemon/cloud/execution_engine.{h,cc}` and
//! `original_source/yadcc/daemon/local/multi_chunk.{h,cc}`.

mod engine;
mod framing;
mod spawn;
mod task;

pub use engine::{EngineConfig, ExecutionEngine, Task, WaitOutcome};
pub use framing::{make_multi_chunk, try_parse_multi_chunk};
pub use spawn::SpawnError;
pub use task::ExecutionTask;
