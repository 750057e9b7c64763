//! Per-process-tree CPU bandwidth enforcement via `SIGSTOP`/`SIGCONT`
//! time-slicing, ported from `original_source/yadcc/daemon/cloud/cpu_limiter.{h,cc}`.

mod limiter;
mod process_info;

pub use limiter::{CpuLimiter, LimiterError};
pub use process_info::ProcessInfo;

pub use nix::unistd::Pid;
