//! Processor load, memory and disk probing, plus temporary-directory
//! selection, for the compute-servant daemon.
//!
//! The heartbeat's `current_load` field wants a finer-grained sample than
//! the classic one-minute load average (waiting a full minute to notice a
//! burst of compile jobs is too coarse for admission control), so this
//! crate keeps its own ring buffer of processor idle-time samples and
//! derives a load figure over whatever window the caller asks for, falling
//! back to the OS one-minute average when the window exceeds what has been
//! sampled so far.

mod load;
mod temp_dir;

pub use load::{
	disk_available_bytes, memory_available_bytes, number_of_processors, processor_load_last_minute,
	total_memory_bytes, SysinfoError, SysinfoProbe,
};
pub use temp_dir::determine_temporary_dir;

use std::sync::Arc;
use std::time::Duration;

const LOG_TARGET: &str = "servant::sysinfo";

/// Spawns the 1 Hz sampling task that feeds [`SysinfoProbe::try_processor_load`].
/// Returns the `JoinHandle` so callers (the daemon's shutdown path) can abort
/// it cleanly; dropping the handle without aborting leaves it running, which
/// is harmless since it only samples and never blocks.
pub fn spawn_sampling_task(probe: Arc<SysinfoProbe>) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(Duration::from_secs(1));
		loop {
			interval.tick().await;
			probe.sample();
		}
	})
}
