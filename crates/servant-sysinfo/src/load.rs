//! Idle-tick sampling and the derived finer-grained processor load figure,
//! ported from `original_source/yadcc/daemon/cloud/sysinfo.cc`.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use crate::LOG_TARGET;

/// We only keep 61 samples (one per second): enough to answer any window up
/// to a minute without growing unbounded.
const SAMPLE_COUNT: usize = 61;

#[derive(Debug, Error)]
pub enum SysinfoError {
	#[error("failed to read {path}: {source}")]
	Read { path: String, #[source] source: std::io::Error },
	#[error("/proc/stat had an unexpected format: {0:?}")]
	MalformedProcStat(String),
}

/// Owns the ring buffer of processor idle-time samples and exposes the
/// memory/cpu-count/disk probes. One instance is shared (behind an `Arc`)
/// between the 1 Hz sampling task and the heartbeat loop that reads it.
pub struct SysinfoProbe {
	samples: Mutex<VecDeque<f64>>,
	clock_ticks_per_sec: i64,
}

impl Default for SysinfoProbe {
	fn default() -> Self {
		Self::new()
	}
}

impl SysinfoProbe {
	pub fn new() -> Self {
		let clock_ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
		Self { samples: Mutex::new(VecDeque::with_capacity(SAMPLE_COUNT)), clock_ticks_per_sec }
	}

	/// Reads `/proc/stat` once and appends the idle-tick figure (converted
	/// to seconds) to the ring buffer, evicting the oldest sample past
	/// [`SAMPLE_COUNT`]. Intended to be called once a second by a dedicated
	/// timer task.
	pub fn sample(&self) {
		match self.processor_idle_time() {
			Ok(idle) => {
				let mut samples = self.samples.lock();
				samples.push_back(idle);
				if samples.len() > SAMPLE_COUNT {
					samples.pop_front();
				}
			}
			Err(error) => {
				servant_common::warn_throttled!(target: LOG_TARGET, %error, "failed to sample processor idle time");
			}
		}
	}

	fn processor_idle_time(&self) -> Result<f64, SysinfoError> {
		let contents = fs::read_to_string("/proc/stat").map_err(|source| SysinfoError::Read {
			path: "/proc/stat".to_string(),
			source,
		})?;
		let first_line = contents.lines().next().unwrap_or_default();
		let fields: Vec<&str> = first_line.split_whitespace().collect();
		// "cpu  user nice system idle ..."
		let idle_ticks: f64 = fields
			.get(4)
			.and_then(|v| v.parse().ok())
			.ok_or_else(|| SysinfoError::MalformedProcStat(first_line.to_string()))?;
		Ok(idle_ticks / self.clock_ticks_per_sec as f64)
	}

	/// A finer-grained method to get the load average of a recent duration.
	/// Returns `None` if more than what has been sampled so far is
	/// requested (i.e. the caller should fall back to
	/// [`processor_load_last_minute`]). The result is rounded up, matching
	/// the original's `std::ceil`-via-`floor`-of-idle-cores computation.
	pub fn try_processor_load(&self, duration: Duration) -> Option<usize> {
		let interval = duration.as_secs() as usize;
		let samples = self.samples.lock();
		if interval == 0 || interval >= samples.len() {
			return None;
		}
		let start = samples[samples.len() - 1 - interval];
		let end = samples[samples.len() - 1];
		let idle_cores = (end - start) / interval as f64;
		let processors = number_of_processors();
		Some(processors.saturating_sub(idle_cores.floor() as usize))
	}
}

/// The classic one-minute load average. Delegates to the `sysinfo` crate
/// rather than hand-rolling a `getloadavg(3)` binding.
pub fn processor_load_last_minute() -> usize {
	sysinfo::System::load_average().one.ceil() as usize
}

pub fn number_of_processors() -> usize {
	// CPU hot-plug is not supported; the result never changes across the
	// process lifetime, so callers may cache it freely.
	std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Bytes of memory currently available for new allocations without
/// swapping, per the kernel's own `MemAvailable` estimate (since Linux
/// 3.14, surfaced by `sysinfo` as `available_memory`). Used by admission
/// control's `min_memory_for_starting_new_task` check.
pub fn memory_available_bytes() -> Result<u64, SysinfoError> {
	let mut sys = sysinfo::System::new();
	sys.refresh_memory();
	Ok(sys.available_memory())
}

pub fn total_memory_bytes() -> Result<u64, SysinfoError> {
	let mut sys = sysinfo::System::new();
	sys.refresh_memory();
	Ok(sys.total_memory())
}

/// Bytes of free space available (to an unprivileged user) on the
/// filesystem backing `dir`, used to decide between `/dev/shm` and `/tmp`
/// for scratch files.
pub fn disk_available_bytes(dir: impl AsRef<Path>) -> Result<u64, SysinfoError> {
	let path = dir.as_ref();
	let stat = nix::sys::statvfs::statvfs(path).map_err(|errno| SysinfoError::Read {
		path: path.display().to_string(),
		source: std::io::Error::from_raw_os_error(errno as i32),
	})?;
	Ok(stat.blocks_available() as u64 * stat.fragment_size())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn number_of_processors_is_nonzero() {
		assert!(number_of_processors() >= 1);
	}

	#[test]
	fn try_processor_load_is_none_before_enough_samples() {
		let probe = SysinfoProbe::new();
		assert_eq!(probe.try_processor_load(Duration::from_secs(5)), None);
	}

	#[test]
	fn try_processor_load_available_once_enough_samples_exist() {
		let probe = SysinfoProbe::new();
		for _ in 0..10 {
			probe.sample();
		}
		assert!(probe.try_processor_load(Duration::from_secs(5)).is_some());
	}

	#[test]
	fn disk_available_bytes_reads_root() {
		assert!(disk_available_bytes("/").unwrap() > 0);
	}

	#[test]
	fn memory_probes_read_proc_meminfo() {
		let total = total_memory_bytes().unwrap();
		let available = memory_available_bytes().unwrap();
		assert!(total > 0);
		assert!(available <= total * 2);
	}
}
