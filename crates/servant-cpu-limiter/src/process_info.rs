//! `/proc` sampling helpers, ported from the free functions in
//! `original_source/yadcc/daemon/cloud/cpu_limiter.cc`.

use nix::unistd::Pid;

/// A single `/proc/<pid>/stat` sample: enough to compute incremental CPU
/// usage and to detect PID reuse via `start_time`.
#[derive(Debug, Clone, Copy)]
pub struct ProcessInfo {
	pub pid: Pid,
	pub ppid: Pid,
	/// Cumulative user+sys CPU time, in milliseconds.
	pub cpu_time_ms: u64,
	/// Process start time, in seconds since boot. Used to detect PID reuse:
	/// if this changes for a PID we've already seen, it's a different
	/// process now wearing the same number.
	pub start_time_secs: u64,
}

/// Reads one process's `/proc/<pid>/stat`. Returns `None` if the process is
/// gone, exiting (`ppid == 0`), or otherwise unparseable — all of which are
/// routine races with a short-lived compiler child, not errors worth
/// logging.
pub fn try_get_process_info(pid: Pid) -> Option<ProcessInfo> {
	let ticks_per_second = procfs::ticks_per_second().max(1) as u64;
	let process = procfs::process::Process::new(pid.as_raw()).ok()?;
	let stat = process.stat().ok()?;
	if stat.ppid == 0 {
		return None;
	}
	let cpu_time_ms = (stat.utime + stat.stime).saturating_mul(1000) / ticks_per_second;
	let start_time_secs = stat.starttime / ticks_per_second;
	Some(ProcessInfo { pid, ppid: Pid::from_raw(stat.ppid), cpu_time_ms, start_time_secs })
}

fn try_get_parent_pid(pid: Pid) -> Option<Pid> {
	let process = procfs::process::Process::new(pid.as_raw()).ok()?;
	let stat = process.stat().ok()?;
	if stat.ppid == 0 {
		return None;
	}
	Some(Pid::from_raw(stat.ppid))
}

/// Whether `candidate` is `root` itself or a (possibly indirect) descendant
/// of it, walking the `ppid` chain. Returns `false` if the chain cannot be
/// followed all the way (a process exited mid-walk, which is tolerated as a
/// routine race rather than surfaced as an error).
pub fn is_self_or_descendant_of(candidate: Pid, root: Pid) -> bool {
	let mut current = candidate;
	loop {
		if current == root {
			return true;
		}
		match try_get_parent_pid(current) {
			Some(parent) => current = parent,
			None => return false,
		}
	}
}

/// Enumerates every live PID in `/proc` that is `root` itself or a
/// descendant of it.
pub fn descendants_of(root: Pid) -> Vec<Pid> {
	let Ok(processes) = procfs::process::all_processes() else { return Vec::new() };
	processes
		.filter_map(|p| p.ok())
		.map(|p| Pid::from_raw(p.pid()))
		.filter(|&pid| is_self_or_descendant_of(pid, root))
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn current_process_is_self_or_descendant_of_itself() {
		let me = Pid::this();
		assert!(is_self_or_descendant_of(me, me));
	}

	#[test]
	fn try_get_process_info_succeeds_for_self() {
		let me = Pid::this();
		let info = try_get_process_info(me).expect("own /proc/self/stat should parse");
		assert_eq!(info.pid, me);
	}

	#[test]
	fn descendants_of_self_includes_self() {
		let me = Pid::this();
		let set = descendants_of(me);
		assert!(set.contains(&me));
	}
}
