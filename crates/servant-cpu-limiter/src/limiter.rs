//! The CPU bandwidth limiter itself, ported from
//! `original_source/yadcc/daemon/cloud/cpu_limiter.{h,cc}`.
//!
//! Time is sliced into 100 ms slots. Each slot, every *limited* process
//! tree is allowed to run (`SIGCONT`) for a computed working fraction of
//! the slot, then stopped (`SIGSTOP`) in ascending order of how long it
//! was allowed to run, so trees with a smaller share are stopped earlier
//! and trees closer to the full slot run nearly uninterrupted.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::process_info::{self, ProcessInfo};
use nix::unistd::Pid;

const LOG_TARGET: &str = "servant::cpu_limiter";

const ALPHA: f64 = 0.08;
const TIME_SLOT: Duration = Duration::from_micros(100_000);
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum LimiterError {
	#[error("max_cpu must be greater than zero")]
	ZeroMaxCpu,
	#[error("limiter was already started")]
	AlreadyStarted,
}

#[derive(Clone, Copy)]
struct SampledProcess {
	info: ProcessInfo,
	/// `None` is the "no sample yet" sentinel (the original's `-1`).
	cpu_usage: Option<f64>,
}

struct ProcessSet {
	processes: HashMap<Pid, SampledProcess>,
	living: Vec<Pid>,
	working_rate: Option<f64>,
	last_update: Instant,
}

impl ProcessSet {
	fn fresh() -> Self {
		// `Instant::now() - a huge duration` would panic on some platforms;
		// using `now()` just means the very first sample always satisfies
		// the minimum-sample-interval check on the *second* call, which is
		// harmless since the first call never has a previous sample to
		// diff against anyway.
		Self { processes: HashMap::new(), living: Vec::new(), working_rate: None, last_update: Instant::now() }
	}
}

struct RateState {
	limit_rate: f64,
	updated: bool,
}

struct ProcessContext {
	pid: Pid,
	rate: Mutex<RateState>,
	set: Mutex<ProcessSet>,
}

struct LimiterState {
	contexts: HashMap<Pid, Arc<ProcessContext>>,
	occupied: std::collections::HashSet<Pid>,
}

impl LimiterState {
	/// `rate_per_limited = (max_cpu - occupied_count) / limited_count`,
	/// recomputed whenever membership changes.
	fn update_rates(&self, max_cpu: usize) {
		if self.contexts.is_empty() {
			return;
		}
		let rate_per_context = (max_cpu as f64 - self.occupied.len() as f64) / self.contexts.len() as f64;
		for context in self.contexts.values() {
			let mut rate = context.rate.lock();
			rate.limit_rate = rate_per_context;
			rate.updated = true;
		}
	}
}

/// Approximately caps the aggregate CPU usage of supervised process trees
/// to `max_cpu` cores.
pub struct CpuLimiter {
	self_pid: Pid,
	max_cpu: AtomicUsize,
	exiting: Arc<AtomicBool>,
	state: Arc<Mutex<LimiterState>>,
	notify: Arc<Notify>,
	worker: Mutex<Option<JoinHandle<()>>>,
}

impl CpuLimiter {
	pub fn new() -> Self {
		Self {
			self_pid: Pid::this(),
			max_cpu: AtomicUsize::new(0),
			exiting: Arc::new(AtomicBool::new(false)),
			state: Arc::new(Mutex::new(LimiterState { contexts: HashMap::new(), occupied: Default::default() })),
			notify: Arc::new(Notify::new()),
			worker: Mutex::new(None),
		}
	}

	/// Starts the control loop with `max_cpu` cores to share. May only be
	/// called once.
	pub fn start_with_max_cpu(&self, max_cpu: usize) -> Result<(), LimiterError> {
		if max_cpu == 0 {
			return Err(LimiterError::ZeroMaxCpu);
		}
		if self.max_cpu.swap(max_cpu, Ordering::SeqCst) != 0 {
			return Err(LimiterError::AlreadyStarted);
		}
		let exiting = self.exiting.clone();
		let state = self.state.clone();
		let notify = self.notify.clone();
		let max_cpu_ref = max_cpu;
		let self_pid = self.self_pid;
		let handle = tokio::spawn(run_loop(exiting, state, notify, max_cpu_ref, self_pid));
		*self.worker.lock() = Some(handle);
		Ok(())
	}

	/// Enrols `pid`'s process tree in the shared bandwidth pool.
	pub fn limit(&self, pid: Pid) {
		assert!(pid != self.self_pid, "refusing to self-limit the daemon process");
		assert!(self.max_cpu.load(Ordering::SeqCst) > 0, "start_with_max_cpu must run first");
		if signal::kill(pid, None).is_err() {
			return; // already gone
		}
		let mut state = self.state.lock();
		if state.contexts.contains_key(&pid) || state.occupied.contains(&pid) {
			return;
		}
		let context =
			Arc::new(ProcessContext { pid, rate: Mutex::new(RateState { limit_rate: 0.0, updated: false }), set: Mutex::new(ProcessSet::fresh()) });
		state.contexts.insert(pid, context);
		state.update_rates(self.max_cpu.load(Ordering::SeqCst));
		self.notify.notify_waiters();
	}

	/// Reserves one whole core for `pid`, unconstrained.
	pub fn occupy(&self, pid: Pid) {
		let mut state = self.state.lock();
		if state.contexts.contains_key(&pid) || state.occupied.contains(&pid) {
			return;
		}
		state.occupied.insert(pid);
		state.update_rates(self.max_cpu.load(Ordering::SeqCst));
	}

	/// Removes any limit or occupy-slot previously associated with `pid`.
	pub fn remove(&self, pid: Pid) {
		let mut state = self.state.lock();
		if state.contexts.remove(&pid).is_some() {
			state.update_rates(self.max_cpu.load(Ordering::SeqCst));
		} else if state.occupied.remove(&pid) {
			state.update_rates(self.max_cpu.load(Ordering::SeqCst));
		}
	}

	pub fn stop(&self) {
		self.exiting.store(true, Ordering::SeqCst);
		self.notify.notify_waiters();
	}

	pub async fn join(&self) {
		let handle = self.worker.lock().take();
		if let Some(handle) = handle {
			let _ = handle.await;
		}
	}
}

impl Default for CpuLimiter {
	fn default() -> Self {
		Self::new()
	}
}

async fn run_loop(exiting: Arc<AtomicBool>, state: Arc<Mutex<LimiterState>>, notify: Arc<Notify>, max_cpu: usize, root: Pid) {
	let _ = root; // kept for parity with the original's `self_pid_`; unused beyond assertions upstream.
	while !exiting.load(Ordering::SeqCst) {
		let contexts: Vec<Arc<ProcessContext>> = { state.lock().contexts.values().cloned().collect() };
		if contexts.is_empty() {
			let _ = tokio::time::timeout(Duration::from_secs(1), notify.notified()).await;
			continue;
		}

		let mut run_queue: Vec<(Duration, Arc<ProcessContext>)> = Vec::new();
		for context in contexts {
			if let Some(time_to_work) = start_process(&context, max_cpu) {
				run_queue.push((time_to_work, context));
			}
		}
		run_queue.sort_by_key(|(time, _)| *time);

		if run_queue.is_empty() {
			tokio::time::sleep(TIME_SLOT).await;
			continue;
		}

		let max_time_to_work = run_queue.last().expect("checked non-empty above").0;
		let time_to_sleep = TIME_SLOT.saturating_sub(max_time_to_work);

		let mut run_queue: VecDeque<(Duration, Arc<ProcessContext>)> = run_queue.into_iter().collect();
		while let Some((next_stop_time, context)) = run_queue.pop_front() {
			tokio::time::sleep(next_stop_time).await;
			stop_process(&context);
			for (remaining, _) in run_queue.iter_mut() {
				*remaining = remaining.saturating_sub(next_stop_time);
			}
		}
		tokio::time::sleep(time_to_sleep).await;
	}
}

/// `SIGCONT`s every living descendant of `context`'s root pid, computing how
/// long (within this 100 ms slot) it should be allowed to run before being
/// stopped again. Returns `None` when the context currently has no living
/// descendants — the redesigned formalisation of the original's
/// contradictory `time_to_work == -1 && time_to_work >= kTimeSlot` run-queue
/// admission condition (see `DESIGN.md`): such a context is simply skipped
/// for the slot.
fn start_process(context: &ProcessContext, _max_cpu: usize) -> Option<Duration> {
	let limit_rate = {
		let mut rate = context.rate.lock();
		if rate.updated {
			// The limit rate changed (a tree was added/removed elsewhere):
			// discard accumulated samples and start accumulating fresh,
			// matching `UnsafeUpdateCpuLimitRate`'s invalidation.
			let mut set = context.set.lock();
			*set = ProcessSet::fresh();
			rate.updated = false;
		}
		rate.limit_rate
	};

	update_process(context);

	let set = context.set.lock();
	if set.living.is_empty() {
		return None;
	}

	let mut total_cpu_usage: Option<f64> = None;
	for pid in &set.living {
		if let Some(usage) = set.processes.get(pid).and_then(|p| p.cpu_usage) {
			total_cpu_usage = Some(total_cpu_usage.unwrap_or(0.0) + usage);
		}
	}
	drop(set);

	let working_rate = match total_cpu_usage {
		Some(total) if total > 0.0 => {
			let mut set = context.set.lock();
			let previous = set.working_rate.unwrap_or(limit_rate);
			let rate = (previous / total * limit_rate).min(1.0);
			set.working_rate = Some(rate);
			rate
		}
		_ => {
			let mut set = context.set.lock();
			set.working_rate = Some(limit_rate);
			limit_rate
		}
	};

	let time_to_work_micros = (TIME_SLOT.as_micros() as f64 * working_rate).max(0.0) as u64;
	let time_to_work = Duration::from_micros(time_to_work_micros);

	let mut set = context.set.lock();
	let candidates = std::mem::take(&mut set.living);
	let mut living = Vec::with_capacity(candidates.len());
	for pid in candidates {
		if signal::kill(pid, Signal::SIGCONT).is_err() {
			servant_common::warn_throttled!(target: LOG_TARGET, pid = pid.as_raw(), "SIGCONT delivery failed, dropping pid from tree");
			set.processes.remove(&pid);
		} else {
			living.push(pid);
		}
	}
	set.living = living;

	Some(time_to_work)
}

fn stop_process(context: &ProcessContext) {
	let mut set = context.set.lock();
	let living = set.living.clone();
	for pid in living {
		if signal::kill(pid, Signal::SIGSTOP).is_err() {
			set.processes.remove(&pid);
		}
	}
}

/// Samples every living descendant of `context.pid`, updating each one's
/// CPU-usage EMA. Ported from `UpdateProcess`.
fn update_process(context: &ProcessContext) {
	let mut set = context.set.lock();
	set.living.clear();

	let now = Instant::now();
	let time_diff = now.saturating_duration_since(set.last_update);

	for pid in process_info::descendants_of(context.pid) {
		let Some(info) = process_info::try_get_process_info(pid) else {
			set.processes.remove(&pid);
			continue;
		};

		match set.processes.get(&pid).copied() {
			Some(previous) if previous.info.start_time_secs != info.start_time_secs => {
				// PID reuse: a different process is now wearing this PID.
				// Reset its sample and exclude it from this slot's run
				// queue so one more round passes before we trust it.
				set.processes.insert(pid, SampledProcess { info, cpu_usage: None });
				continue;
			}
			Some(previous) => {
				if time_diff < MIN_SAMPLE_INTERVAL {
					continue;
				}
				let delta_ms = info.cpu_time_ms.saturating_sub(previous.info.cpu_time_ms) as f64;
				let sample = delta_ms / time_diff.as_millis().max(1) as f64;
				let cpu_usage = match previous.cpu_usage {
					None => sample,
					Some(prev_usage) => (1.0 - ALPHA) * prev_usage + ALPHA * sample,
				};
				set.processes.insert(pid, SampledProcess { info, cpu_usage: Some(cpu_usage) });
			}
			None => {
				set.processes.insert(pid, SampledProcess { info, cpu_usage: None });
			}
		}
		set.living.push(pid);
	}
	set.last_update = now;
}
