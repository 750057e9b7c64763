//! The execution engine itself, ported from
//! `original_source/yadcc/daemon/cloud/execution_engine.{h,cc}`: admission
//! control over a bounded pool of child processes, a dedicated reaper
//! thread, rendezvous for callers awaiting a task's completion, and the
//! orphan-cleanup sweep for completed tasks nobody ever collects.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{self, WaitStatus};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde_json::json;
use servant_common::config::{NotAcceptingTaskReason, ServantPriority};
use servant_common::{GrantId, TaskId, TemporaryFile};
use servant_cpu_limiter::CpuLimiter;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::spawn::{spawn_in_new_group, SpawnError};
use crate::task::ExecutionTask;

const LOG_TARGET: &str = "servant::engine";

/// How long a completed task is kept around before the cleanup sweep frees
/// it on the caller's behalf, matching the original's `1min` cutoff.
const ORPHAN_RETENTION: Duration = Duration::from_secs(60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
enum QueueFailure {
	#[error(transparent)]
	TempFile(#[from] servant_common::temp_file::TemporaryFileError),
	#[error(transparent)]
	Spawn(#[from] SpawnError),
}

/// Configuration the engine needs to derive its task concurrency limit and
/// locate scratch space. Mirrors the CLI flags of
/// `original_source/yadcc/daemon/cloud/execution_engine.cc`'s constructor.
pub struct EngineConfig {
	/// `-1` derives the limit from `servant_priority`; `0` rejects all
	/// tasks; any positive value is used verbatim.
	pub max_remote_tasks: i64,
	pub servant_priority: ServantPriority,
	pub min_memory_for_starting_new_task_bytes: u64,
	pub poor_machine_threshold_processors: usize,
	pub temp_dir: PathBuf,
}

fn is_cgroup_present() -> bool {
	let Ok(contents) = std::fs::read_to_string("/proc/self/cgroup") else {
		return false;
	};
	contents.lines().any(|line| {
		let parts: Vec<&str> = line.split(':').collect();
		if parts.len() < 3 {
			return false;
		}
		(parts[1] == "cpuacct,cpu" || parts[1] == "memory") && parts[2] != "/" && parts[2] != "/user.slice"
	})
}

fn derive_task_concurrency_limit(config: &EngineConfig) -> (usize, Option<NotAcceptingTaskReason>) {
	let nprocs = servant_sysinfo::number_of_processors();

	if config.max_remote_tasks == -1 {
		match config.servant_priority {
			ServantPriority::Dedicated => (nprocs * 95 / 100, None),
			ServantPriority::User => {
				if is_cgroup_present() {
					tracing::info!(target: LOG_TARGET, "cgroup present, not dispatching compilation tasks to this node");
					(0, Some(NotAcceptingTaskReason::CGroupsPresent))
				} else if nprocs <= config.poor_machine_threshold_processors {
					tracing::info!(target: LOG_TARGET, nprocs, "poor machine, compilation tasks won't be dispatched here");
					(0, Some(NotAcceptingTaskReason::PoorMachine))
				} else {
					(nprocs * 40 / 100, None)
				}
			}
		}
	} else if config.max_remote_tasks == 0 {
		(0, Some(NotAcceptingTaskReason::UserInstructed))
	} else {
		(config.max_remote_tasks as usize, None)
	}
}

struct TaskDescriptor {
	grant_id: GrantId,
	client_ref_count: AtomicU32,
	is_running: AtomicBool,
	#[allow(dead_code)]
	started_at: Instant,
	completed_at: Mutex<Option<Instant>>,
	completed_at_unix_secs: Mutex<Option<u64>>,
	process_group: Pid,
	stdout_file: Mutex<TemporaryFile>,
	stderr_file: Mutex<TemporaryFile>,
	completion: Notify,
	task: Arc<dyn ExecutionTask>,
	command_line: String,
	exit_code: Mutex<Option<i32>>,
}

/// One entry returned by [`ExecutionEngine::enumerate_tasks`].
pub struct Task {
	pub id: TaskId,
	pub grant_id: GrantId,
	pub task: Arc<dyn ExecutionTask>,
}

/// Outcome of a [`ExecutionEngine::wait_for_task`] call.
pub enum WaitOutcome {
	NotFound,
	Running,
	Done(Arc<dyn ExecutionTask>),
}

struct Inner {
	exiting: AtomicBool,
	task_concurrency_limit: usize,
	not_accepting_reason: Option<NotAcceptingTaskReason>,
	min_memory_for_starting_new_task: u64,
	temp_dir: PathBuf,
	next_task_id: AtomicU64,
	running_tasks: AtomicU64,
	tasks_run_ever: AtomicU64,
	tasks: Mutex<HashMap<TaskId, Arc<TaskDescriptor>>>,
	cpu_limiter: Option<Arc<CpuLimiter>>,
	reap_semaphore: Arc<Semaphore>,
	runtime: tokio::runtime::Handle,
}

impl Inner {
	fn kill_task(&self, task: &TaskDescriptor) {
		if task.is_running.load(Ordering::Relaxed) {
			// Negative pid addresses the whole process group.
			let _ = signal::kill(Pid::from_raw(-task.process_group.as_raw()), Signal::SIGKILL);
		}
	}

	fn try_start_new_task_unsafe(&self) -> Option<TaskId> {
		if self.exiting.load(Ordering::Relaxed) {
			return None;
		}

		let task_id = TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed));

		if self.running_tasks.fetch_add(1, Ordering::Relaxed) + 1 > self.task_concurrency_limit as u64 {
			servant_common::warn_throttled!(target: LOG_TARGET, "actively rejecting task, out of available processors");
			self.running_tasks.fetch_sub(1, Ordering::Relaxed);
			return None;
		}

		let available = match servant_sysinfo::memory_available_bytes() {
			Ok(bytes) => bytes,
			Err(error) => {
				servant_common::warn_throttled!(target: LOG_TARGET, %error, "failed to probe available memory, assuming plenty");
				u64::MAX
			}
		};
		if available < self.min_memory_for_starting_new_task {
			servant_common::warn_throttled!(target: LOG_TARGET, "actively rejecting task, out of available memory");
			self.running_tasks.fetch_sub(1, Ordering::Relaxed);
			return None;
		}

		self.tasks_run_ever.fetch_add(1, Ordering::Relaxed);
		Some(task_id)
	}
}

/// Admission-controlled pool of child processes running compile tasks.
pub struct ExecutionEngine {
	inner: Arc<Inner>,
	reaper: Mutex<Option<std::thread::JoinHandle<()>>>,
	cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionEngine {
	/// Must be called from within a running Tokio runtime: the reaper
	/// thread hands completions back to it, and the cleanup sweep is a
	/// Tokio task.
	pub fn new(config: EngineConfig) -> Self {
		let (task_concurrency_limit, not_accepting_reason) = derive_task_concurrency_limit(&config);

		let cpu_limiter = if task_concurrency_limit > 0 {
			tracing::info!(target: LOG_TARGET, task_concurrency_limit, "serving at most this many tasks simultaneously");
			let limiter = Arc::new(CpuLimiter::new());
			limiter.start_with_max_cpu(task_concurrency_limit).expect("limiter is fresh");
			Some(limiter)
		} else {
			None
		};

		let inner = Arc::new(Inner {
			exiting: AtomicBool::new(false),
			task_concurrency_limit,
			not_accepting_reason,
			min_memory_for_starting_new_task: config.min_memory_for_starting_new_task_bytes,
			temp_dir: config.temp_dir,
			next_task_id: AtomicU64::new(1),
			running_tasks: AtomicU64::new(0),
			tasks_run_ever: AtomicU64::new(0),
			tasks: Mutex::new(HashMap::new()),
			cpu_limiter,
			reap_semaphore: Arc::new(Semaphore::new(0)),
			runtime: tokio::runtime::Handle::current(),
		});

		let reaper_inner = inner.clone();
		let reaper = std::thread::Builder::new()
			.name("servant-reaper".into())
			.spawn(move || process_waiter_loop(reaper_inner))
			.expect("failed to spawn subprocess reaper thread");

		let cleanup_inner = inner.clone();
		let cleanup = tokio::spawn(cleanup_loop(cleanup_inner));

		Self { inner, reaper: Mutex::new(Some(reaper)), cleanup: Mutex::new(Some(cleanup)) }
	}

	pub fn get_maximum_tasks(&self) -> Result<usize, NotAcceptingTaskReason> {
		if self.inner.task_concurrency_limit > 0 {
			Ok(self.inner.task_concurrency_limit)
		} else {
			Err(self.inner.not_accepting_reason.unwrap_or(NotAcceptingTaskReason::UserInstructed))
		}
	}

	/// Admits and starts `task` under `grant_id`, returning the task id the
	/// caller should poll with [`wait_for_task`](Self::wait_for_task), or
	/// `None` if the engine is out of capacity, memory, or shutting down.
	/// A spawn failure rolls back admission and also returns `None`.
	pub fn queue_task(&self, grant_id: GrantId, mut task: Box<dyn ExecutionTask>) -> Option<TaskId> {
		let mut tasks = self.inner.tasks.lock();
		let task_id = self.inner.try_start_new_task_unsafe()?;

		let command_line = task.command_line();
		tracing::trace!(target: LOG_TARGET, %task_id, command = %command_line, "executing");

		let stdin_bytes = task.take_stdin();
		let spawned = (|| -> Result<_, QueueFailure> {
			let mut stdin_file = TemporaryFile::new_in(&self.inner.temp_dir)?;
			stdin_file.write_all(&stdin_bytes)?;
			let stdin_handle = stdin_file.reopen()?;

			let stdout_file = TemporaryFile::new_in(&self.inner.temp_dir)?;
			let stdout_handle = stdout_file.reopen()?;
			let stderr_file = TemporaryFile::new_in(&self.inner.temp_dir)?;
			let stderr_handle = stderr_file.reopen()?;

			let pid = spawn_in_new_group(&command_line, stdin_handle, stdout_handle, stderr_handle)?;
			Ok((pid, stdout_file, stderr_file))
		})();

		let (pid, stdout_file, stderr_file) = match spawned {
			Ok(v) => v,
			Err(error) => {
				self.inner.running_tasks.fetch_sub(1, Ordering::Relaxed);
				tracing::warn!(target: LOG_TARGET, %error, "failed to start task, rolling back admission");
				return None;
			}
		};

		// The CPU limit is applied unconditionally.
		if let Some(limiter) = &self.inner.cpu_limiter {
			limiter.limit(pid);
		}

		let descriptor = Arc::new(TaskDescriptor {
			grant_id,
			client_ref_count: AtomicU32::new(1),
			is_running: AtomicBool::new(true),
			started_at: Instant::now(),
			completed_at: Mutex::new(None),
			completed_at_unix_secs: Mutex::new(None),
			process_group: pid,
			stdout_file: Mutex::new(stdout_file),
			stderr_file: Mutex::new(stderr_file),
			completion: Notify::new(),
			task: Arc::from(task),
			command_line,
			exit_code: Mutex::new(None),
		});
		tasks.insert(task_id, descriptor);
		drop(tasks);

		self.inner.reap_semaphore.add_permits(1);
		Some(task_id)
	}

	/// Adds one more reference to an already-queued task, so a later
	/// `FreeTask` from a different client doesn't kill it out from under
	/// the first.
	pub fn reference_task(&self, task_id: TaskId) -> bool {
		let tasks = self.inner.tasks.lock();
		let Some(descriptor) = tasks.get(&task_id) else {
			return false;
		};
		descriptor.client_ref_count.fetch_add(1, Ordering::Relaxed);
		true
	}

	/// Waits up to `timeout` for `task_id` to complete. Returns the same
	/// task handle passed to [`queue_task`](Self::queue_task) once done, so
	/// the caller can query whatever completion state it recorded in
	/// `on_completion` (the engine itself doesn't interpret exit codes or
	/// captured output beyond what it needs for its own bookkeeping).
	pub async fn wait_for_task(&self, task_id: TaskId, timeout: Duration) -> WaitOutcome {
		let descriptor = {
			let tasks = self.inner.tasks.lock();
			tasks.get(&task_id).cloned()
		};
		let Some(descriptor) = descriptor else {
			return WaitOutcome::NotFound;
		};

		loop {
			let notified = descriptor.completion.notified();
			if !descriptor.is_running.load(Ordering::Acquire) {
				return WaitOutcome::Done(descriptor.task.clone());
			}
			if tokio::time::timeout(timeout, notified).await.is_err() {
				return WaitOutcome::Running;
			}
		}
	}

	/// Drops one reference to `task_id`; once the last reference is freed
	/// the task is removed from the engine and killed if still running.
	pub fn free_task(&self, task_id: TaskId) {
		let freed = {
			let mut tasks = self.inner.tasks.lock();
			let Some(descriptor) = tasks.get(&task_id) else {
				return;
			};
			if descriptor.client_ref_count.fetch_sub(1, Ordering::Relaxed) > 1 {
				return;
			}
			tasks.remove(&task_id)
		};
		if let Some(descriptor) = freed {
			self.inner.kill_task(&descriptor);
		}
	}

	pub fn enumerate_tasks(&self) -> Vec<Task> {
		let tasks = self.inner.tasks.lock();
		tasks.iter().map(|(id, descriptor)| Task { id: *id, grant_id: descriptor.grant_id, task: descriptor.task.clone() }).collect()
	}

	/// Forcibly kills every currently-running task whose grant is in
	/// `expired_grant_ids`, as reported by a scheduler heartbeat response.
	pub fn kill_expired_tasks(&self, expired_grant_ids: &HashSet<GrantId>) {
		let mut killed = 0;
		{
			let tasks = self.inner.tasks.lock();
			for descriptor in tasks.values() {
				if descriptor.is_running.load(Ordering::Relaxed) && expired_grant_ids.contains(&descriptor.grant_id) {
					self.inner.kill_task(descriptor);
					killed += 1;
				}
			}
		}
		if killed > 0 {
			tracing::warn!(target: LOG_TARGET, killed, "killed tasks reported as expired");
		}
	}

	/// Signals shutdown: kills every outstanding task and wakes the reaper
	/// thread so it can observe `exiting` and eventually return.
	pub fn stop(&self) {
		self.inner.exiting.store(true, Ordering::SeqCst);
		{
			let tasks = self.inner.tasks.lock();
			for descriptor in tasks.values() {
				self.inner.kill_task(descriptor);
			}
		}
		self.inner.reap_semaphore.add_permits(1);
		if let Some(limiter) = &self.inner.cpu_limiter {
			limiter.stop();
		}
		if let Some(handle) = self.cleanup.lock().take() {
			handle.abort();
		}
	}

	/// Waits for the reaper thread to exit (which only happens once every
	/// outstanding child has been reaped) and, defensively, for every
	/// task's completion callback to have actually run before returning.
	pub async fn join(&self) {
		if let Some(handle) = self.reaper.lock().take() {
			let _ = tokio::task::spawn_blocking(move || handle.join()).await;
		}
		loop {
			let still_running = self.inner.tasks.lock().values().any(|d| d.is_running.load(Ordering::Relaxed));
			if !still_running {
				break;
			}
			tokio::time::sleep(Duration::from_millis(100)).await;
		}
		if let Some(limiter) = &self.inner.cpu_limiter {
			limiter.join().await;
		}
	}

	pub fn dump_internals(&self) -> serde_json::Value {
		let tasks = self.inner.tasks.lock();
		let mut jsv = json!({
			"max_tasks": self.inner.task_concurrency_limit,
			"running_tasks": self.inner.running_tasks.load(Ordering::Relaxed),
			"alive_tasks": tasks.len(),
			"tasks_run_ever": self.inner.tasks_run_ever.load(Ordering::Relaxed),
		});
		let map = jsv.as_object_mut().expect("constructed as an object above");
		for (id, descriptor) in tasks.iter() {
			let mut entry = descriptor.task.dump_internals();
			if let serde_json::Value::Object(ref mut entry_map) = entry {
				entry_map.insert("command".to_string(), json!(descriptor.command_line));
				if descriptor.is_running.load(Ordering::Relaxed) {
					entry_map.insert("state".to_string(), json!("RUNNING"));
				} else {
					entry_map.insert("state".to_string(), json!("DONE"));
					entry_map.insert("completed_at".to_string(), json!(*descriptor.completed_at_unix_secs.lock()));
					entry_map.insert("exit_code".to_string(), json!(*descriptor.exit_code.lock()));
					let stdout_size = std::fs::metadata(descriptor.stdout_file.lock().path()).map(|m| m.len()).unwrap_or(0);
					let stderr_size = std::fs::metadata(descriptor.stderr_file.lock().path()).map(|m| m.len()).unwrap_or(0);
					entry_map.insert("stdout_size".to_string(), json!(stdout_size));
					entry_map.insert("stderr_size".to_string(), json!(stderr_size));
				}
			}
			map.insert(id.to_string(), entry);
		}
		jsv
	}
}

fn more_work_to_do(inner: &Inner) -> bool {
	!inner.exiting.load(Ordering::Relaxed) || inner.running_tasks.load(Ordering::Relaxed) != 0
}

/// Runs on a dedicated OS thread: blocks (via a synchronously-acquired
/// semaphore permit) until there's reason to believe a child has exited,
/// then blocks in `waitpid` for any child, and hands the result back to the
/// async runtime. Ported from `ProcessWaiterProc`.
fn process_waiter_loop(inner: Arc<Inner>) {
	while more_work_to_do(&inner) {
		let permit = inner.runtime.block_on(inner.reap_semaphore.acquire());
		match permit {
			Ok(permit) => permit.forget(),
			Err(_) => break, // semaphore closed, we're tearing down
		}
		if !more_work_to_do(&inner) {
			break;
		}

		match wait::waitpid(None, None) {
			Ok(WaitStatus::Exited(pid, code)) => {
				let inner = inner.clone();
				inner.runtime.spawn(async move { on_process_exit(inner, pid, code).await });
			}
			Ok(WaitStatus::Signaled(pid, signal, _)) => {
				tracing::warn!(target: LOG_TARGET, pid = pid.as_raw(), ?signal, "process exited abnormally");
				let inner = inner.clone();
				inner.runtime.spawn(async move { on_process_exit(inner, pid, -1).await });
			}
			Ok(_) => {
				// A `WUNTRACED`/`WCONTINUED`-only status we didn't ask for;
				// nothing to reap.
			}
			Err(nix::errno::Errno::ECHILD) => {
				if inner.exiting.load(Ordering::Relaxed) {
					break;
				}
				// Spurious: a permit arrived for a child that's already
				// been reaped by a concurrent waitpid. Loop and re-check.
			}
			Err(error) => {
				servant_common::warn_throttled!(target: LOG_TARGET, %error, "waitpid failed");
			}
		}
	}
}

async fn on_process_exit(inner: Arc<Inner>, pid: Pid, exit_code: i32) {
	let descriptor = {
		let tasks = inner.tasks.lock();
		tasks.values().find(|d| d.process_group == pid).cloned()
	};

	inner.running_tasks.fetch_sub(1, Ordering::Relaxed);
	if let Some(limiter) = &inner.cpu_limiter {
		limiter.remove(pid);
	}

	let Some(descriptor) = descriptor else {
		servant_common::warn_throttled!(target: LOG_TARGET, pid = pid.as_raw(), "exit event for unknown process");
		return;
	};

	if exit_code == -1 {
		tracing::warn!(target: LOG_TARGET, command = %descriptor.command_line, "command failed unexpectedly");
	}

	*descriptor.completed_at.lock() = Some(Instant::now());
	*descriptor.completed_at_unix_secs.lock() =
		Some(SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0));
	*descriptor.exit_code.lock() = Some(exit_code);
	descriptor.is_running.store(false, Ordering::Release);

	let stdout = descriptor.stdout_file.lock().read_all().unwrap_or_default();
	let stderr = descriptor.stderr_file.lock().read_all().unwrap_or_default();
	descriptor.task.on_completion(exit_code, stdout, stderr);
	descriptor.completion.notify_waiters();
}

async fn cleanup_loop(inner: Arc<Inner>) {
	let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
	loop {
		interval.tick().await;
		let now = Instant::now();
		let mut freed = 0;
		{
			let mut tasks = inner.tasks.lock();
			tasks.retain(|_, descriptor| {
				let expired = !descriptor.is_running.load(Ordering::Relaxed)
					&& descriptor.completed_at.lock().is_some_and(|at| now.duration_since(at) > ORPHAN_RETENTION);
				if expired {
					freed += 1;
				}
				!expired
			});
		}
		if freed > 0 {
			tracing::warn!(target: LOG_TARGET, freed, "freed completed tasks that seem unclaimed");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::task::test_support::RecordingTask;

	fn config(temp_dir: &std::path::Path) -> EngineConfig {
		EngineConfig {
			max_remote_tasks: 2,
			servant_priority: ServantPriority::User,
			min_memory_for_starting_new_task_bytes: 0,
			poor_machine_threshold_processors: 0,
			temp_dir: temp_dir.to_path_buf(),
		}
	}

	#[tokio::test]
	async fn queues_waits_and_reaps_a_trivial_command() {
		let dir = tempfile::tempdir().unwrap();
		let engine = ExecutionEngine::new(config(dir.path()));

		let task = Box::new(RecordingTask::new("true", Vec::new()));
		let task_id = engine.queue_task(GrantId(1), task).expect("admitted");

		let outcome = tokio::time::timeout(Duration::from_secs(5), async {
			loop {
				match engine.wait_for_task(task_id, Duration::from_millis(200)).await {
					WaitOutcome::Running => continue,
					other => return other,
				}
			}
		})
		.await
		.expect("task completed within timeout");

		assert!(matches!(outcome, WaitOutcome::Done(_)));
		engine.free_task(task_id);
		engine.stop();
		engine.join().await;
	}

	#[tokio::test]
	async fn rejects_tasks_once_concurrency_limit_is_hit() {
		let dir = tempfile::tempdir().unwrap();
		let mut cfg = config(dir.path());
		cfg.max_remote_tasks = 0;
		let engine = ExecutionEngine::new(cfg);

		assert_eq!(engine.queue_task(GrantId(1), Box::new(RecordingTask::new("true", Vec::new()))), None);
		assert!(matches!(engine.get_maximum_tasks(), Err(NotAcceptingTaskReason::UserInstructed)));
		engine.stop();
		engine.join().await;
	}

	#[tokio::test]
	async fn free_task_before_completion_kills_the_child() {
		let dir = tempfile::tempdir().unwrap();
		let engine = ExecutionEngine::new(config(dir.path()));

		let task_id = engine.queue_task(GrantId(1), Box::new(RecordingTask::new("sleep 30", Vec::new()))).expect("admitted");
		engine.free_task(task_id);
		assert!(matches!(engine.wait_for_task(task_id, Duration::from_millis(50)).await, WaitOutcome::NotFound));
		engine.stop();
		engine.join().await;
	}

	#[tokio::test]
	async fn reference_task_keeps_it_alive_across_one_free() {
		let dir = tempfile::tempdir().unwrap();
		let engine = ExecutionEngine::new(config(dir.path()));

		let task_id = engine.queue_task(GrantId(1), Box::new(RecordingTask::new("true", Vec::new()))).expect("admitted");
		assert!(engine.reference_task(task_id));
		engine.free_task(task_id);
		// One reference remains; the descriptor should still resolve.
		assert!(!matches!(engine.wait_for_task(task_id, Duration::from_millis(50)).await, WaitOutcome::NotFound));
		engine.free_task(task_id);
		engine.stop();
		engine.join().await;
	}
}
