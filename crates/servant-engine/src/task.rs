//! The engine-facing task abstraction, ported from
//! `original_source/yadcc/daemon/cloud/execution_task.h`. The engine itself
//! never knows what a task's command line means or what it does with its
//! output; it only drives this interface.

/// A unit of work the execution engine can run as a child process.
///
/// Implementations typically carry an environment descriptor, invocation
/// arguments and a source digest (the daemon service's `JobContext`), and
/// use [`on_completion`](ExecutionTask::on_completion) to populate the
/// distributed cache and unblock a later `WaitForCompilationOutput` call.
pub trait ExecutionTask: Send + Sync {
	/// The command line to execute, logged verbatim and run through a shell.
	fn command_line(&self) -> String;

	/// Returns the bytes to feed the child's standard input.
	///
	/// The engine calls this exactly once, before the child is spawned, so
	/// implementations are free to move their buffer out here instead of
	/// cloning it.
	fn take_stdin(&mut self) -> Vec<u8>;

	/// Called once the child has exited, with its exit code (`-1` if it
	/// didn't exit normally) and captured stdout/stderr.
	fn on_completion(&self, exit_code: i32, stdout: Vec<u8>, stderr: Vec<u8>);

	/// Debug/expository dump, merged into the engine's own `dump_internals`
	/// output under this task's id.
	fn dump_internals(&self) -> serde_json::Value;

	/// Lets a caller holding the type-erased handle the engine hands back
	/// from [`wait_for_task`](crate::ExecutionEngine::wait_for_task)
	/// recover its concrete type, mirroring the original's
	/// `static_cast<JobContext*>(output->context.get())`.
	fn as_any(&self) -> &dyn std::any::Any;
}
