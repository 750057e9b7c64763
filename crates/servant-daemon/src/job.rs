//! `JobContext`: the opaque per-task object the execution engine carries
//! for each admitted compile, ported in shape from
//! `original_source/yadcc/daemon/cloud/daemon_service_impl.cc`'s anonymous
//! `JobContext` struct.

use parking_lot::Mutex;
use servant_common::{EnvironmentDescriptor, TemporaryFile};
use servant_engine::ExecutionTask;

struct Completion {
	exit_code: i32,
	stdout: Vec<u8>,
	stderr: Vec<u8>,
}

/// The compiled object file: unread until the first
/// [`JobContext::prepare_for_read`] call, after which its bytes are cached
/// so a retried `WaitForCompilationOutput` observes the same content instead
/// of re-reading (and possibly re-failing against) a file the compiler may
/// since have removed.
enum ObjectFileSlot {
	Unread(TemporaryFile),
	Read(Vec<u8>),
}

/// Carries everything `QueueCompilationTask` learned about one job through
/// to completion: the fields needed to recompute its cache fingerprint, and
/// the compiled object file the compiler wrote to its `-o` target.
pub struct JobContext {
	pub environment: EnvironmentDescriptor,
	pub invocation_arguments: Vec<String>,
	pub source_digest: String,
	command_line: String,
	stdin: Mutex<Option<Vec<u8>>>,
	object_file: Mutex<ObjectFileSlot>,
	completion: Mutex<Option<Completion>>,
}

impl JobContext {
	pub fn new(
		environment: EnvironmentDescriptor,
		invocation_arguments: Vec<String>,
		source_digest: String,
		command_line: String,
		stdin: Vec<u8>,
		object_file: TemporaryFile,
	) -> Self {
		Self {
			environment,
			invocation_arguments,
			source_digest,
			command_line,
			stdin: Mutex::new(Some(stdin)),
			object_file: Mutex::new(ObjectFileSlot::Unread(object_file)),
			completion: Mutex::new(None),
		}
	}

	/// Mirrors `JobContext::PrepareForRead`: reads the object file's bytes
	/// exactly once, guarded by a mutex so a concurrent or retried caller
	/// observes the same cached bytes rather than racing the rewind-and-read.
	pub fn prepare_for_read(&self) -> Vec<u8> {
		let mut slot = self.object_file.lock();
		if let ObjectFileSlot::Read(bytes) = &*slot {
			return bytes.clone();
		}
		let ObjectFileSlot::Unread(mut file) = std::mem::replace(&mut *slot, ObjectFileSlot::Read(Vec::new())) else {
			unreachable!("just matched Unread above");
		};
		let bytes = file.read_all().unwrap_or_default();
		*slot = ObjectFileSlot::Read(bytes.clone());
		bytes
	}

	/// `None` while the task is still running; `Some` once the engine's
	/// exit callback has invoked [`ExecutionTask::on_completion`].
	pub fn completion(&self) -> Option<(i32, Vec<u8>, Vec<u8>)> {
		self.completion.lock().as_ref().map(|c| (c.exit_code, c.stdout.clone(), c.stderr.clone()))
	}
}

impl ExecutionTask for JobContext {
	fn command_line(&self) -> String {
		self.command_line.clone()
	}

	fn take_stdin(&mut self) -> Vec<u8> {
		self.stdin.get_mut().take().unwrap_or_default()
	}

	fn on_completion(&self, exit_code: i32, stdout: Vec<u8>, stderr: Vec<u8>) {
		*self.completion.lock() = Some(Completion { exit_code, stdout, stderr });
	}

	fn dump_internals(&self) -> serde_json::Value {
		serde_json::json!({
			"triple": self.environment.triple,
			"compiler_version": self.environment.compiler_version,
			"source_digest": self.source_digest,
			"invocation_arguments": self.invocation_arguments,
		})
	}

	fn as_any(&self) -> &dyn std::any::Any {
		self
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn context(stdin: &[u8]) -> (tempfile::TempDir, JobContext) {
		let dir = tempfile::tempdir().unwrap();
		let object_file = TemporaryFile::new_in(dir.path()).unwrap();
		let env = EnvironmentDescriptor::new("x86_64-unknown-linux-gnu", "11.2", [1u8; 32]);
		let ctx = JobContext::new(env, vec!["-c".to_string()], "digest".to_string(), "gcc -c -o out".to_string(), stdin.to_vec(), object_file);
		(dir, ctx)
	}

	#[test]
	fn take_stdin_returns_the_bytes_exactly_once() {
		let (_dir, mut ctx) = context(b"int main(){}");
		assert_eq!(ctx.take_stdin(), b"int main(){}".to_vec());
		assert_eq!(ctx.take_stdin(), Vec::<u8>::new());
	}

	#[test]
	fn prepare_for_read_caches_the_bytes_across_calls() {
		let (_dir, ctx) = context(b"");
		if let ObjectFileSlot::Unread(file) = &mut *ctx.object_file.lock() {
			file.write_all(b"compiled-object").unwrap();
		}
		assert_eq!(ctx.prepare_for_read(), b"compiled-object".to_vec());
		// Second call must not try to re-read the (by-now-consumed) file.
		assert_eq!(ctx.prepare_for_read(), b"compiled-object".to_vec());
	}

	#[test]
	fn completion_is_none_until_on_completion_runs() {
		let (_dir, ctx) = context(b"");
		assert!(ctx.completion().is_none());
		ctx.on_completion(0, b"out".to_vec(), b"err".to_vec());
		assert_eq!(ctx.completion(), Some((0, b"out".to_vec(), b"err".to_vec())));
	}
}
