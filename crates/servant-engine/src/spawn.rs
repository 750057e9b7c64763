//! Child process launch, ported from the spawn half of
//! `original_source/yadcc/daemon/cloud/execution_engine.cc`'s `TryQueueTask`
//! (the original delegates to a separate `execute_command.h`, not present in
//! the retrieved sources; this reconstructs the one call site's contract:
//! a niced, isolated-process-group child with its stdio redirected to
//! caller-supplied files).

use std::fs::File;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use nix::unistd::Pid;
use thiserror::Error;

/// Matches the original's `kDefaultNiceLevel`.
const DEFAULT_NICE_LEVEL: i32 = 5;

#[derive(Debug, Error)]
pub enum SpawnError {
	#[error("failed to spawn child process: {0}")]
	Spawn(#[source] io::Error),
}

/// Spawns `/bin/sh -c <command_line>` in its own process group (so the
/// engine can later kill the whole tree with one `kill(-pid, SIGKILL)`),
/// niced to [`DEFAULT_NICE_LEVEL`], with stdio redirected to the given
/// files. Returns the child's pid, which is also its process group id.
pub fn spawn_in_new_group(command_line: &str, stdin: File, stdout: File, stderr: File) -> Result<Pid, SpawnError> {
	let mut command = Command::new("/bin/sh");
	command.arg("-c").arg(command_line);
	command.stdin(Stdio::from(stdin));
	command.stdout(Stdio::from(stdout));
	command.stderr(Stdio::from(stderr));
	// A new, isolated process group rooted at the child itself.
	command.process_group(0);

	// SAFETY: the closure only calls an async-signal-safe libc function
	// between fork and exec, and touches no Rust-side shared state.
	unsafe {
		command.pre_exec(|| {
			if libc::setpriority(libc::PRIO_PROCESS, 0, DEFAULT_NICE_LEVEL) != 0 {
				return Err(io::Error::last_os_error());
			}
			Ok(())
		});
	}

	let child = command.spawn().map_err(SpawnError::Spawn)?;
	Ok(Pid::from_raw(child.id() as i32))
}
