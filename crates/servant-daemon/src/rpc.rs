//! The Daemon Service wire contract (servant ↔ client wrapper), ported from
//! `original_source/yadcc/daemon/cloud/daemon_service_impl.{h,cc}`'s four
//! RPC methods. Zstd compression is mandatory throughout (§6), so the
//! contract never negotiates an algorithm — unlike the original's
//! `compression_algorithm`/`acceptable_compression_algorithms` fields, this
//! one simply rejects a request that doesn't honor it.

use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;
use serde::{Deserialize, Serialize};
use servant_common::EnvironmentDescriptor;

/// RPC-level error codes surfaced as `jsonrpsee` error objects, standing in
/// for the original's `controller->SetFailed(STATUS_X)` status codes (§7).
pub mod error_code {
	pub const ACCESS_DENIED: i32 = -32001;
	pub const ENVIRONMENT_NOT_AVAILABLE: i32 = -32002;
	pub const HEAVILY_LOADED: i32 = -32003;
	pub const BAD_INPUT: i32 = -32004;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueCompilationTaskRequest {
	pub token: String,
	pub task_grant_id: u64,
	pub environment: EnvironmentDescriptor,
	pub invocation_arguments: Vec<String>,
	/// Zstd-compressed source code. Decompression failure is a `BAD_INPUT`
	/// error, matching the original's "Failed to decompress source code."
	pub compressed_source: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitForCompilationOutputRequest {
	pub token: String,
	pub task_id: u64,
	/// Capped server-side at 10s (§5 "Timeouts").
	pub milliseconds_to_wait: u64,
	/// The caller must be able to accept a Zstd-compressed response;
	/// anything else is `BAD_INPUT`, matching the original's "Support for
	/// Zstd is mandatory."
	pub accepts_zstd: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CompilationTaskStatus {
	Running,
	/// The task finished — including by being killed, in which case
	/// `exit_code` is `-1`. `compressed_artifact` is only populated when
	/// `exit_code == 0`; a failed compile carries its streams but no object
	/// file, and is never written to the distributed cache.
	Done { exit_code: i32, compressed_stdout: Vec<u8>, compressed_stderr: Vec<u8>, compressed_artifact: Vec<u8> },
	/// Reserved for a completion the engine itself treats as an outright
	/// failure (the original's `ExecutionStatus::Failed`); this engine
	/// always resolves a finished task to `Done`, abnormal exit included, so
	/// this variant is never emitted but is kept in the wire contract for
	/// parity with §6's error code set.
	Failed,
	NotFound,
}

#[rpc(client, server, namespace = "daemon")]
pub trait DaemonService {
	/// Submits one compile job under `task_grant_id`. Returns the newly
	/// allocated servant task id on admission.
	#[method(name = "queueCompilationTask")]
	async fn queue_compilation_task(&self, request: QueueCompilationTaskRequest) -> RpcResult<u64>;

	/// Idempotently adds another waiter reference to an already-queued task.
	#[method(name = "referenceTask")]
	async fn reference_task(&self, token: String, task_id: u64) -> RpcResult<bool>;

	#[method(name = "waitForCompilationOutput")]
	async fn wait_for_compilation_output(&self, request: WaitForCompilationOutputRequest) -> RpcResult<CompilationTaskStatus>;

	/// Releases one waiter reference, killing the task if it was the last one.
	#[method(name = "freeTask")]
	async fn free_task(&self, token: String, task_id: u64) -> RpcResult<()>;
}
