//! Wire contract for the servant → scheduler heartbeat (§4.6/§6), ported
//! from `original_source/yadcc/daemon/cloud/daemon_service_impl.cc`'s
//! `Heartbeat` method: the request it builds each tick and the response
//! fields (expired grants, acceptable tokens) it applies.
//!
//! This lives in `servant-common`, not in `servant-scheduler-sim`, because
//! it is genuinely production code: `servant-daemon`'s real heartbeat loop
//! depends on it to talk to a real scheduler. `servant-scheduler-sim`
//! depends on these same types to implement [`SchedulerServiceServer`]
//! against its in-process test double, but defining the protocol itself is
//! not that crate's concern.

use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;
use serde::{Deserialize, Serialize};

use crate::config::{NotAcceptingTaskReason, ServantPriority};
use crate::ids::EnvironmentDescriptor;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
	pub token: String,
	pub next_heartbeat_in_ms: u64,
	pub version: String,
	pub location: String,
	pub servant_priority: ServantPriority,
	pub memory_available_bytes: u64,
	pub total_memory_bytes: u64,
	pub capacity: u32,
	pub not_accepting_task_reason: Option<NotAcceptingTaskReason>,
	pub num_processors: usize,
	pub current_load: usize,
	pub env_descs: Vec<EnvironmentDescriptor>,
	/// Grant ids of tasks this servant is currently running.
	pub running_tasks: Vec<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
	/// Grant ids the servant reported that the scheduler no longer
	/// considers valid; the servant kills them on receipt.
	pub expired_tasks: Vec<u64>,
	pub acceptable_tokens: Vec<String>,
}

#[rpc(client, server, namespace = "scheduler")]
pub trait SchedulerService {
	#[method(name = "heartbeat")]
	async fn heartbeat(&self, request: HeartbeatRequest) -> RpcResult<HeartbeatResponse>;
}
