//! An in-process test double for the scheduler side of the heartbeat
//! protocol, ported from
//! `original_source/yadcc/scheduler/running_task_bookkeeper.h` (what the
//! real scheduler does with the `running_tasks` field once a heartbeat
//! arrives). The wire contract itself
//! ([`HeartbeatRequest`]/[`HeartbeatResponse`]/`SchedulerService`) lives in
//! `servant_common::scheduler_protocol` — it's production code the real
//! daemon depends on, not test scaffolding — and is re-exported here for
//! convenience.
//!
//! The real scheduler's placement algorithm is out of scope for this
//! workspace; [`SchedulerSim`] exists only so `servant-daemon`'s heartbeat
//! loop can be exercised end to end in tests without a real scheduler.

use std::collections::HashSet;
use std::sync::Arc;

use jsonrpsee::core::{async_trait, RpcResult};
use parking_lot::Mutex;
pub use servant_common::scheduler_protocol::{HeartbeatRequest, HeartbeatResponse, SchedulerServiceClient, SchedulerServiceServer};

use crate::bookkeeper::{RunningTask, RunningTaskBookkeeper};

/// Everything the simulator needs to know to answer a heartbeat: which
/// grants are still valid cluster-wide, and which tokens are currently
/// allowed to submit work.
struct State {
	valid_grants: HashSet<u64>,
	acceptable_tokens: HashSet<String>,
}

/// A minimal in-process scheduler. Grant validity and the acceptable-token
/// set are test-controlled rather than derived from any placement logic.
pub struct SchedulerSim {
	state: Mutex<State>,
	bookkeeper: Arc<RunningTaskBookkeeper>,
}

impl SchedulerSim {
	pub fn new() -> Self {
		Self { state: Mutex::new(State { valid_grants: HashSet::new(), acceptable_tokens: HashSet::new() }), bookkeeper: Arc::new(RunningTaskBookkeeper::new()) }
	}

	pub fn bookkeeper(&self) -> Arc<RunningTaskBookkeeper> {
		self.bookkeeper.clone()
	}

	pub fn admit_grant(&self, grant_id: u64) {
		self.state.lock().valid_grants.insert(grant_id);
	}

	pub fn revoke_grant(&self, grant_id: u64) {
		self.state.lock().valid_grants.remove(&grant_id);
	}

	pub fn set_acceptable_tokens(&self, tokens: impl IntoIterator<Item = String>) {
		self.state.lock().acceptable_tokens = tokens.into_iter().collect();
	}
}

impl Default for SchedulerSim {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl SchedulerServiceServer for SchedulerSim {
	async fn heartbeat(&self, request: HeartbeatRequest) -> RpcResult<HeartbeatResponse> {
		// A zero-expiry heartbeat is the servant's final one on shutdown; drop
		// its entry rather than recording an about-to-be-stale one.
		if request.next_heartbeat_in_ms == 0 {
			self.bookkeeper.drop_servant(&request.location);
		} else {
			let tasks = request.running_tasks.iter().map(|&servant_task_id| RunningTask { servant_task_id }).collect();
			self.bookkeeper.set_servant_running_tasks(request.location.clone(), tasks);
		}

		let state = self.state.lock();
		let expired_tasks = request.running_tasks.into_iter().filter(|id| !state.valid_grants.contains(id)).collect();
		let acceptable_tokens = state.acceptable_tokens.iter().cloned().collect();

		Ok(HeartbeatResponse { expired_tasks, acceptable_tokens })
	}
}

/// Lets a server be started from a shared handle the test also holds onto
/// (e.g. to call [`SchedulerSim::set_acceptable_tokens`] after the server is
/// already serving), without requiring [`SchedulerSim`] itself to be `Clone`.
#[async_trait]
impl SchedulerServiceServer for Arc<SchedulerSim> {
	async fn heartbeat(&self, request: HeartbeatRequest) -> RpcResult<HeartbeatResponse> {
		(**self).heartbeat(request).await
	}
}
