//! The periodic heartbeat to the scheduler, ported from
//! `original_source/yadcc/daemon/cloud/daemon_service_impl.cc`'s
//! `Heartbeat` method: the sole channel by which the scheduler's view of
//! expired grants and acceptable tokens reaches this servant (§9 "Heartbeat
//! as control plane").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use servant_common::config::{ServantPriority, NotAcceptingTaskReason};
use servant_common::scheduler_protocol::{HeartbeatRequest, SchedulerServiceClient};
use servant_common::GrantId;
use servant_engine::ExecutionEngine;
use servant_sysinfo::SysinfoProbe;
use thiserror::Error;

use crate::registry::CompilerRegistry;
use crate::token_verifier::TokenVerifier;

const LOG_TARGET: &str = "servant::heartbeat";

/// `HeartbeatRequest::next_heartbeat_in_ms`: the timer period (1s) plus
/// slack for network delay, matching the original's comment that the
/// expiry "must be greater than timer interval to a certain degree".
const HEARTBEAT_EXPIRY: Duration = Duration::from_secs(10);
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum HeartbeatError {
	#[error("failed to build scheduler client for {uri:?}: {source}")]
	Connect { uri: String, #[source] source: jsonrpsee::core::client::Error },
}

pub struct HeartbeatConfig {
	pub scheduler_uri: String,
	pub token: String,
	pub version: String,
	pub location: String,
	pub servant_priority: ServantPriority,
	pub cpu_load_average: Duration,
}

/// Everything the heartbeat loop samples fresh each tick.
pub struct HeartbeatContext {
	pub engine: Arc<ExecutionEngine>,
	pub compiler_registry: Arc<CompilerRegistry>,
	pub token_verifier: Arc<TokenVerifier>,
	pub sysinfo: Arc<SysinfoProbe>,
}

/// Sends one heartbeat and applies the scheduler's response: expired grants
/// are killed, and the acceptable-token set replaces the prior one — both
/// immediately and unconditionally (§5 "Ordering guarantees"). Exposed (not
/// just used internally by [`run`]) so integration tests can drive a single
/// heartbeat deterministically instead of waiting out the real timer period.
pub async fn send_heartbeat(client: &HttpClient, config: &HeartbeatConfig, context: &HeartbeatContext, next_heartbeat_in: Duration) {
	let (capacity, not_accepting_task_reason) = match context.engine.get_maximum_tasks() {
		Ok(capacity) => (capacity as u32, None),
		Err(reason) => (0, Some(reason)),
	};

	let current_load = context
		.sysinfo
		.try_processor_load(config.cpu_load_average)
		.unwrap_or_else(servant_sysinfo::processor_load_last_minute);

	let running_tasks = context.engine.enumerate_tasks().into_iter().map(|task| task.grant_id.0).collect();

	let request = HeartbeatRequest {
		token: config.token.clone(),
		next_heartbeat_in_ms: next_heartbeat_in.as_millis() as u64,
		version: config.version.clone(),
		location: config.location.clone(),
		servant_priority: config.servant_priority,
		memory_available_bytes: servant_sysinfo::memory_available_bytes().unwrap_or(0),
		total_memory_bytes: servant_sysinfo::total_memory_bytes().unwrap_or(0),
		capacity,
		not_accepting_task_reason,
		num_processors: servant_sysinfo::number_of_processors(),
		current_load,
		env_descs: context.compiler_registry.enumerate_environments(),
		running_tasks,
	};

	match client.heartbeat(request).await {
		Ok(response) => {
			let expired: std::collections::HashSet<GrantId> = response.expired_tasks.into_iter().map(GrantId).collect();
			context.engine.kill_expired_tasks(&expired);
			context.token_verifier.update(response.acceptable_tokens.into_iter().collect());
		}
		Err(error) => {
			servant_common::warn_throttled!(target: LOG_TARGET, %error, "failed to send heartbeat to scheduler");
		}
	}
}

/// Runs the 1s heartbeat timer until `shutdown` fires, at which point it
/// sends one final heartbeat with `next_heartbeat_in_ms = 0` to signal
/// departure, matching the original's `Stop()` → `Heartbeat(0ns)`.
pub async fn run(config: HeartbeatConfig, context: HeartbeatContext, shutdown: Arc<AtomicBool>) -> Result<(), HeartbeatError> {
	let client = HttpClientBuilder::default()
		.build(&config.scheduler_uri)
		.map_err(|source| HeartbeatError::Connect { uri: config.scheduler_uri.clone(), source })?;

	let mut interval = tokio::time::interval(HEARTBEAT_PERIOD);
	while !shutdown.load(Ordering::Relaxed) {
		interval.tick().await;
		if shutdown.load(Ordering::Relaxed) {
			break;
		}
		send_heartbeat(&client, &config, &context, HEARTBEAT_EXPIRY).await;
	}
	send_heartbeat(&client, &config, &context, Duration::ZERO).await;
	Ok(())
}
