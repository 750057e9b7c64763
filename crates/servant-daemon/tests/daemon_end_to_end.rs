//! End-to-end scenarios wiring the daemon's RPC surface, execution engine
//! and heartbeat loop against an in-process scheduler and cache service:
//! token churn and grant-expiry kill, matching spec.md §8's scenarios 3 and 4
//! (the other four scenarios are already exercised inline alongside the
//! modules they test).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use jsonrpsee::http_client::HttpClientBuilder;
use jsonrpsee::server::{ServerBuilder, ServerHandle};
use servant_cache::{CacheServiceImpl, CacheServiceServer, NullCacheEngine};
use servant_common::config::ServantPriority;
use servant_common::EnvironmentDescriptor;
use servant_daemon::heartbeat::{send_heartbeat, HeartbeatConfig, HeartbeatContext};
use servant_daemon::rpc::{error_code, CompilationTaskStatus, QueueCompilationTaskRequest, WaitForCompilationOutputRequest};
use servant_daemon::{CompilerRegistry, DaemonServiceImpl, DaemonServiceServer, TokenVerifier};
use servant_distcache::DistributedCacheWriter;
use servant_engine::{EngineConfig, ExecutionEngine};
use servant_scheduler_sim::SchedulerSim;
use servant_sysinfo::SysinfoProbe;

fn env() -> EnvironmentDescriptor {
	EnvironmentDescriptor::new("x86_64-unknown-linux-gnu", "11.2", [1u8; 32])
}

async fn start_cache_server() -> (SocketAddr, ServerHandle) {
	let server = ServerBuilder::default().build("127.0.0.1:0").await.unwrap();
	let addr = server.local_addr().unwrap();
	let module = CacheServiceImpl::new(Arc::new(NullCacheEngine)).into_rpc();
	(addr, server.start(module))
}

async fn start_scheduler() -> (SocketAddr, ServerHandle, Arc<SchedulerSim>) {
	let sim = Arc::new(SchedulerSim::new());
	let server = ServerBuilder::default().build("127.0.0.1:0").await.unwrap();
	let addr = server.local_addr().unwrap();
	let module = sim.clone().into_rpc();
	(addr, server.start(module), sim)
}

struct Harness {
	service: DaemonServiceImpl,
	engine: Arc<ExecutionEngine>,
	token_verifier: Arc<TokenVerifier>,
	cache_handle: ServerHandle,
	scheduler_handle: ServerHandle,
	sim: Arc<SchedulerSim>,
	heartbeat_config: HeartbeatConfig,
	heartbeat_context: HeartbeatContext,
}

async fn build_harness(temp_dir: &std::path::Path, compilers: Vec<(EnvironmentDescriptor, PathBuf)>) -> Harness {
	let (cache_addr, cache_handle) = start_cache_server().await;
	let (scheduler_addr, scheduler_handle, sim) = start_scheduler().await;

	let engine = Arc::new(ExecutionEngine::new(EngineConfig {
		max_remote_tasks: 2,
		servant_priority: ServantPriority::User,
		min_memory_for_starting_new_task_bytes: 0,
		poor_machine_threshold_processors: 0,
		temp_dir: temp_dir.to_path_buf(),
	}));
	let compiler_registry = Arc::new(CompilerRegistry::from_entries(compilers));
	let token_verifier = Arc::new(TokenVerifier::new());
	let writer = Arc::new(DistributedCacheWriter::new(&format!("http://{cache_addr}")).unwrap());

	let service = DaemonServiceImpl::new(engine.clone(), compiler_registry.clone(), token_verifier.clone(), writer, temp_dir.to_path_buf());

	let heartbeat_config = HeartbeatConfig {
		scheduler_uri: format!("http://{scheduler_addr}"),
		token: "t1".to_string(),
		version: "0.1.0".to_string(),
		location: "127.0.0.1:8334".to_string(),
		servant_priority: ServantPriority::User,
		cpu_load_average: Duration::from_secs(10),
	};
	let heartbeat_context = HeartbeatContext { engine: engine.clone(), compiler_registry, token_verifier: token_verifier.clone(), sysinfo: Arc::new(SysinfoProbe::new()) };

	Harness { service, engine, token_verifier, cache_handle, scheduler_handle, sim, heartbeat_config, heartbeat_context }
}

impl Harness {
	async fn heartbeat(&self) {
		let client = HttpClientBuilder::default().build(&self.heartbeat_config.scheduler_uri).unwrap();
		send_heartbeat(&client, &self.heartbeat_config, &self.heartbeat_context, Duration::from_secs(10)).await;
	}

	async fn teardown(self) {
		self.engine.stop();
		self.engine.join().await;
		self.cache_handle.stop().unwrap();
		self.cache_handle.stopped().await;
		self.scheduler_handle.stop().unwrap();
		self.scheduler_handle.stopped().await;
	}
}

#[tokio::test]
async fn token_churn_revokes_access_after_the_next_heartbeat() {
	let dir = tempfile::tempdir().unwrap();
	let harness = build_harness(dir.path(), vec![(env(), PathBuf::from("/bin/true"))]).await;

	harness.sim.set_acceptable_tokens(["t1".to_string()]);
	harness.heartbeat().await;
	assert!(harness.token_verifier.verify("t1"));

	let source = zstd::stream::encode_all(&b""[..], 0).unwrap();
	let task_id = harness
		.service
		.queue_compilation_task(QueueCompilationTaskRequest { token: "t1".to_string(), task_grant_id: 1, environment: env(), invocation_arguments: vec![], compressed_source: source.clone() })
		.await
		.unwrap();
	harness.service.free_task("t1".to_string(), task_id).await.unwrap();

	// The scheduler now only accepts a rotated token; the next heartbeat
	// must flip the ACL so a previously-valid token is rejected immediately.
	harness.sim.set_acceptable_tokens(["t2".to_string()]);
	harness.heartbeat().await;
	assert!(!harness.token_verifier.verify("t1"));
	assert!(harness.token_verifier.verify("t2"));

	let result = harness
		.service
		.queue_compilation_task(QueueCompilationTaskRequest { token: "t1".to_string(), task_grant_id: 2, environment: env(), invocation_arguments: vec![], compressed_source: source })
		.await;
	assert_eq!(result.unwrap_err().code(), error_code::ACCESS_DENIED);

	harness.teardown().await;
}

#[tokio::test]
async fn an_expired_grant_kills_its_running_task() {
	let dir = tempfile::tempdir().unwrap();
	let harness = build_harness(dir.path(), vec![(env(), PathBuf::from("/bin/sh"))]).await;

	harness.sim.set_acceptable_tokens(["t1".to_string()]);
	harness.sim.admit_grant(42);
	harness.heartbeat().await;

	let source = zstd::stream::encode_all(&b""[..], 0).unwrap();
	// See service.rs's concurrency test for why this reaches a real `sleep`
	// despite the trailing "-o <path>" always appended to the command line.
	let task_id = harness
		.service
		.queue_compilation_task(QueueCompilationTaskRequest {
			token: "t1".to_string(),
			task_grant_id: 42,
			environment: env(),
			invocation_arguments: vec!["-c".to_string(), "'sleep 30'".to_string()],
			compressed_source: source,
		})
		.await
		.unwrap();

	// One heartbeat while the grant is still valid: the task must not be
	// reported expired.
	harness.heartbeat().await;
	let status = harness
		.service
		.wait_for_compilation_output(WaitForCompilationOutputRequest { token: "t1".to_string(), task_id, milliseconds_to_wait: 50, accepts_zstd: true })
		.await
		.unwrap();
	assert!(matches!(status, CompilationTaskStatus::Running));

	// The scheduler revokes the grant; the following heartbeat must report it
	// expired and the engine must kill the task immediately.
	harness.sim.revoke_grant(42);
	harness.heartbeat().await;

	let status = tokio::time::timeout(Duration::from_secs(5), async {
		loop {
			let status = harness
				.service
				.wait_for_compilation_output(WaitForCompilationOutputRequest { token: "t1".to_string(), task_id, milliseconds_to_wait: 200, accepts_zstd: true })
				.await
				.unwrap();
			if !matches!(status, CompilationTaskStatus::Running) {
				break status;
			}
		}
	})
	.await
	.expect("killed task completes promptly");

	match status {
		CompilationTaskStatus::Done { exit_code, .. } => assert_eq!(exit_code, -1),
		other => panic!("expected Done with exit code -1, got {other:?}"),
	}

	harness.service.free_task("t1".to_string(), task_id).await.unwrap();
	harness.teardown().await;
}
