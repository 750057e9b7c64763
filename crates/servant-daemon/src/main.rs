//! `compute-servantd`: starts the Daemon Service RPC surface, the execution
//! engine, the 1 Hz sysinfo sampler and the scheduler heartbeat loop, and
//! tears all four down cleanly on `SIGINT`/`SIGTERM`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use jsonrpsee::server::ServerBuilder;
use servant_common::config::Config;
use servant_daemon::heartbeat::{self, HeartbeatConfig, HeartbeatContext};
use servant_daemon::{CompilerRegistry, DaemonServiceImpl, DaemonServiceServer, TokenVerifier};
use servant_distcache::DistributedCacheWriter;
use servant_engine::{EngineConfig, ExecutionEngine};
use servant_sysinfo::SysinfoProbe;

const LOG_TARGET: &str = "servant::daemon";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
	tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

	let config = Config::parse();
	let temp_dir = servant_sysinfo::determine_temporary_dir(config.temporary_dir.as_deref());
	std::fs::create_dir_all(&temp_dir)?;
	tracing::info!(target: LOG_TARGET, dir = %temp_dir.display(), "using scratch directory");

	let compiler_registry = Arc::new(CompilerRegistry::load(config.compiler_registry_path.as_deref())?);
	tracing::info!(target: LOG_TARGET, environments = compiler_registry.enumerate_environments().len(), "compiler registry loaded");

	let token_verifier = Arc::new(TokenVerifier::new());

	let engine = Arc::new(ExecutionEngine::new(EngineConfig {
		max_remote_tasks: config.max_remote_tasks,
		servant_priority: config.servant_priority,
		min_memory_for_starting_new_task_bytes: config.min_memory_for_starting_new_task_bytes()?,
		poor_machine_threshold_processors: config.poor_machine_threshold_processors,
		temp_dir: temp_dir.clone(),
	}));

	let cache_service_uri = resolve_cache_service_uri(&config);
	let distcache_writer = Arc::new(DistributedCacheWriter::new(&cache_service_uri)?);

	let sysinfo = Arc::new(SysinfoProbe::new());
	let sampling_task = servant_sysinfo::spawn_sampling_task(sysinfo.clone());

	let service = DaemonServiceImpl::new(engine.clone(), compiler_registry.clone(), token_verifier.clone(), distcache_writer.clone(), temp_dir);

	let server = ServerBuilder::default().build(&config.listen_addr).await?;
	let server_addr = server.local_addr()?;
	let handle = server.start(service.into_rpc());
	tracing::info!(target: LOG_TARGET, addr = %server_addr, "daemon service listening");

	let shutdown = Arc::new(AtomicBool::new(false));
	let heartbeat_task = tokio::spawn(heartbeat::run(
		HeartbeatConfig {
			scheduler_uri: config.scheduler_uri.clone(),
			token: config.token.clone(),
			version: env!("CARGO_PKG_VERSION").to_string(),
			location: config.listen_addr.clone(),
			servant_priority: config.servant_priority,
			cpu_load_average: std::time::Duration::from_secs(config.cpu_load_average_seconds),
		},
		HeartbeatContext { engine: engine.clone(), compiler_registry, token_verifier, sysinfo },
		shutdown.clone(),
	));

	tokio::signal::ctrl_c().await?;
	tracing::info!(target: LOG_TARGET, "received shutdown signal, draining outstanding tasks");

	shutdown.store(true, Ordering::SeqCst);
	let _ = heartbeat_task.await;

	handle.stop().ok();
	handle.stopped().await;

	engine.stop();
	engine.join().await;

	distcache_writer.stop();
	distcache_writer.join().await;

	sampling_task.abort();

	Ok(())
}

/// The cache service is, in practice, co-located with the scheduler; absent
/// an explicit override this reuses the scheduler's host with the cache
/// service's own RPC port.
fn resolve_cache_service_uri(config: &Config) -> String {
	if let Some(uri) = &config.cache_service_uri {
		return uri.clone();
	}
	match config.scheduler_uri.rsplit_once(':') {
		Some((host, _port)) => format!("{host}:8335"),
		None => config.scheduler_uri.clone(),
	}
}
