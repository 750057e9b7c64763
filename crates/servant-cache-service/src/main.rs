//! `compute-servant-cached`: the cluster-shared compilation cache service
//! every servant's `DistributedCacheWriter` populates over RPC. Wraps a
//! [`servant_cache::CacheEngine`] (object-store-backed or null, selected by
//! flag) behind the `CacheService` contract, and separately drives the
//! engine's own eviction scan/purge cycle on a fixed interval so capacity is
//! enforced even when no RPC traffic is arriving to trigger it.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use jsonrpsee::server::ServerBuilder;
use servant_cache::{build_cache_engine, CacheEngine, CacheServiceImpl, CacheServiceServer};
use servant_common::size::parse_size;

const LOG_TARGET: &str = "servant::cache_service";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Parser)]
#[command(name = "compute-servant-cached", about = "Cluster-shared compilation cache service")]
struct Config {
	/// Cache engine backend to use: `object-store` or `null`.
	#[arg(long, env = "SERVANT_CACHE_ENGINE", default_value = "object-store")]
	cache_engine: String,

	/// `object_store`-compatible URL for the cache backend, e.g.
	/// `s3://bucket/prefix` or `file:///var/cache/compute-servant`.
	#[arg(long, env = "SERVANT_CACHE_URI")]
	cache_uri: Option<String>,

	/// Prefix namespacing this deployment's entries within the backing
	/// store, so multiple unrelated workloads can share one bucket.
	#[arg(long, env = "SERVANT_CACHE_ROOT_PREFIX", default_value = "yadcc-cache")]
	cache_root_prefix: String,

	/// Total size budget before old entries are queued for eviction.
	#[arg(long, env = "SERVANT_CACHE_CAPACITY", default_value = "10G")]
	cache_capacity: String,

	/// How often to re-run the enumeration/eviction scan and drain whatever
	/// it queues for removal, independent of RPC traffic.
	#[arg(long, env = "SERVANT_CACHE_SWEEP_INTERVAL_SECONDS", default_value_t = 60)]
	sweep_interval_seconds: u64,

	/// Local address this service listens on.
	#[arg(long, env = "SERVANT_CACHE_LISTEN_ADDR", default_value = "127.0.0.1:8335")]
	listen_addr: String,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
	tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

	let config = Config::parse();
	let capacity_bytes = parse_size(&config.cache_capacity)?;
	let engine = build_cache_engine(&config.cache_engine, config.cache_uri.as_deref(), &config.cache_root_prefix, capacity_bytes)?;
	tracing::info!(target: LOG_TARGET, backend = %config.cache_engine, capacity_bytes, "cache engine ready");

	let server = ServerBuilder::default().build(&config.listen_addr).await?;
	let server_addr = server.local_addr()?;
	let handle = server.start(CacheServiceImpl::new(engine.clone()).into_rpc());
	tracing::info!(target: LOG_TARGET, addr = %server_addr, "cache service listening");

	let sweep_interval = Duration::from_secs(config.sweep_interval_seconds);
	let sweep_task = tokio::spawn(sweep_loop(engine, sweep_interval));

	tokio::signal::ctrl_c().await?;
	tracing::info!(target: LOG_TARGET, "received shutdown signal");

	sweep_task.abort();
	handle.stop().ok();
	handle.stopped().await;

	Ok(())
}

/// Periodically re-enumerates the cache (which, for capacity-bounded
/// backends, is also where entries past capacity get queued for removal)
/// and drains that queue, so eviction keeps up even during a quiet period
/// with no `putEntry` traffic.
async fn sweep_loop(engine: Arc<dyn CacheEngine>, interval: Duration) {
	let mut ticker = tokio::time::interval(interval);
	ticker.tick().await; // first tick fires immediately; skip it.
	loop {
		ticker.tick().await;
		let retained = engine.keys().await.len();
		let purged = engine.purge().await;
		if purged > 0 {
			tracing::info!(target: LOG_TARGET, retained, purged, "eviction sweep complete");
		} else {
			tracing::debug!(target: LOG_TARGET, retained, "eviction sweep complete, nothing to purge");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn command_is_well_formed() {
		use clap::CommandFactory;
		Config::command().debug_assert();
	}

	#[test]
	fn defaults_select_object_store_backend_on_the_cache_service_port() {
		let config = Config::parse_from(["compute-servant-cached"]);
		assert_eq!(config.cache_engine, "object-store");
		assert_eq!(config.listen_addr, "127.0.0.1:8335");
	}
}
