//! Asynchronous population of the cluster-shared compilation cache, ported
//! from `original_source/yadcc/daemon/cloud/distributed_cache_writer.h`.
//!
//! Reading and writing the distributed cache are deliberately kept as
//! separate concerns (the reader side lives with the cache engine itself,
//! in `servant-cache`): anyone who can act as a compute servant can already
//! run arbitrary compiler invocations, so letting that same actor write
//! cache entries is no additional trust extended, but a cache *reader* is a
//! different client population.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use parking_lot::Mutex;
use servant_cache::CacheServiceClient;
use servant_common::CacheKey;
use thiserror::Error;
use tokio::task::JoinHandle;

const LOG_TARGET: &str = "servant::distcache";

#[derive(Debug, Error)]
pub enum DistCacheError {
	#[error("failed to build cache service client for {uri:?}: {source}")]
	Connect { uri: String, #[source] source: jsonrpsee::core::client::Error },
}

/// Fire-and-forget writer for the cluster-shared compilation cache.
///
/// [`async_write`](Self::async_write) never propagates a failure: the
/// compile RPC it's called from has already succeeded regardless of
/// whether the cache gets populated, matching the original discarding
/// `AsyncWrite`'s returned future with `(void)`.
pub struct DistributedCacheWriter {
	client: Arc<HttpClient>,
	exiting: AtomicBool,
	outstanding: Mutex<Vec<JoinHandle<()>>>,
}

impl DistributedCacheWriter {
	pub fn new(cache_service_uri: &str) -> Result<Self, DistCacheError> {
		let client = HttpClientBuilder::default()
			.build(cache_service_uri)
			.map_err(|source| DistCacheError::Connect { uri: cache_service_uri.to_string(), source })?;
		Ok(Self { client: Arc::new(client), exiting: AtomicBool::new(false), outstanding: Mutex::new(Vec::new()) })
	}

	/// Spawns the write and returns immediately. Duplicate writes for the
	/// same key (e.g. because the originating RPC was retried) are
	/// tolerated by the cache engine, so no de-duplication happens here.
	pub fn async_write(&self, key: CacheKey, exit_code: i32, stdout: Vec<u8>, stderr: Vec<u8>, compressed_artifact: Vec<u8>) {
		if self.exiting.load(Ordering::Relaxed) {
			return;
		}

		let client = self.client.clone();
		let handle = tokio::spawn(async move {
			let result = client.put_entry(key.to_hex(), exit_code, stdout, stderr, compressed_artifact).await;
			if let Err(error) = result {
				servant_common::warn_throttled!(target: LOG_TARGET, %error, "failed to populate distributed cache entry");
			}
		});

		let mut outstanding = self.outstanding.lock();
		outstanding.retain(|h| !h.is_finished());
		outstanding.push(handle);
	}

	pub fn stop(&self) {
		self.exiting.store(true, Ordering::Relaxed);
	}

	/// Waits for every write spawned before [`stop`](Self::stop) was called
	/// to finish (success or failure — both are already handled internally).
	pub async fn join(&self) {
		let handles: Vec<_> = std::mem::take(&mut *self.outstanding.lock());
		for handle in handles {
			let _ = handle.await;
		}
	}
}
