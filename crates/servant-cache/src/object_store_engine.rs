//! The object-store-backed cache engine, ported from
//! `original_source/yadcc/cache/cos_cache_engine.{h,cc}` onto the
//! `object_store` crate (the ecosystem-standard abstraction over
//! S3/GCS/Azure-compatible blob stores) in place of the original's
//! bespoke Tencent COS client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use object_store::path::Path as StorePath;
use object_store::{ObjectStore, PutPayload};
use parking_lot::Mutex;
use servant_common::CacheKey;

use crate::engine::CacheEngine;

const LOG_TARGET: &str = "servant::cache";

/// Number of subdirectories cache keys are sharded across. Kept fixed (not
/// configurable) so that changing it never silently strands previously
/// written entries under a shard nothing looks at again.
const SHARD_COUNT: u32 = 128;

/// Maximum objects per bulk-delete batch during [`purge`](ObjectStoreCacheEngine::purge),
/// matching the original COS client's own per-call limit.
const PURGE_BATCH_SIZE: usize = 1000;

const LIST_RETRIES: u32 = 3;
const LIST_RETRY_BACKOFF: Duration = Duration::from_millis(100);

struct Entry {
	key: CacheKey,
	last_modified: DateTime<Utc>,
	size: u64,
}

/// Content-addressed blob cache with bounded capacity and LRU-style
/// eviction, backed by any `object_store::ObjectStore` implementation
/// (local filesystem, S3, GCS, Azure Blob, or in-memory for tests).
pub struct ObjectStoreCacheEngine {
	store: Arc<dyn ObjectStore>,
	root_prefix: String,
	capacity_bytes: u64,
	/// Deferred-deletion queue: populated by the eviction scan in
	/// [`keys`](Self::keys)/[`scan`], drained by [`purge`](Self::purge).
	/// Deferring amortises per-call-billed object-store API calls and
	/// tolerates eventual consistency — a concurrent writer racing the
	/// evictor is acceptable because entries are content-addressed and
	/// cheap to recompute.
	pending_removal: Mutex<Vec<CacheKey>>,
}

impl ObjectStoreCacheEngine {
	pub fn new(store: Arc<dyn ObjectStore>, root_prefix: impl Into<String>, capacity_bytes: u64) -> Self {
		Self { store, root_prefix: root_prefix.into(), capacity_bytes, pending_removal: Mutex::new(Vec::new()) }
	}

	fn object_path(&self, key: CacheKey) -> StorePath {
		StorePath::from(format!("{}/{}/{}", self.root_prefix, key.shard(SHARD_COUNT), key.to_hex()))
	}

	fn shard_prefix(&self, shard: u32) -> StorePath {
		StorePath::from(format!("{}/{}/", self.root_prefix, shard))
	}

	async fn list_shard(&self, shard: u32) -> Vec<Entry> {
		let prefix = self.shard_prefix(shard);
		let mut last_error = None;
		for attempt in 0..=LIST_RETRIES {
			match self.store.list(Some(&prefix)).try_collect::<Vec<_>>().await {
				Ok(metas) => {
					return metas
						.into_iter()
						.filter_map(|meta| {
							let name = meta.location.filename()?;
							let key = CacheKey::from_hex(name)?;
							Some(Entry { key, last_modified: meta.last_modified, size: meta.size as u64 })
						})
						.collect();
				}
				Err(error) => {
					last_error = Some(error);
					if attempt < LIST_RETRIES {
						tokio::time::sleep(LIST_RETRY_BACKOFF).await;
					}
				}
			}
		}
		if let Some(error) = last_error {
			servant_common::warn_throttled!(
				target: LOG_TARGET,
				shard,
				%error,
				"failed to enumerate shard after retries, returning partial result"
			);
		}
		Vec::new()
	}

	/// Fans out one list call per shard, merges the results, sorts
	/// descending by `last_modified`, and walks until the accumulated size
	/// exceeds `capacity_bytes`; everything past that point is appended to
	/// the pending-removal queue.
	async fn scan(&self) -> Vec<Entry> {
		let shard_results = stream::iter(0..SHARD_COUNT)
			.map(|shard| {
				let this = self;
				async move { this.list_shard(shard).await }
			})
			.buffer_unordered(SHARD_COUNT as usize)
			.collect::<Vec<_>>()
			.await;

		let mut merged: Vec<Entry> = shard_results.into_iter().flatten().collect();
		merged.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));

		let mut total_size = 0u64;
		let mut cutoff = merged.len();
		for (i, entry) in merged.iter().enumerate() {
			if total_size >= self.capacity_bytes {
				cutoff = i;
				break;
			}
			total_size += entry.size;
		}

		if cutoff < merged.len() {
			let mut pending = self.pending_removal.lock();
			pending.extend(merged[cutoff..].iter().map(|e| e.key));
		}

		merged
	}
}

#[async_trait]
impl CacheEngine for ObjectStoreCacheEngine {
	async fn get(&self, key: CacheKey) -> Option<Bytes> {
		match self.store.get(&self.object_path(key)).await {
			Ok(result) => result.bytes().await.ok(),
			Err(_) => None,
		}
	}

	async fn put(&self, key: CacheKey, bytes: Bytes) {
		let path = self.object_path(key);
		let len = bytes.len();
		let payload: PutPayload = bytes.into();
		if let Err(error) = self.store.put(&path, payload).await {
			servant_common::warn_throttled!(target: LOG_TARGET, %error, bytes = len, "failed to save entry into object store cache");
		}
	}

	async fn keys(&self) -> Vec<CacheKey> {
		self.scan().await.into_iter().map(|e| e.key).collect()
	}

	async fn purge(&self) -> usize {
		let keys: Vec<CacheKey> = {
			let mut pending = self.pending_removal.lock();
			std::mem::take(&mut *pending)
		};

		let mut purged = 0usize;
		for chunk in keys.chunks(PURGE_BATCH_SIZE) {
			let paths: Vec<StorePath> = chunk.iter().map(|key| self.object_path(*key)).collect();
			let mut results = self.store.delete_stream(stream::iter(paths.into_iter().map(Ok)).boxed());
			while let Some(result) = results.next().await {
				match result {
					Ok(_) => purged += 1,
					Err(error) => {
						servant_common::warn_throttled!(target: LOG_TARGET, %error, "failed to purge an obsolete entry, will retry later");
					}
				}
			}
		}
		purged
	}

	async fn dump_internals(&self) -> serde_json::Value {
		let entries = self.scan().await;
		let total_size: u64 = entries.iter().map(|e| e.size).sum();
		serde_json::json!({
			"entries": entries.len(),
			"total_size_in_bytes": total_size,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use object_store::memory::InMemory;

	fn engine(capacity_bytes: u64) -> ObjectStoreCacheEngine {
		ObjectStoreCacheEngine::new(Arc::new(InMemory::new()), "yadcc-cache", capacity_bytes)
	}

	fn key(byte: u8) -> CacheKey {
		CacheKey([byte; 32])
	}

	#[tokio::test]
	async fn put_then_get_round_trips() {
		let engine = engine(1_000_000);
		engine.put(key(1), Bytes::from_static(b"hello")).await;
		assert_eq!(engine.get(key(1)).await, Some(Bytes::from_static(b"hello")));
	}

	#[tokio::test]
	async fn get_on_missing_key_is_none() {
		let engine = engine(1_000_000);
		assert!(engine.get(key(9)).await.is_none());
	}

	#[tokio::test]
	async fn keys_returns_everything_written() {
		let engine = engine(1_000_000);
		for i in 0..5u8 {
			engine.put(key(i), Bytes::from_static(b"x")).await;
		}
		let mut keys = engine.keys().await;
		keys.sort();
		let mut expected: Vec<_> = (0..5u8).map(key).collect();
		expected.sort();
		assert_eq!(keys, expected);
	}

	#[tokio::test]
	async fn eviction_marks_oldest_entries_for_removal_and_purge_deletes_them() {
		let engine = engine(1000);
		// 12 entries of 100 bytes each, written in order so later writes are
		// "newer" by `last_modified`.
		for i in 0..12u8 {
			engine.put(key(i), Bytes::from(vec![0u8; 100])).await;
		}

		let keys = engine.keys().await;
		assert_eq!(keys.len(), 12);
		assert_eq!(engine.pending_removal.lock().len(), 2);

		let purged = engine.purge().await;
		assert_eq!(purged, 2);
		assert!(engine.pending_removal.lock().is_empty());
	}

	#[tokio::test]
	async fn dump_internals_reports_entry_count_and_total_size() {
		let engine = engine(1_000_000);
		engine.put(key(1), Bytes::from_static(b"abcd")).await;
		let dump = engine.dump_internals().await;
		assert_eq!(dump["entries"], 1);
		assert_eq!(dump["total_size_in_bytes"], 4);
	}
}
