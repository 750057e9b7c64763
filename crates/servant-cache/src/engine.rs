//! The `CacheEngine` trait, ported from
//! `original_source/yadcc/cache/cache_engine.h`.

use async_trait::async_trait;
use bytes::Bytes;
use servant_common::CacheKey;

/// Capability set every cache backend must implement: content-addressed
/// get/put, key enumeration (which may itself trigger an eviction scan),
/// and a separate purge step that performs pending deletions.
///
/// Reads and writes are best-effort: a failed read is a cache miss, a
/// failed write is logged and discarded. Nothing here ever propagates a
/// cache failure to the compile RPC — the compile already succeeded
/// regardless of whether the cache could be populated.
#[async_trait]
pub trait CacheEngine: Send + Sync {
	/// Fetches `key`'s bytes, or `None` on a cache miss (including I/O
	/// failures talking to the backend — those are treated identically to
	/// an absent key).
	async fn get(&self, key: CacheKey) -> Option<Bytes>;

	/// Stores `bytes` under `key`. Idempotent: writing the same key twice
	/// (e.g. because an RPC retry recomputed the same fingerprint) is
	/// tolerated and simply overwrites.
	async fn put(&self, key: CacheKey, bytes: Bytes);

	/// Enumerates the keys currently retained by the cache. For backends
	/// with a capacity bound, this is also where the eviction scan runs:
	/// entries beyond capacity (oldest first) are queued for removal on
	/// the next [`purge`](Self::purge) rather than deleted immediately.
	async fn keys(&self) -> Vec<CacheKey>;

	/// Performs whatever deletions were queued by the last [`keys`](Self::keys)
	/// scan. Returns the number of entries actually removed.
	async fn purge(&self) -> usize;

	/// Telemetry counters surfaced in diagnostics endpoints.
	async fn dump_internals(&self) -> serde_json::Value;
}
