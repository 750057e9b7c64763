//! The null cache engine: used when only an in-memory L1 is wanted and no
//! distributed cache should be populated. Ported from
//! `original_source/yadcc/cache/null_cache_engine.{h,cc}`.

use async_trait::async_trait;
use bytes::Bytes;
use servant_common::CacheKey;

use crate::engine::CacheEngine;

#[derive(Debug, Default)]
pub struct NullCacheEngine;

#[async_trait]
impl CacheEngine for NullCacheEngine {
	async fn get(&self, _key: CacheKey) -> Option<Bytes> {
		None
	}

	async fn put(&self, _key: CacheKey, _bytes: Bytes) {}

	async fn keys(&self) -> Vec<CacheKey> {
		Vec::new()
	}

	async fn purge(&self) -> usize {
		0
	}

	async fn dump_internals(&self) -> serde_json::Value {
		serde_json::json!({})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn get_is_always_a_miss() {
		let engine = NullCacheEngine;
		assert!(engine.get(CacheKey([0u8; 32])).await.is_none());
	}

	#[tokio::test]
	async fn put_and_purge_are_no_ops() {
		let engine = NullCacheEngine;
		engine.put(CacheKey([1u8; 32]), Bytes::from_static(b"data")).await;
		assert_eq!(engine.keys().await.len(), 0);
		assert_eq!(engine.purge().await, 0);
	}
}
