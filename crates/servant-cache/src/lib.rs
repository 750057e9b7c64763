//! Content-addressed cache engine trait plus its object-store-backed and
//! null implementations, ported from `original_source/yadcc/cache/`.

mod engine;
mod null_engine;
mod object_store_engine;
mod registry;
mod rpc;

pub use engine::CacheEngine;
pub use null_engine::NullCacheEngine;
pub use object_store_engine::ObjectStoreCacheEngine;
pub use registry::{build_cache_engine, CacheEngineError};
pub use rpc::{decode_entry, CacheEntry, CacheServiceClient, CacheServiceImpl, CacheServiceServer};
