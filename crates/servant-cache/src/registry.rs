//! Selects a `CacheEngine` implementation by name, the Rust stand-in for
//! the original's `FLARE_DECLARE_CLASS_DEPENDENCY_REGISTRY` /
//! `FLARE_REGISTER_CLASS_DEPENDENCY` macro pair: a named registry mapping
//! `"object-store" | "null"` to a constructor.

use std::sync::Arc;

use thiserror::Error;
use url::Url;

use crate::engine::CacheEngine;
use crate::null_engine::NullCacheEngine;
use crate::object_store_engine::ObjectStoreCacheEngine;

#[derive(Debug, Error)]
pub enum CacheEngineError {
	#[error("unrecognized cache engine {0:?}, expected \"object-store\" or \"null\"")]
	UnknownBackend(String),
	#[error("cache engine \"object-store\" requires --cache-uri")]
	MissingCacheUri,
	#[error("cache URI {0:?} is not a valid URL")]
	InvalidUrl(String),
	#[error("invalid cache URI {uri:?}: {source}")]
	UnsupportedUri { uri: String, #[source] source: object_store::Error },
}

/// Builds the configured cache engine. `root_prefix` namespaces entries
/// within the backing store (the original's `cos_engine_dir`, defaulting
/// to `"yadcc-cache"`), so multiple unrelated workloads can safely share
/// one bucket.
pub fn build_cache_engine(
	selector: &str,
	cache_uri: Option<&str>,
	root_prefix: &str,
	capacity_bytes: u64,
) -> Result<Arc<dyn CacheEngine>, CacheEngineError> {
	match selector {
		"null" => Ok(Arc::new(NullCacheEngine)),
		"object-store" => {
			let uri = cache_uri.ok_or(CacheEngineError::MissingCacheUri)?;
			let url = Url::parse(uri).map_err(|_| CacheEngineError::InvalidUrl(uri.to_string()))?;
			let (store, _path) = object_store::parse_url(&url)
				.map_err(|source| CacheEngineError::UnsupportedUri { uri: uri.to_string(), source })?;
			Ok(Arc::new(ObjectStoreCacheEngine::new(Arc::from(store), root_prefix.to_string(), capacity_bytes)))
		}
		other => Err(CacheEngineError::UnknownBackend(other.to_string())),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn null_backend_never_needs_a_uri() {
		assert!(build_cache_engine("null", None, "yadcc-cache", 0).is_ok());
	}

	#[test]
	fn object_store_backend_requires_a_uri() {
		assert!(matches!(build_cache_engine("object-store", None, "yadcc-cache", 0), Err(CacheEngineError::MissingCacheUri)));
	}

	#[test]
	fn object_store_backend_accepts_a_memory_uri() {
		assert!(build_cache_engine("object-store", Some("memory:///"), "yadcc-cache", 100).is_ok());
	}

	#[test]
	fn unknown_backend_is_rejected() {
		assert!(matches!(build_cache_engine("bogus", None, "yadcc-cache", 0), Err(CacheEngineError::UnknownBackend(_))));
	}
}
