//! The wire contract a `CacheEngine` is served over, the Rust stand-in for
//! `yadcc/api/cache.flare.pb.h`'s `CacheService` (not present in the
//! retrieved sources; reconstructed from its one call site in
//! `original_source/yadcc/daemon/cloud/distributed_cache_writer.h`'s
//! `AsyncWrite(key, exit_code, standard_output, standard_error, buffer)`).
//!
//! Defined once here and shared by both sides: `servant-cache` implements
//! [`CacheServiceServer`] over a [`CacheEngine`], and `servant-distcache`
//! depends on this crate purely for the generated [`CacheServiceClient`].

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::ErrorObjectOwned;
use servant_common::CacheKey;

use crate::engine::CacheEngine;

#[rpc(client, server, namespace = "cache")]
pub trait CacheService {
	/// Populates one cache entry. Only successful compiles (`exit_code ==
	/// 0`) are worth caching; the server rejects anything else by returning
	/// `Ok(false)` rather than an error, since a non-zero exit code isn't a
	/// transport failure.
	#[method(name = "putEntry")]
	async fn put_entry(
		&self,
		key: String,
		exit_code: i32,
		stdout: Vec<u8>,
		stderr: Vec<u8>,
		artifact: Vec<u8>,
	) -> RpcResult<bool>;
}

/// Serves a [`CacheEngine`] over the [`CacheServiceServer`] contract.
pub struct CacheServiceImpl {
	engine: Arc<dyn CacheEngine>,
}

impl CacheServiceImpl {
	pub fn new(engine: Arc<dyn CacheEngine>) -> Self {
		Self { engine }
	}
}

#[async_trait]
impl CacheServiceServer for CacheServiceImpl {
	async fn put_entry(&self, key: String, exit_code: i32, stdout: Vec<u8>, stderr: Vec<u8>, artifact: Vec<u8>) -> RpcResult<bool> {
		if exit_code != 0 {
			return Ok(false);
		}
		let Some(key) = CacheKey::from_hex(&key) else {
			return Err(ErrorObjectOwned::owned(-32602, "malformed cache key", None::<()>));
		};
		self.engine.put(key, encode_entry(&stdout, &stderr, &artifact)).await;
		Ok(true)
	}
}

/// One cache entry's decoded payload.
pub struct CacheEntry {
	pub stdout: Vec<u8>,
	pub stderr: Vec<u8>,
	pub artifact: Vec<u8>,
}

/// Packs the three fields a cache entry carries into a single blob, since
/// [`CacheEngine`] only stores one value per key. Three big-endian length
/// prefixes followed by the concatenated payloads — deliberately simpler
/// than the [`crate`](crate) crate's own multi-chunk framing, since the
/// field count here is fixed.
fn encode_entry(stdout: &[u8], stderr: &[u8], artifact: &[u8]) -> Bytes {
	let mut buf = BytesMut::with_capacity(12 + stdout.len() + stderr.len() + artifact.len());
	buf.extend_from_slice(&(stdout.len() as u32).to_be_bytes());
	buf.extend_from_slice(&(stderr.len() as u32).to_be_bytes());
	buf.extend_from_slice(&(artifact.len() as u32).to_be_bytes());
	buf.extend_from_slice(stdout);
	buf.extend_from_slice(stderr);
	buf.extend_from_slice(artifact);
	buf.freeze()
}

/// Inverse of [`encode_entry`], used by readers of a populated cache entry.
pub fn decode_entry(bytes: &[u8]) -> Option<CacheEntry> {
	if bytes.len() < 12 {
		return None;
	}
	let stdout_len = u32::from_be_bytes(bytes[0..4].try_into().ok()?) as usize;
	let stderr_len = u32::from_be_bytes(bytes[4..8].try_into().ok()?) as usize;
	let artifact_len = u32::from_be_bytes(bytes[8..12].try_into().ok()?) as usize;

	let body = &bytes[12..];
	if body.len() != stdout_len + stderr_len + artifact_len {
		return None;
	}
	let (stdout, rest) = body.split_at(stdout_len);
	let (stderr, artifact) = rest.split_at(stderr_len);
	Some(CacheEntry { stdout: stdout.to_vec(), stderr: stderr.to_vec(), artifact: artifact.to_vec() })
}
