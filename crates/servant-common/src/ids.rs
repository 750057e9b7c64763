//! Identifier and key types shared by every component in the workspace.

use std::fmt;

/// A task grant handed out by the scheduler, naming one admitted compile job
/// cluster-wide. Grants are freed either explicitly (`FreeTask`) or by the
/// scheduler declaring them expired in a heartbeat response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GrantId(pub u64);

impl fmt::Display for GrantId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// A servant-local task identifier, monotonically increasing and namespaced
/// to a single daemon process. Never reused within one process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Describes the toolchain a compile job targets: target triple and
/// compiler version, plus a digest identifying the exact compiler binary
/// the servant must have registered in order to accept the job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct EnvironmentDescriptor {
	pub triple: String,
	pub compiler_version: String,
	pub digest: [u8; 32],
}

impl EnvironmentDescriptor {
	pub fn new(triple: impl Into<String>, compiler_version: impl Into<String>, digest: [u8; 32]) -> Self {
		Self { triple: triple.into(), compiler_version: compiler_version.into(), digest }
	}
}

/// A blake3-derived cache key identifying one (environment, invocation
/// arguments, source digest) tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CacheKey(pub [u8; 32]);

impl CacheKey {
	/// Computes the cache key the same way the daemon computes it when a
	/// compile completes: `blake3(environment digest || arguments || source digest)`.
	pub fn compute(environment: &EnvironmentDescriptor, invocation_arguments: &[String], source_digest: &str) -> Self {
		let mut hasher = blake3::Hasher::new();
		hasher.update(&environment.digest);
		for arg in invocation_arguments {
			hasher.update(arg.as_bytes());
			hasher.update(b"\0");
		}
		hasher.update(source_digest.as_bytes());
		Self(*hasher.finalize().as_bytes())
	}

	/// Shard index in `[0, shard_count)` this key falls into, used by the
	/// cache engine's directory layout.
	pub fn shard(&self, shard_count: u32) -> u32 {
		let mut acc = 0u32;
		for chunk in self.0.chunks(4) {
			let mut buf = [0u8; 4];
			buf[..chunk.len()].copy_from_slice(chunk);
			acc ^= u32::from_le_bytes(buf);
		}
		acc % shard_count
	}

	pub fn to_hex(self) -> String {
		blake3::Hash::from(self.0).to_hex().to_string()
	}

	/// Parses the hex form produced by [`to_hex`](Self::to_hex) back into a
	/// key, used when reconstructing keys from object-store listings.
	pub fn from_hex(s: &str) -> Option<Self> {
		let mut bytes = [0u8; 32];
		if s.len() != 64 {
			return None;
		}
		for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
			let hi = (chunk[0] as char).to_digit(16)?;
			let lo = (chunk[1] as char).to_digit(16)?;
			bytes[i] = ((hi << 4) | lo) as u8;
		}
		Some(Self(bytes))
	}
}

impl fmt::Display for CacheKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_hex())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cache_key_is_stable_for_identical_inputs() {
		let env = EnvironmentDescriptor::new("x86_64-unknown-linux-gnu", "13.2.0", [7u8; 32]);
		let a = CacheKey::compute(&env, &["-O2".to_string(), "-c".to_string()], "deadbeef");
		let b = CacheKey::compute(&env, &["-O2".to_string(), "-c".to_string()], "deadbeef");
		assert_eq!(a, b);
	}

	#[test]
	fn cache_key_changes_with_arguments() {
		let env = EnvironmentDescriptor::new("x86_64-unknown-linux-gnu", "13.2.0", [7u8; 32]);
		let a = CacheKey::compute(&env, &["-O2".to_string()], "deadbeef");
		let b = CacheKey::compute(&env, &["-O0".to_string()], "deadbeef");
		assert_ne!(a, b);
	}

	#[test]
	fn shard_is_within_range() {
		let env = EnvironmentDescriptor::new("x86_64-unknown-linux-gnu", "13.2.0", [1u8; 32]);
		let key = CacheKey::compute(&env, &[], "abc");
		assert!(key.shard(128) < 128);
	}

	#[test]
	fn hex_round_trips() {
		let env = EnvironmentDescriptor::new("x86_64-unknown-linux-gnu", "13.2.0", [1u8; 32]);
		let key = CacheKey::compute(&env, &[], "abc");
		assert_eq!(CacheKey::from_hex(&key.to_hex()), Some(key));
	}

	#[test]
	fn from_hex_rejects_wrong_length() {
		assert_eq!(CacheKey::from_hex("deadbeef"), None);
	}
}
