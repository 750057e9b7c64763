//! Maps the environment descriptors this servant can compile for to the
//! compiler binary on disk.
//!
//! The original's `CompilerRegistry` (`yadcc/daemon/cloud/compiler_registry.h`)
//! is referenced by `daemon_service_impl.cc`'s `TryGetCompilerPath` and
//! `EnumerateEnvironments` but isn't itself among the retrieved sources; this
//! reconstructs its two-method contract from those call sites, backed by a
//! small JSON manifest instead of the original's directory-scanning registration
//! (environment discovery itself — probing installed toolchains — is
//! configuration/front-end territory, out of scope per spec.md §1).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use servant_common::EnvironmentDescriptor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompilerRegistryError {
	#[error("failed to read compiler registry manifest {path}: {source}")]
	Read { path: PathBuf, #[source] source: std::io::Error },
	#[error("failed to parse compiler registry manifest {path}: {source}")]
	Parse { path: PathBuf, #[source] source: serde_json::Error },
	#[error("entry {index} has a digest that isn't 64 hex characters: {digest:?}")]
	BadDigest { index: usize, digest: String },
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
	triple: String,
	compiler_version: String,
	digest: String,
	path: PathBuf,
}

/// In-memory view of the toolchains this servant can accept compile jobs
/// for, keyed by [`EnvironmentDescriptor`].
#[derive(Debug, Default)]
pub struct CompilerRegistry {
	compilers: HashMap<EnvironmentDescriptor, PathBuf>,
}

impl CompilerRegistry {
	pub fn from_entries(entries: Vec<(EnvironmentDescriptor, PathBuf)>) -> Self {
		Self { compilers: entries.into_iter().collect() }
	}

	/// Loads a manifest of the form
	/// `[{"triple": "...", "compiler_version": "...", "digest": "<64 hex chars>", "path": "/usr/bin/gcc"}, ...]`.
	/// A missing `manifest_path` yields an empty registry (the servant
	/// advertises zero environments and rejects every compile request with
	/// `ENVIRONMENT_NOT_AVAILABLE`), which is a valid, if useless, configuration
	/// rather than a startup error.
	pub fn load(manifest_path: Option<&Path>) -> Result<Self, CompilerRegistryError> {
		let Some(path) = manifest_path else {
			return Ok(Self::default());
		};

		let contents = std::fs::read_to_string(path).map_err(|source| CompilerRegistryError::Read { path: path.to_path_buf(), source })?;
		let raw: Vec<ManifestEntry> =
			serde_json::from_str(&contents).map_err(|source| CompilerRegistryError::Parse { path: path.to_path_buf(), source })?;

		let mut entries = Vec::with_capacity(raw.len());
		for (index, entry) in raw.into_iter().enumerate() {
			let digest = parse_digest(&entry.digest).ok_or_else(|| CompilerRegistryError::BadDigest { index, digest: entry.digest.clone() })?;
			entries.push((EnvironmentDescriptor::new(entry.triple, entry.compiler_version, digest), entry.path));
		}
		Ok(Self::from_entries(entries))
	}

	/// Resolves `env` to its compiler's path, or `None` if this servant
	/// doesn't have that toolchain registered.
	pub fn try_get_compiler_path(&self, env: &EnvironmentDescriptor) -> Option<&Path> {
		self.compilers.get(env).map(PathBuf::as_path)
	}

	/// Every environment this servant advertises in its heartbeat.
	pub fn enumerate_environments(&self) -> Vec<EnvironmentDescriptor> {
		self.compilers.keys().cloned().collect()
	}
}

fn parse_digest(s: &str) -> Option<[u8; 32]> {
	if s.len() != 64 {
		return None;
	}
	let mut bytes = [0u8; 32];
	for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
		let hi = (chunk[0] as char).to_digit(16)?;
		let lo = (chunk[1] as char).to_digit(16)?;
		bytes[i] = ((hi << 4) | lo) as u8;
	}
	Some(bytes)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn absent_manifest_path_yields_an_empty_registry() {
		let registry = CompilerRegistry::load(None).unwrap();
		assert!(registry.enumerate_environments().is_empty());
	}

	#[test]
	fn loads_and_resolves_entries_from_a_manifest() {
		let dir = tempfile::tempdir().unwrap();
		let manifest_path = dir.path().join("compilers.json");
		std::fs::write(
			&manifest_path,
			format!(
				r#"[{{"triple": "x86_64-unknown-linux-gnu", "compiler_version": "11.2", "digest": "{}", "path": "/usr/bin/gcc"}}]"#,
				"ab".repeat(32)
			),
		)
		.unwrap();

		let registry = CompilerRegistry::load(Some(&manifest_path)).unwrap();
		let env = EnvironmentDescriptor::new("x86_64-unknown-linux-gnu", "11.2", [0xab; 32]);
		assert_eq!(registry.try_get_compiler_path(&env), Some(Path::new("/usr/bin/gcc")));
		assert_eq!(registry.enumerate_environments().len(), 1);
	}

	#[test]
	fn unknown_environment_resolves_to_none() {
		let registry = CompilerRegistry::from_entries(Vec::new());
		let env = EnvironmentDescriptor::new("x86_64-unknown-linux-gnu", "11.2", [0; 32]);
		assert_eq!(registry.try_get_compiler_path(&env), None);
	}

	#[test]
	fn malformed_digest_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let manifest_path = dir.path().join("compilers.json");
		std::fs::write(&manifest_path, r#"[{"triple": "t", "compiler_version": "v", "digest": "short", "path": "/bin/x"}]"#).unwrap();
		assert!(matches!(CompilerRegistry::load(Some(&manifest_path)), Err(CompilerRegistryError::BadDigest { .. })));
	}
}
