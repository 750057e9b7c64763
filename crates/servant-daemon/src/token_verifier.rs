//! Bearer-token ACL gating every Daemon Service RPC, ported from the
//! interface implied by `original_source/yadcc/daemon/cloud/daemon_service_impl.cc`'s
//! `IsTokenAcceptable` / `UpdateAcceptableTokens` (backed by a
//! `yadcc/common/token_verifier.h` not present among the retrieved sources;
//! reconstructed from those two call sites).
//!
//! Reads vastly outnumber writes (one ACL refresh per heartbeat response vs.
//! one check per RPC), matching §5's "reader/writer lock; reads dominate"
//! concurrency note.

use std::collections::HashSet;

use parking_lot::RwLock;

/// Denies every token until the first heartbeat response populates the
/// acceptable set.
#[derive(Default)]
pub struct TokenVerifier {
	acceptable: RwLock<HashSet<String>>,
}

impl TokenVerifier {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn verify(&self, token: &str) -> bool {
		self.acceptable.read().contains(token)
	}

	/// Replaces the acceptable set wholesale with the latest heartbeat
	/// response, rather than reconciling additions/removals — the
	/// scheduler's response is always the full current set.
	pub fn update(&self, tokens: HashSet<String>) {
		*self.acceptable.write() = tokens;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn denies_everything_before_the_first_update() {
		let verifier = TokenVerifier::new();
		assert!(!verifier.verify("t1"));
	}

	#[test]
	fn accepts_tokens_from_the_latest_update_only() {
		let verifier = TokenVerifier::new();
		verifier.update(["t1".to_string()].into_iter().collect());
		assert!(verifier.verify("t1"));

		verifier.update(["t2".to_string()].into_iter().collect());
		assert!(!verifier.verify("t1"));
		assert!(verifier.verify("t2"));
	}
}
