//! Throttled warning logging: a transient I/O failure (cache store hiccup,
//! a `/proc` read racing a process exit) is worth knowing about but not
//! worth flooding the log with on every retry, so each call site tracks the
//! last time it fired and drops anything closer than one second apart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Per-call-site state for [`warn_throttled`]. Construct one `static` per
/// call site with `ThrottleState::new()`.
pub struct ThrottleState {
	last_logged_unix_millis: AtomicU64,
}

impl ThrottleState {
	pub const fn new() -> Self {
		Self { last_logged_unix_millis: AtomicU64::new(0) }
	}

	/// Returns `true` if at least one second has passed since the last time
	/// this call site was allowed to log, and atomically claims the slot.
	pub fn should_log(&self) -> bool {
		let now = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_millis() as u64;
		let last = self.last_logged_unix_millis.load(Ordering::Relaxed);
		if now.saturating_sub(last) < 1000 {
			return false;
		}
		self.last_logged_unix_millis
			.compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
			.is_ok()
	}
}

impl Default for ThrottleState {
	fn default() -> Self {
		Self::new()
	}
}

/// Logs a `tracing::warn!` at most once per second per call site.
#[macro_export]
macro_rules! warn_throttled {
	(target: $target:expr, $($arg:tt)+) => {{
		static STATE: $crate::throttle::ThrottleState = $crate::throttle::ThrottleState::new();
		if STATE.should_log() {
			tracing::warn!(target: $target, $($arg)+);
		}
	}};
	($($arg:tt)+) => {{
		static STATE: $crate::throttle::ThrottleState = $crate::throttle::ThrottleState::new();
		if STATE.should_log() {
			tracing::warn!($($arg)+);
		}
	}};
}
