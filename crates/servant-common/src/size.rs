//! Byte-size parsing for configuration values like cache capacity and the
//! minimum free memory required before admitting a new task.
//!
//! Accepts a plain integer (bytes) or an integer followed by one of the
//! binary-power suffixes `K`, `M`, `G`, `T` (case-insensitive), matching the
//! convention the original daemon's flags used (`--min_memory_for_starting_new_task=2G`).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseSizeError {
	#[error("empty size string")]
	Empty,
	#[error("invalid numeric portion in size string {0:?}")]
	InvalidNumber(String),
	#[error("unrecognized size suffix {0:?}")]
	UnknownSuffix(char),
}

/// Parses a human-written byte size such as `"2G"`, `"512M"`, or a bare
/// integer number of bytes.
pub fn parse_size(input: &str) -> Result<u64, ParseSizeError> {
	let trimmed = input.trim();
	if trimmed.is_empty() {
		return Err(ParseSizeError::Empty);
	}

	let mut chars = trimmed.chars();
	let last = chars.clone().next_back().expect("non-empty checked above");

	let (digits, multiplier) = if last.is_ascii_digit() {
		(trimmed, 1u64)
	} else {
		let digits = &trimmed[..trimmed.len() - last.len_utf8()];
		let multiplier = match last.to_ascii_uppercase() {
			'K' => 1024u64,
			'M' => 1024 * 1024,
			'G' => 1024 * 1024 * 1024,
			'T' => 1024 * 1024 * 1024 * 1024,
			other => return Err(ParseSizeError::UnknownSuffix(other)),
		};
		(digits, multiplier)
	};

	let value: u64 = digits
		.trim()
		.parse()
		.map_err(|_| ParseSizeError::InvalidNumber(input.to_string()))?;

	Ok(value.saturating_mul(multiplier))
}

/// Renders a byte count back into the shorthand `parse_size` accepts, picking
/// the largest suffix that divides evenly. Used by `dump_internals`
/// diagnostics so operators see `"10G"` instead of `10737418240`.
pub fn format_size(bytes: u64) -> String {
	const UNITS: [(u64, &str); 4] = [
		(1024 * 1024 * 1024 * 1024, "T"),
		(1024 * 1024 * 1024, "G"),
		(1024 * 1024, "M"),
		(1024, "K"),
	];
	for (scale, suffix) in UNITS {
		if bytes != 0 && bytes % scale == 0 {
			return format!("{}{}", bytes / scale, suffix);
		}
	}
	bytes.to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_bare_bytes() {
		assert_eq!(parse_size("1024").unwrap(), 1024);
	}

	#[test]
	fn parses_suffixed_values() {
		assert_eq!(parse_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
		assert_eq!(parse_size("512M").unwrap(), 512 * 1024 * 1024);
		assert_eq!(parse_size("4k").unwrap(), 4 * 1024);
	}

	#[test]
	fn rejects_empty_and_garbage() {
		assert_eq!(parse_size(""), Err(ParseSizeError::Empty));
		assert!(parse_size("abcG").is_err());
		assert_eq!(parse_size("3X"), Err(ParseSizeError::UnknownSuffix('X')));
	}

	#[test]
	fn format_size_round_trips_common_values() {
		assert_eq!(format_size(2 * 1024 * 1024 * 1024), "2G");
		assert_eq!(format_size(1024), "1K");
		assert_eq!(format_size(3), "3");
	}
}
