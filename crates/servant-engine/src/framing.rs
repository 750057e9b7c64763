//! Multi-chunk framing for the local Unix-socket transport, ported from
//! `original_source/yadcc/daemon/local/multi_chunk.{h,cc}`.
//!
//! Wire format: a header line `<len1>,<len2>,...,<lenN>\r\n` followed by the
//! `N` chunks concatenated back to back, with no separators between them
//! (their lengths are already known from the header).

use bytes::{Bytes, BytesMut};

/// `std::numeric_limits<std::size_t>::digits10 + 1`, times the 1024-chunk
/// cap the original accepts — the maximum number of bytes the header line
/// is allowed to occupy before parsing gives up and reports malformed input.
const MAX_HEADER_BYTES: usize = 1024 * (19 + 1);

/// Packs `chunks` into one framed buffer. An empty input packs to an empty
/// buffer (rather than a header describing zero chunks), so it round-trips
/// through [`try_parse_multi_chunk`] as the empty list.
pub fn make_multi_chunk(chunks: Vec<Bytes>) -> Bytes {
	if chunks.is_empty() {
		return Bytes::new();
	}

	let mut header = String::new();
	for (i, chunk) in chunks.iter().enumerate() {
		if i > 0 {
			header.push(',');
		}
		header.push_str(&chunk.len().to_string());
	}
	header.push_str("\r\n");

	let total: usize = chunks.iter().map(Bytes::len).sum();
	let mut buf = BytesMut::with_capacity(header.len() + total);
	buf.extend_from_slice(header.as_bytes());
	for chunk in chunks {
		buf.extend_from_slice(&chunk);
	}
	buf.freeze()
}

/// Parses a buffer framed by [`make_multi_chunk`]. Returns `None` on any
/// malformed input: a missing `\r\n` within the header size cap, a
/// non-numeric or overflowing size, or a total size mismatching what's
/// actually present (truncated or over-long input).
pub fn try_parse_multi_chunk(buffer: Bytes) -> Option<Vec<Bytes>> {
	if buffer.is_empty() {
		return Some(Vec::new());
	}

	let search_len = buffer.len().min(MAX_HEADER_BYTES);
	let header_end = find_crlf(&buffer[..search_len])?;
	let header = std::str::from_utf8(&buffer[..header_end]).ok()?;

	let mut sizes = Vec::new();
	let mut total = 0usize;
	for part in header.split(',') {
		let size: usize = part.parse().ok()?;
		total = total.checked_add(size)?;
		sizes.push(size);
	}

	let mut rest = buffer.slice((header_end + 2)..);
	if rest.len() != total {
		return None;
	}

	let mut parts = Vec::with_capacity(sizes.len());
	for size in sizes {
		parts.push(rest.split_to(size));
	}
	Some(parts)
}

fn find_crlf(haystack: &[u8]) -> Option<usize> {
	haystack.windows(2).position(|w| w == b"\r\n")
}
