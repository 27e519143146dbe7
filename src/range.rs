//! Single-range HTTP `Range` header parsing.
//!
//! Only `bytes=<start>-<end>`, `bytes=<start>-` and the suffix form
//! `bytes=-<n>` are understood. Anything else (multi-range, other units,
//! out-of-bounds offsets) yields `None`, meaning "serve the whole file".

/// Inclusive byte interval `[start, end]` inside a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered by the interval.
    pub fn content_length(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` header value for a resource of `size` bytes.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

/// Parse a `Range` header value against a resource of `size` bytes.
///
/// The returned interval is clamped to `[0, size - 1]`.
pub fn parse_range(header: Option<&str>, size: u64) -> Option<ByteRange> {
    if size == 0 {
        return None;
    }

    let spec = header?.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }

    let (start, end) = spec.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());

    match (start.is_empty(), end.is_empty()) {
        // bytes=-500 (last 500 bytes)
        (true, false) => {
            let suffix = parse_offset(end)?;
            if suffix == 0 {
                return None;
            }
            Some(ByteRange {
                start: size.saturating_sub(suffix),
                end: size - 1,
            })
        }
        // bytes=500-
        (false, true) => {
            let start = parse_offset(start)?;
            if start >= size {
                return None;
            }
            Some(ByteRange {
                start,
                end: size - 1,
            })
        }
        // bytes=0-499
        (false, false) => {
            let start = parse_offset(start)?;
            let end = parse_offset(end)?;
            if start >= size || start > end {
                return None;
            }
            Some(ByteRange {
                start,
                end: end.min(size - 1),
            })
        }
        (true, true) => None,
    }
}

/// Digits only: `u64::from_str` would also accept a leading `+`.
fn parse_offset(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}
