//! `Range` header parsing for byte ranges.
//!
//! Only single ranges are served; a request naming several ranges gets the
//! whole file.

/// A satisfiable byte range, `start` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub length: u64,
}

impl ByteRange {
    /// Value for the `Content-Range` response header.
    pub fn content_range(&self, size: u64) -> String {
        format!(
            "bytes {}-{}/{}",
            self.start,
            self.start + self.length - 1,
            size
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeRequest {
    /// Serve the whole file.
    Full,
    Partial(ByteRange),
    /// Syntactically valid but no range overlaps the file.
    NoOverlap,
    Invalid,
}

/// Parses a `Range` header against a file of `size` bytes.
pub fn parse_range(header: &str, size: u64) -> RangeRequest {
    let header = header.trim();
    if header.is_empty() {
        return RangeRequest::Full;
    }
    let Some(specs) = header.strip_prefix("bytes=") else {
        return RangeRequest::Invalid;
    };

    let mut ranges = Vec::new();
    let mut no_overlap = false;
    for spec in specs.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((start, end)) = spec.split_once('-') else {
            return RangeRequest::Invalid;
        };
        let (start, end) = (start.trim(), end.trim());

        if start.is_empty() {
            // Suffix form: the last `end` bytes.
            let Ok(suffix) = end.parse::<u64>() else {
                return RangeRequest::Invalid;
            };
            let suffix = suffix.min(size);
            if suffix == 0 {
                no_overlap = true;
                continue;
            }
            ranges.push(ByteRange {
                start: size - suffix,
                length: suffix,
            });
            continue;
        }

        let Ok(first) = start.parse::<u64>() else {
            return RangeRequest::Invalid;
        };
        if first >= size {
            no_overlap = true;
            continue;
        }
        let length = if end.is_empty() {
            size - first
        } else {
            let Ok(last) = end.parse::<u64>() else {
                return RangeRequest::Invalid;
            };
            if first > last {
                return RangeRequest::Invalid;
            }
            last.min(size - 1) - first + 1
        };
        ranges.push(ByteRange {
            start: first,
            length,
        });
    }

    match ranges.as_slice() {
        [] if no_overlap => RangeRequest::NoOverlap,
        [] => RangeRequest::Invalid,
        [single] => RangeRequest::Partial(*single),
        _ => RangeRequest::Full,
    }
}
