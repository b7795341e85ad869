use shroud_types::{Result, ShroudError};

use crate::manifest::ChunkManifest;

/// Resolution of a plaintext byte range against the chunked layout: which
/// chunks to fetch, which encrypted bytes they occupy, and how much of the
/// decrypted head and tail to discard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangePlan {
    pub first_chunk: u64,
    pub last_chunk: u64,
    /// Bytes to discard from the front of the first decrypted chunk.
    pub head_trim: u64,
    /// Bytes to keep from the last decrypted chunk, counted from its start.
    pub tail_keep: u64,
    /// Inclusive encrypted byte range covering `first_chunk..=last_chunk`.
    pub encrypted_start: u64,
    pub encrypted_end: u64,
}

/// Map an inclusive plaintext byte range onto chunk and encrypted-byte
/// coordinates.
///
/// `end` beyond a known plaintext size is clamped to `size - 1`; with an
/// unknown size the caller relies on decoder EOF to bound the read.
pub fn plan_range(
    manifest: &ChunkManifest,
    start: u64,
    mut end: u64,
    plaintext_size: Option<u64>,
) -> Result<RangePlan> {
    if manifest.chunk_count == 0 {
        return Err(ShroudError::RangeNotSatisfiable {
            start,
            end,
            size: 0,
        });
    }
    if start > end {
        return Err(ShroudError::InvalidRange(format!(
            "start {start} beyond end {end}"
        )));
    }
    if let Some(size) = plaintext_size {
        if start >= size {
            return Err(ShroudError::RangeNotSatisfiable { start, end, size });
        }
        end = end.min(size - 1);
    }

    let chunk_size = manifest.chunk_size as u64;
    let first_chunk = start / chunk_size;
    let last_chunk = (end / chunk_size).min(manifest.chunk_count - 1);
    if first_chunk > last_chunk {
        // start lies past the final chunk; only possible when the size was
        // unknown and the caller asked beyond the object.
        return Err(ShroudError::RangeNotSatisfiable {
            start,
            end,
            size: manifest.chunk_count * chunk_size,
        });
    }

    let sealed = manifest.sealed_chunk_len();
    Ok(RangePlan {
        first_chunk,
        last_chunk,
        head_trim: start % chunk_size,
        tail_keep: end - last_chunk * chunk_size + 1,
        encrypted_start: first_chunk * sealed,
        encrypted_end: (last_chunk + 1) * sealed - 1,
    })
}

impl RangePlan {
    /// Number of chunks the plan spans.
    pub fn chunk_span(&self) -> u64 {
        self.last_chunk - self.first_chunk + 1
    }

    /// Plaintext bytes the trimmed output will carry, relative to the
    /// decrypted span (assumes all spanned chunks are present in full).
    pub fn plaintext_len(&self, chunk_size: u64) -> u64 {
        (self.chunk_span() - 1) * chunk_size + self.tail_keep - self.head_trim
    }
}

/// Parse an HTTP `Range` header (`bytes=a-b`, `bytes=a-`, `bytes=-N`) into
/// an inclusive plaintext byte range.
///
/// The suffix and open-ended forms need a known total size; for encrypted
/// objects that is the recorded original content length (or the size
/// reconstructed from the manifest and final chunk). Multi-range headers
/// are not supported by the gateway.
pub fn parse_range_header(header: &str, total_size: Option<u64>) -> Result<(u64, u64)> {
    let spec = header
        .strip_prefix("bytes=")
        .ok_or_else(|| ShroudError::InvalidRange(format!("malformed Range header: '{header}'")))?;
    if spec.contains(',') {
        return Err(ShroudError::InvalidRange(
            "multi-range requests are not supported".into(),
        ));
    }

    let (start_str, end_str) = spec
        .split_once('-')
        .ok_or_else(|| ShroudError::InvalidRange(format!("malformed range spec: '{spec}'")))?;

    let parse = |s: &str| -> Result<u64> {
        s.parse::<u64>()
            .map_err(|_| ShroudError::InvalidRange(format!("invalid range bound: '{s}'")))
    };

    let (start, end) = if start_str.is_empty() {
        // Suffix form: last N bytes.
        let suffix = parse(end_str)?;
        let size = total_size.ok_or_else(|| {
            ShroudError::InvalidRange("suffix range requires a known object size".into())
        })?;
        if suffix == 0 {
            return Err(ShroudError::RangeNotSatisfiable {
                start: 0,
                end: 0,
                size,
            });
        }
        (size.saturating_sub(suffix), size - 1)
    } else if end_str.is_empty() {
        // Open-ended form: from offset to the end.
        let start = parse(start_str)?;
        let size = total_size.ok_or_else(|| {
            ShroudError::InvalidRange("open-ended range requires a known object size".into())
        })?;
        if start >= size {
            return Err(ShroudError::RangeNotSatisfiable {
                start,
                end: size.saturating_sub(1),
                size,
            });
        }
        (start, size - 1)
    } else {
        let start = parse(start_str)?;
        let end = parse(end_str)?;
        if start > end {
            return Err(ShroudError::InvalidRange(format!(
                "start {start} beyond end {end}"
            )));
        }
        (start, end)
    };

    if let Some(size) = total_size {
        if start >= size {
            return Err(ShroudError::RangeNotSatisfiable { start, end, size });
        }
        return Ok((start, end.min(size - 1)));
    }
    Ok((start, end))
}
