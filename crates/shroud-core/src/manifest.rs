use serde::{Deserialize, Serialize};

use shroud_crypto::{NONCE_SIZE, TAG_SIZE};
use shroud_types::{Result, ShroudError};

/// Default plaintext chunk size (64 KiB): balances per-chunk tag overhead
/// against buffer memory.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
/// Smallest accepted chunk size.
pub const MIN_CHUNK_SIZE: usize = 16 * 1024;
/// Largest accepted chunk size.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Only manifest version currently defined.
pub const MANIFEST_VERSION: u32 = 1;

/// Layout descriptor for one chunked encrypted object, stored compactly in
/// object metadata. Together with the DEK it is sufficient to decrypt any
/// chunk independently: chunk `i` occupies encrypted bytes
/// `[i*(cs+16), (i+1)*(cs+16))` and is sealed under the nonce derived from
/// `base_iv` and `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    #[serde(rename = "v")]
    pub version: u32,
    #[serde(rename = "cs")]
    pub chunk_size: u32,
    #[serde(rename = "cc")]
    pub chunk_count: u64,
    #[serde(rename = "iv", with = "crate::metadata::base64url_bytes")]
    pub base_iv: [u8; NONCE_SIZE],
}

/// Validate a chunk size against the accepted bounds.
pub fn validate_chunk_size(chunk_size: usize) -> Result<()> {
    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
        return Err(ShroudError::Config(format!(
            "chunk size {chunk_size} outside [{MIN_CHUNK_SIZE}, {MAX_CHUNK_SIZE}]"
        )));
    }
    Ok(())
}

impl ChunkManifest {
    pub fn new(chunk_size: usize, base_iv: [u8; NONCE_SIZE]) -> Result<Self> {
        validate_chunk_size(chunk_size)?;
        Ok(Self {
            version: MANIFEST_VERSION,
            chunk_size: chunk_size as u32,
            chunk_count: 0,
            base_iv,
        })
    }

    /// Structural checks applied after decoding from metadata. Unknown
    /// future versions are rejected here, before any cryptographic work.
    pub fn validate(&self) -> Result<()> {
        if self.version != MANIFEST_VERSION {
            return Err(ShroudError::Config(format!(
                "unsupported manifest version {}",
                self.version
            )));
        }
        validate_chunk_size(self.chunk_size as usize)
    }

    /// Length of sealed chunk bytes on the wire for a full chunk.
    pub fn sealed_chunk_len(&self) -> u64 {
        self.chunk_size as u64 + TAG_SIZE as u64
    }

    /// Offset of chunk `i` within the encrypted stream.
    pub fn sealed_offset(&self, index: u64) -> u64 {
        index * self.sealed_chunk_len()
    }

    /// Total encrypted length for a known plaintext length.
    pub fn sealed_total_len(plaintext_len: u64, chunk_size: usize) -> u64 {
        let count = chunk_count_for_len(plaintext_len, chunk_size);
        plaintext_len + count * TAG_SIZE as u64
    }

    /// Total plaintext size, when recoverable. The manifest alone does not
    /// record the final chunk's length, so this needs either the recorded
    /// original content length or the observed length of the final sealed
    /// chunk (its ciphertext length minus the tag).
    pub fn plaintext_size(
        &self,
        original_content_length: Option<u64>,
        final_sealed_len: Option<u64>,
    ) -> Option<u64> {
        if let Some(len) = original_content_length {
            return Some(len);
        }
        let final_plain = final_sealed_len?.checked_sub(TAG_SIZE as u64)?;
        if self.chunk_count == 0 {
            return Some(0);
        }
        Some((self.chunk_count - 1) * self.chunk_size as u64 + final_plain)
    }
}

/// Number of chunks a plaintext of `len` bytes occupies. Zero-length
/// objects produce zero chunks (and a zero-length encrypted stream).
pub fn chunk_count_for_len(len: u64, chunk_size: usize) -> u64 {
    len.div_ceil(chunk_size as u64)
}

/// Derive the nonce for chunk `index`: the object's random base IV with
/// its last four bytes XORed against the big-endian chunk index.
///
/// Uniqueness per (key, nonce) pair holds because the base IV is fresh per
/// object (and per DEK) and the index is unique within the object; the
/// 2^32 index space at >=16 KiB chunks covers objects up to 64 TiB.
pub fn derive_chunk_iv(base_iv: &[u8; NONCE_SIZE], index: u32) -> [u8; NONCE_SIZE] {
    let mut iv = *base_iv;
    let index_bytes = index.to_be_bytes();
    for i in 0..4 {
        iv[NONCE_SIZE - 1 - i] ^= index_bytes[3 - i];
    }
    iv
}

/// Chunk indices must fit the 32-bit nonce counter.
pub fn checked_chunk_index(index: u64) -> Result<u32> {
    u32::try_from(index)
        .map_err(|_| ShroudError::Config("object exceeds the 2^32 chunk limit".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn chunk_size_bounds() {
        assert!(validate_chunk_size(MIN_CHUNK_SIZE).is_ok());
        assert!(validate_chunk_size(MAX_CHUNK_SIZE).is_ok());
        assert!(validate_chunk_size(MIN_CHUNK_SIZE - 1).is_err());
        assert!(validate_chunk_size(MAX_CHUNK_SIZE + 1).is_err());
        assert!(validate_chunk_size(0).is_err());
    }

    #[test]
    fn future_manifest_version_rejected() {
        let mut manifest = ChunkManifest::new(DEFAULT_CHUNK_SIZE, [0; NONCE_SIZE]).unwrap();
        manifest.version = 2;
        let err = manifest.validate().unwrap_err();
        assert_eq!(err.kind(), shroud_types::ErrorKind::Config);
    }

    #[test]
    fn chunk_count_math() {
        assert_eq!(chunk_count_for_len(0, 65536), 0);
        assert_eq!(chunk_count_for_len(1, 65536), 1);
        assert_eq!(chunk_count_for_len(65536, 65536), 1);
        assert_eq!(chunk_count_for_len(65537, 65536), 2);
        assert_eq!(chunk_count_for_len(2 * 1024 * 1024, 65536), 32);
    }

    #[test]
    fn sealed_layout_math() {
        let manifest = ChunkManifest {
            version: 1,
            chunk_size: 65536,
            chunk_count: 32,
            base_iv: [0; NONCE_SIZE],
        };
        assert_eq!(manifest.sealed_chunk_len(), 65552);
        assert_eq!(manifest.sealed_offset(0), 0);
        assert_eq!(manifest.sealed_offset(31), 31 * 65552);
        assert_eq!(
            ChunkManifest::sealed_total_len(2 * 1024 * 1024, 65536),
            2_098_688
        );
        assert_eq!(ChunkManifest::sealed_total_len(11, 65536), 27);
    }

    #[test]
    fn derived_ivs_are_unique() {
        let base = [0xC3u8; NONCE_SIZE];
        let mut seen = HashSet::new();
        for index in (0..10_000u32).chain([u32::MAX - 1, u32::MAX]) {
            assert!(seen.insert(derive_chunk_iv(&base, index)), "dup at {index}");
        }
    }

    #[test]
    fn index_zero_is_the_base_iv() {
        let base = [0x5Au8; NONCE_SIZE];
        assert_eq!(derive_chunk_iv(&base, 0), base);
    }

    #[test]
    fn derivation_only_touches_last_four_bytes() {
        let base = [0xFFu8; NONCE_SIZE];
        let iv = derive_chunk_iv(&base, u32::MAX);
        assert_eq!(&iv[..NONCE_SIZE - 4], &base[..NONCE_SIZE - 4]);
        assert_eq!(&iv[NONCE_SIZE - 4..], &[0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn plaintext_size_prefers_metadata() {
        let manifest = ChunkManifest {
            version: 1,
            chunk_size: 65536,
            chunk_count: 2,
            base_iv: [0; NONCE_SIZE],
        };
        assert_eq!(manifest.plaintext_size(Some(70_000), None), Some(70_000));
        // Without metadata, the final sealed chunk length recovers it.
        assert_eq!(
            manifest.plaintext_size(None, Some(4464 + TAG_SIZE as u64)),
            Some(65536 + 4464)
        );
        assert_eq!(manifest.plaintext_size(None, None), None);
    }

    #[test]
    fn chunk_index_limit() {
        assert_eq!(checked_chunk_index(0).unwrap(), 0);
        assert_eq!(checked_chunk_index(u32::MAX as u64).unwrap(), u32::MAX);
        assert!(checked_chunk_index(u32::MAX as u64 + 1).is_err());
    }
}
