use serde::{Deserialize, Serialize};
use shroud_types::{Result, ShroudError};

use crate::aes_gcm::Aes256GcmCipher;
use crate::chacha20_poly1305::ChaCha20Poly1305Cipher;
use crate::{ChunkCipher, Dek};

/// Supported AEAD algorithms. Both use 12-byte nonces and 16-byte tags, so
/// the chunk framing is identical and only this id is recorded per object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl Algorithm {
    /// Name stored in object metadata.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Algorithm::Aes256Gcm => "AES-256-GCM",
            Algorithm::ChaCha20Poly1305 => "ChaCha20-Poly1305",
        }
    }

    /// Parse the metadata value. The match is case-insensitive to tolerate
    /// header-normalizing proxies, but no aliases are accepted.
    pub fn from_wire_name(name: &str) -> Result<Algorithm> {
        match name.to_ascii_lowercase().as_str() {
            "aes-256-gcm" => Ok(Algorithm::Aes256Gcm),
            "chacha20-poly1305" => Ok(Algorithm::ChaCha20Poly1305),
            other => Err(ShroudError::Config(format!(
                "unsupported AEAD algorithm: '{other}'"
            ))),
        }
    }

    /// Instantiate the cipher capability for this algorithm.
    pub fn cipher(&self, dek: &Dek) -> Box<dyn ChunkCipher> {
        match self {
            Algorithm::Aes256Gcm => Box::new(Aes256GcmCipher::new(dek)),
            Algorithm::ChaCha20Poly1305 => Box::new(ChaCha20Poly1305Cipher::new(dek)),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}
