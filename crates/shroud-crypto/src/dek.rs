use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use shroud_types::{Result, ShroudError};

use crate::KEY_SIZE;

/// Per-object data-encryption key. Generated fresh for every encrypted
/// object, wrapped immediately, and zeroized on drop so plaintext key
/// material never outlives the operation that owns it.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Dek([u8; KEY_SIZE]);

impl Dek {
    /// Generate a random DEK from OS entropy.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Wrap unwrapped key bytes. The source slice is not consumed; callers
    /// that hold key material in their own buffer remain responsible for
    /// scrubbing it.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(ShroudError::Crypto(format!(
                "data key must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

// Keys never appear in logs, even at debug level.
impl std::fmt::Debug for Dek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Dek(..)")
    }
}
