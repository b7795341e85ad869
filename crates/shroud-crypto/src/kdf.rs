use argon2::Argon2;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use shroud_types::{Result, ShroudError};

use crate::{Dek, KEY_SIZE};

/// KDF parameters recorded in object metadata so the derivation stays
/// reproducible when defaults change in a later release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    #[serde(rename = "alg")]
    pub algorithm: String,
    #[serde(rename = "t")]
    pub time_cost: u32,
    #[serde(rename = "m")]
    pub memory_cost: u32,
    #[serde(rename = "p")]
    pub parallelism: u32,
}

// Parameter bounds to reject maliciously crafted metadata before it can
// drive a denial-of-service allocation.
const MAX_TIME_COST: u32 = 10;
const MAX_PARALLELISM: u32 = 16;
const MAX_MEMORY_KIB: u32 = 524_288; // 512 MiB
pub const SALT_LEN: usize = 32;
const MIN_SALT_LEN: usize = 16;
const MAX_SALT_LEN: usize = 64;

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            algorithm: "argon2id".to_string(),
            time_cost: 3,
            memory_cost: 65536, // 64 MiB
            parallelism: 4,
        }
    }
}

impl KdfParams {
    pub fn validate(&self) -> Result<()> {
        if self.algorithm != "argon2id" {
            return Err(ShroudError::MetadataMalformed(format!(
                "unsupported KDF algorithm: '{}'",
                self.algorithm
            )));
        }
        if self.time_cost == 0 || self.time_cost > MAX_TIME_COST {
            return Err(ShroudError::MetadataMalformed(
                "KDF time cost out of bounds".into(),
            ));
        }
        if self.parallelism == 0 || self.parallelism > MAX_PARALLELISM {
            return Err(ShroudError::MetadataMalformed(
                "KDF parallelism out of bounds".into(),
            ));
        }
        if self.memory_cost == 0 || self.memory_cost > MAX_MEMORY_KIB {
            return Err(ShroudError::MetadataMalformed(
                "KDF memory cost out of bounds".into(),
            ));
        }
        Ok(())
    }
}

/// Generate a fresh per-object salt from OS entropy.
pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

fn validate_salt(salt: &[u8]) -> Result<()> {
    if salt.len() < MIN_SALT_LEN || salt.len() > MAX_SALT_LEN {
        return Err(ShroudError::MetadataMalformed(format!(
            "KDF salt length {} out of bounds",
            salt.len()
        )));
    }
    Ok(())
}

/// Derive the fallback AEAD key from the configured password and a
/// per-object salt using Argon2id. Used when no KMS is configured; the
/// derived key takes the place of a wrapped DEK and no envelope exists.
pub fn derive_fallback_key(password: &str, salt: &[u8], params: &KdfParams) -> Result<Dek> {
    params.validate()?;
    validate_salt(salt)?;

    let argon_params = argon2::Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| ShroudError::Crypto(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon_params,
    );

    let mut output = zeroize::Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(password.as_bytes(), salt, output.as_mut())
        .map_err(|e| ShroudError::Crypto(format!("argon2 hash: {e}")))?;
    Dek::from_bytes(output.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> KdfParams {
        KdfParams {
            algorithm: "argon2id".to_string(),
            time_cost: 1,
            memory_cost: 8192,
            parallelism: 1,
        }
    }

    #[test]
    fn derivation_is_deterministic() {
        let salt = [0x11u8; SALT_LEN];
        let a = derive_fallback_key("pw", &salt, &fast_params()).unwrap();
        let b = derive_fallback_key("pw", &salt, &fast_params()).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn salt_changes_the_key() {
        let a = derive_fallback_key("pw", &[0x11u8; SALT_LEN], &fast_params()).unwrap();
        let b = derive_fallback_key("pw", &[0x22u8; SALT_LEN], &fast_params()).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn password_changes_the_key() {
        let salt = [0x11u8; SALT_LEN];
        let a = derive_fallback_key("pw", &salt, &fast_params()).unwrap();
        let b = derive_fallback_key("pw2", &salt, &fast_params()).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn rejects_non_argon2id() {
        let mut params = fast_params();
        params.algorithm = "pbkdf2".to_string();
        assert!(derive_fallback_key("pw", &[0u8; SALT_LEN], &params).is_err());
    }

    #[test]
    fn rejects_excessive_memory() {
        let mut params = fast_params();
        params.memory_cost = u32::MAX;
        assert!(params.validate().is_err());
    }

    #[test]
    fn rejects_zero_time_cost() {
        let mut params = fast_params();
        params.time_cost = 0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn rejects_short_salt() {
        assert!(derive_fallback_key("pw", &[0u8; 8], &fast_params()).is_err());
    }

    #[test]
    fn params_serde_uses_short_names() {
        let json = serde_json::to_string(&fast_params()).unwrap();
        assert_eq!(json, r#"{"alg":"argon2id","t":1,"m":8192,"p":1}"#);
    }
}
