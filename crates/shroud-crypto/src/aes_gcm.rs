use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use zeroize::Zeroize;

use shroud_types::{Result, ShroudError};

use crate::{Algorithm, ChunkCipher, Dek, NONCE_SIZE};

/// AES-256-GCM chunk cipher.
pub struct Aes256GcmCipher {
    cipher: Aes256Gcm,
}

impl Aes256GcmCipher {
    pub fn new(dek: &Dek) -> Self {
        let cipher =
            Aes256Gcm::new_from_slice(dek.as_bytes()).expect("valid 32-byte key for AES-256-GCM");
        Self { cipher }
    }
}

impl ChunkCipher for Aes256GcmCipher {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Aes256Gcm
    }

    fn seal(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8], out: &mut Vec<u8>) -> Result<()> {
        out.clear();
        out.extend_from_slice(plaintext);
        self.cipher
            .encrypt_in_place(Nonce::from_slice(nonce), b"", out)
            .map_err(|e| ShroudError::Crypto(format!("AES-GCM seal: {e}")))
    }

    fn open(&self, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8], out: &mut Vec<u8>) -> Result<()> {
        out.clear();
        out.extend_from_slice(ciphertext);
        let result = self.cipher.decrypt_in_place(Nonce::from_slice(nonce), b"", out);
        if let Err(e) = result {
            // The buffer may hold unauthenticated plaintext at this point;
            // scrub it before handing control back.
            out.zeroize();
            return Err(ShroudError::Crypto(format!("AES-GCM open: {e}")));
        }
        Ok(())
    }
}
