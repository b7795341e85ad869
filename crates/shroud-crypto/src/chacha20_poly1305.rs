use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use zeroize::Zeroize;

use shroud_types::{Result, ShroudError};

use crate::{Algorithm, ChunkCipher, Dek, NONCE_SIZE};

/// ChaCha20-Poly1305 chunk cipher.
pub struct ChaCha20Poly1305Cipher {
    cipher: ChaCha20Poly1305,
}

impl ChaCha20Poly1305Cipher {
    pub fn new(dek: &Dek) -> Self {
        let cipher = ChaCha20Poly1305::new_from_slice(dek.as_bytes())
            .expect("valid 32-byte key for ChaCha20-Poly1305");
        Self { cipher }
    }
}

impl ChunkCipher for ChaCha20Poly1305Cipher {
    fn algorithm(&self) -> Algorithm {
        Algorithm::ChaCha20Poly1305
    }

    fn seal(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8], out: &mut Vec<u8>) -> Result<()> {
        out.clear();
        out.extend_from_slice(plaintext);
        self.cipher
            .encrypt_in_place(Nonce::from_slice(nonce), b"", out)
            .map_err(|e| ShroudError::Crypto(format!("ChaCha20-Poly1305 seal: {e}")))
    }

    fn open(&self, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8], out: &mut Vec<u8>) -> Result<()> {
        out.clear();
        out.extend_from_slice(ciphertext);
        let result = self.cipher.decrypt_in_place(Nonce::from_slice(nonce), b"", out);
        if let Err(e) = result {
            // The buffer may hold unauthenticated plaintext at this point;
            // scrub it before handing control back.
            out.zeroize();
            return Err(ShroudError::Crypto(format!("ChaCha20-Poly1305 open: {e}")));
        }
        Ok(())
    }
}
