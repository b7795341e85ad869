pub mod aes_gcm;
pub mod algorithm;
pub mod chacha20_poly1305;
pub mod dek;
pub mod kdf;
pub mod select;

pub use algorithm::Algorithm;
pub use dek::Dek;

use shroud_types::Result;

/// AEAD key length shared by both supported algorithms.
pub const KEY_SIZE: usize = 32;
/// Nonce length shared by both supported algorithms.
pub const NONCE_SIZE: usize = 12;
/// Authentication tag length shared by both supported algorithms.
pub const TAG_SIZE: usize = 16;

/// Capability for sealing and opening individual chunks with an explicit
/// nonce. Implementations are selected by [`Algorithm`] at construction;
/// callers hold the capability, not the concrete cipher.
///
/// Both operations append into `out` so pooled buffers can be reused
/// across chunks without reallocating.
pub trait ChunkCipher: Send + Sync {
    fn algorithm(&self) -> Algorithm;

    /// Seal `plaintext` into `out` as `ciphertext || tag`.
    fn seal(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8], out: &mut Vec<u8>) -> Result<()>;

    /// Open `ciphertext || tag` into `out`. Tag verification failure is
    /// reported by the caller as an authentication error; this layer only
    /// signals that opening failed.
    fn open(&self, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8], out: &mut Vec<u8>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(algorithm: Algorithm) {
        let dek = Dek::from_bytes(&[0x42; KEY_SIZE]).unwrap();
        let cipher = algorithm.cipher(&dek);
        let nonce = [7u8; NONCE_SIZE];

        let mut sealed = Vec::new();
        cipher.seal(&nonce, b"attack at dawn", &mut sealed).unwrap();
        assert_eq!(sealed.len(), 14 + TAG_SIZE);

        let mut opened = Vec::new();
        cipher.open(&nonce, &sealed, &mut opened).unwrap();
        assert_eq!(opened, b"attack at dawn");
    }

    #[test]
    fn seal_open_roundtrip_both_algorithms() {
        roundtrip(Algorithm::Aes256Gcm);
        roundtrip(Algorithm::ChaCha20Poly1305);
    }

    #[test]
    fn open_rejects_flipped_bit() {
        let dek = Dek::from_bytes(&[0x42; KEY_SIZE]).unwrap();
        let cipher = Algorithm::Aes256Gcm.cipher(&dek);
        let nonce = [7u8; NONCE_SIZE];

        let mut sealed = Vec::new();
        cipher.seal(&nonce, b"payload", &mut sealed).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        let mut opened = Vec::new();
        assert!(cipher.open(&nonce, &sealed, &mut opened).is_err());
        assert!(opened.is_empty());
    }

    #[test]
    fn open_rejects_wrong_nonce() {
        let dek = Dek::from_bytes(&[0x42; KEY_SIZE]).unwrap();
        let cipher = Algorithm::ChaCha20Poly1305.cipher(&dek);

        let mut sealed = Vec::new();
        cipher.seal(&[1u8; NONCE_SIZE], b"payload", &mut sealed).unwrap();

        let mut opened = Vec::new();
        assert!(cipher.open(&[2u8; NONCE_SIZE], &sealed, &mut opened).is_err());
    }

    #[test]
    fn seal_reuses_buffer_capacity() {
        let dek = Dek::from_bytes(&[0x42; KEY_SIZE]).unwrap();
        let cipher = Algorithm::Aes256Gcm.cipher(&dek);
        let nonce = [0u8; NONCE_SIZE];

        let mut out = Vec::with_capacity(1024);
        let ptr = out.as_ptr();
        cipher.seal(&nonce, &[0xAB; 100], &mut out).unwrap();
        assert_eq!(out.len(), 100 + TAG_SIZE);
        assert_eq!(out.as_ptr(), ptr, "seal should not reallocate");
    }
}
