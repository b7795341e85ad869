use std::collections::BTreeMap;
use std::sync::RwLock;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use zeroize::Zeroizing;

use shroud_crypto::{Dek, KEY_SIZE, NONCE_SIZE};
use shroud_types::{Result, ShroudError};

use super::{KeyEnvelope, KeyManager, ObjectContext, UnwrappedDek};

const PROVIDER: &str = "local-keyring";

/// In-process key manager backed by a versioned keyring of 32-byte
/// wrapping keys. DEKs are wrapped with AES-256-GCM under the active
/// version; the object identity (bucket/key) is bound as AAD so an
/// envelope copied onto another object fails to unwrap.
///
/// `rotate()` installs a new active version and drops keys older than
/// `active - dual_read_window`, which is what gives recently-rotated
/// objects a grace period while older ones surface `KmsDecrypt`.
pub struct LocalKeyManager {
    key_id: String,
    dual_read_window: u32,
    state: RwLock<KeyringState>,
}

struct KeyringState {
    keys: BTreeMap<u32, Zeroizing<[u8; KEY_SIZE]>>,
    active_version: u32,
    closed: bool,
}

fn random_wrapping_key() -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    rand::rngs::OsRng.fill_bytes(key.as_mut());
    key
}

fn wrap_aad(ctx: &ObjectContext) -> Vec<u8> {
    let mut aad = Vec::with_capacity(ctx.bucket.len() + ctx.key.len() + 1);
    aad.extend_from_slice(ctx.bucket.as_bytes());
    aad.push(0);
    aad.extend_from_slice(ctx.key.as_bytes());
    aad
}

impl LocalKeyManager {
    /// Start a keyring at version 1 with a random wrapping key.
    pub fn new(key_id: impl Into<String>, dual_read_window: u32) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(1, random_wrapping_key());
        Self {
            key_id: key_id.into(),
            dual_read_window,
            state: RwLock::new(KeyringState {
                keys,
                active_version: 1,
                closed: false,
            }),
        }
    }

    /// Install a new active wrapping key and retire keys that fall out of
    /// the dual-read window. Returns the new active version.
    pub fn rotate(&self) -> Result<u32> {
        let mut state = self.state.write().unwrap();
        if state.closed {
            return Err(ShroudError::KmsUnavailable("key manager closed".into()));
        }
        let next = state.active_version + 1;
        state.keys.insert(next, random_wrapping_key());
        state.active_version = next;
        let horizon = next.saturating_sub(self.dual_read_window);
        state.keys.retain(|version, _| *version >= horizon);
        Ok(next)
    }

    fn cipher_for(key: &[u8; KEY_SIZE]) -> Aes256Gcm {
        Aes256Gcm::new_from_slice(key).expect("valid 32-byte wrapping key")
    }
}

impl KeyManager for LocalKeyManager {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn wrap_key(&self, dek: &Dek, ctx: &ObjectContext) -> Result<KeyEnvelope> {
        let state = self.state.read().unwrap();
        if state.closed {
            return Err(ShroudError::KmsUnavailable("key manager closed".into()));
        }
        let version = state.active_version;
        let key = state
            .keys
            .get(&version)
            .ok_or_else(|| ShroudError::KmsNoSuchKey(format!("version {version}")))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = Self::cipher_for(key)
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: dek.as_bytes(),
                    aad: &wrap_aad(ctx),
                },
            )
            .map_err(|e| ShroudError::Crypto(format!("wrap data key: {e}")))?;

        // Envelope ciphertext carries its nonce up front.
        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);

        Ok(KeyEnvelope {
            key_id: self.key_id.clone(),
            key_version: version,
            provider: PROVIDER.to_string(),
            ciphertext: sealed,
        })
    }

    fn unwrap_key(&self, envelope: &KeyEnvelope, ctx: &ObjectContext) -> Result<UnwrappedDek> {
        let state = self.state.read().unwrap();
        if state.closed {
            return Err(ShroudError::KmsUnavailable("key manager closed".into()));
        }
        if envelope.key_id != self.key_id {
            return Err(ShroudError::KmsNoSuchKey(envelope.key_id.clone()));
        }
        if envelope.ciphertext.len() < NONCE_SIZE + KEY_SIZE {
            return Err(ShroudError::KmsDecrypt);
        }
        let (nonce_bytes, ciphertext) = envelope.ciphertext.split_at(NONCE_SIZE);
        let aad = wrap_aad(ctx);

        // Dual-read: walk back from the envelope's version through the
        // window, skipping versions already retired from the keyring.
        let floor = envelope.key_version.saturating_sub(self.dual_read_window);
        for version in (floor..=envelope.key_version).rev() {
            let Some(key) = state.keys.get(&version) else {
                continue;
            };
            let opened = Self::cipher_for(key).decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            );
            if let Ok(plaintext) = opened {
                let plaintext = Zeroizing::new(plaintext);
                let dek = Dek::from_bytes(&plaintext)?;
                return Ok(UnwrappedDek {
                    dek,
                    key_version: version,
                });
            }
        }
        Err(ShroudError::KmsDecrypt)
    }

    fn active_key_version(&self) -> Result<u32> {
        let state = self.state.read().unwrap();
        if state.closed {
            return Err(ShroudError::KmsUnavailable("key manager closed".into()));
        }
        Ok(state.active_version)
    }

    fn health_check(&self) -> Result<()> {
        let state = self.state.read().unwrap();
        if state.closed {
            return Err(ShroudError::KmsUnavailable("key manager closed".into()));
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        state.closed = true;
        state.keys.clear();
        Ok(())
    }
}
