use std::sync::Arc;

use tracing::debug;

use shroud_crypto::kdf::{self, KdfParams};
use shroud_crypto::Dek;
use shroud_types::{Result, ShroudError};

use super::{retry_kms, KeyManager, ObjectContext};
use crate::config::RetryConfig;
use crate::metadata::KeySource;
use crate::metrics::Metrics;

/// Supplies the per-object AEAD key on encrypt and recovers it on
/// decrypt. Two modes exist: KMS-backed envelope encryption, and the
/// password-derived fallback when no KMS is configured.
pub enum KeyProvisioner {
    Kms(Arc<dyn KeyManager>),
    Password { password: String },
}

impl KeyProvisioner {
    /// Create a fresh DEK (or derived key) for a new object, together
    /// with the key-source record to store in its metadata.
    pub fn provision(
        &self,
        ctx: &ObjectContext,
        retry: &RetryConfig,
        metrics: &Metrics,
    ) -> Result<(Dek, KeySource)> {
        match self {
            KeyProvisioner::Kms(manager) => {
                let dek = Dek::generate();
                let envelope = metrics.time_kms_op("wrap", || {
                    retry_kms(retry, "wrap_key", || manager.wrap_key(&dek, ctx))
                })?;
                Ok((dek, KeySource::Envelope(envelope)))
            }
            KeyProvisioner::Password { password } => {
                let salt = kdf::generate_salt();
                let params = KdfParams::default();
                let dek = kdf::derive_fallback_key(password, &salt, &params)?;
                Ok((dek, KeySource::PasswordDerived { salt, kdf: params }))
            }
        }
    }

    /// Recover the AEAD key for an existing object from its stored key
    /// source. Rotated reads (an envelope unwrapped by a non-active key
    /// version) are reported to metrics here, exactly once per operation.
    pub fn recover(
        &self,
        source: &KeySource,
        ctx: &ObjectContext,
        retry: &RetryConfig,
        metrics: &Metrics,
    ) -> Result<Dek> {
        match (self, source) {
            (KeyProvisioner::Kms(manager), KeySource::Envelope(envelope)) => {
                let unwrapped = metrics.time_kms_op("unwrap", || {
                    retry_kms(retry, "unwrap_key", || manager.unwrap_key(envelope, ctx))
                })?;
                if unwrapped.key_version != envelope.key_version {
                    debug!(
                        stored = envelope.key_version,
                        used = unwrapped.key_version,
                        "envelope unwrapped by a non-referenced key version"
                    );
                }
                let active = manager.active_key_version()?;
                if unwrapped.key_version != active {
                    metrics.record_rotated_read(unwrapped.key_version, active);
                }
                Ok(unwrapped.dek)
            }
            (KeyProvisioner::Password { password }, KeySource::PasswordDerived { salt, kdf }) => {
                kdf::derive_fallback_key(password, salt, kdf)
            }
            (KeyProvisioner::Password { .. }, KeySource::Envelope(_)) => Err(ShroudError::Config(
                "object is KMS-wrapped but no key manager is configured".into(),
            )),
            (KeyProvisioner::Kms(_), KeySource::PasswordDerived { .. }) => Err(ShroudError::Config(
                "object uses the password fallback but a key manager is configured".into(),
            )),
        }
    }

    pub fn health_check(&self) -> Result<()> {
        match self {
            KeyProvisioner::Kms(manager) => manager.health_check(),
            KeyProvisioner::Password { .. } => Ok(()),
        }
    }

    pub fn close(&self) -> Result<()> {
        match self {
            KeyProvisioner::Kms(manager) => manager.close(),
            KeyProvisioner::Password { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::local::LocalKeyManager;

    fn ctx() -> ObjectContext {
        ObjectContext::new("bucket", "key")
    }

    #[test]
    fn kms_provision_recover_round_trip() {
        let provisioner = KeyProvisioner::Kms(Arc::new(LocalKeyManager::new("k1", 1)));
        let metrics = Metrics::new();
        let retry = RetryConfig::default();

        let (dek, source) = provisioner.provision(&ctx(), &retry, &metrics).unwrap();
        assert!(matches!(source, KeySource::Envelope(_)));

        let recovered = provisioner.recover(&source, &ctx(), &retry, &metrics).unwrap();
        assert_eq!(recovered.as_bytes(), dek.as_bytes());
        assert!(metrics.snapshot().rotated_reads.is_empty());
    }

    #[test]
    fn password_provision_recover_round_trip() {
        let provisioner = KeyProvisioner::Password {
            password: "correct horse".into(),
        };
        let metrics = Metrics::new();
        let retry = RetryConfig::default();

        let (dek, source) = provisioner.provision(&ctx(), &retry, &metrics).unwrap();
        let KeySource::PasswordDerived { salt, .. } = &source else {
            panic!("expected password-derived source");
        };
        assert_eq!(salt.len(), 32);

        let recovered = provisioner.recover(&source, &ctx(), &retry, &metrics).unwrap();
        assert_eq!(recovered.as_bytes(), dek.as_bytes());
    }

    #[test]
    fn rotated_read_is_counted_once() {
        let manager = Arc::new(LocalKeyManager::new("k1", 1));
        let provisioner = KeyProvisioner::Kms(Arc::clone(&manager) as Arc<dyn KeyManager>);
        let metrics = Metrics::new();
        let retry = RetryConfig::default();

        let (_dek, source) = provisioner.provision(&ctx(), &retry, &metrics).unwrap();
        manager.rotate().unwrap();

        provisioner.recover(&source, &ctx(), &retry, &metrics).unwrap();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rotated_reads.get(&(1, 2)), Some(&1));
        assert_eq!(snapshot.rotated_reads.len(), 1);
    }

    #[test]
    fn mode_mismatch_is_config_error() {
        let kms = KeyProvisioner::Kms(Arc::new(LocalKeyManager::new("k1", 1)));
        let password = KeyProvisioner::Password {
            password: "pw".into(),
        };
        let metrics = Metrics::new();
        let retry = RetryConfig::default();

        let (_, envelope_source) = kms.provision(&ctx(), &retry, &metrics).unwrap();
        let (_, password_source) = password.provision(&ctx(), &retry, &metrics).unwrap();

        let err = password
            .recover(&envelope_source, &ctx(), &retry, &metrics)
            .unwrap_err();
        assert_eq!(err.kind(), shroud_types::ErrorKind::Config);

        let err = kms
            .recover(&password_source, &ctx(), &retry, &metrics)
            .unwrap_err();
        assert_eq!(err.kind(), shroud_types::ErrorKind::Config);
    }
}
