pub mod local;
pub mod provisioner;

use std::time::Duration;

use tracing::warn;

use shroud_crypto::Dek;
use shroud_types::{Result, ShroudError};

use crate::config::RetryConfig;

/// Identifies the object an operation acts on; flows into audit events
/// and is available to adapters that bind wrapping to object identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectContext {
    pub bucket: String,
    pub key: String,
    /// Propagated trace identifier for log correlation and metric
    /// exemplars; not interpreted by the core.
    pub trace_id: Option<String>,
}

impl ObjectContext {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            trace_id: None,
        }
    }
}

/// Wrapped per-object DEK as persisted in object metadata. The plaintext
/// DEK is never serialized and never logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEnvelope {
    /// Opaque identifier of the wrapping key.
    pub key_id: String,
    pub key_version: u32,
    /// Short adapter tag for diagnostics (e.g. "local-keyring").
    pub provider: String,
    pub ciphertext: Vec<u8>,
}

/// Result of unwrapping: the key plus which wrapping-key version actually
/// decrypted it, so the caller can account rotated reads.
pub struct UnwrappedDek {
    pub dek: Dek,
    pub key_version: u32,
}

impl std::fmt::Debug for UnwrappedDek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnwrappedDek")
            .field("dek", &"<redacted>")
            .field("key_version", &self.key_version)
            .finish()
    }
}

/// Pluggable key-management adapter. The engine depends only on this
/// capability set; concrete providers live behind it.
pub trait KeyManager: Send + Sync {
    /// Short identifier used for diagnostics and metadata.
    fn provider(&self) -> &str;

    /// Wrap a plaintext DEK under the active wrapping key. The envelope's
    /// `key_version` is the active version at call time.
    fn wrap_key(&self, dek: &Dek, ctx: &ObjectContext) -> Result<KeyEnvelope>;

    /// Unwrap an envelope. Implementations honor the dual-read window:
    /// versions `envelope.key_version` down to `envelope.key_version - W`
    /// (clamped to keys that still exist) are tried in order and the first
    /// success wins; exhaustion is `KmsDecrypt`.
    fn unwrap_key(&self, envelope: &KeyEnvelope, ctx: &ObjectContext) -> Result<UnwrappedDek>;

    /// Version of the primary wrapping key.
    fn active_key_version(&self) -> Result<u32>;

    /// Lightweight liveness probe; touches no key material.
    fn health_check(&self) -> Result<()>;

    /// Release underlying connections.
    fn close(&self) -> Result<()>;
}

/// Retry a KMS call on `KmsUnavailable` with exponential backoff and
/// jitter. All other errors (auth, missing key, decrypt failure) are
/// terminal and returned as-is.
pub fn retry_kms<T>(
    config: &RetryConfig,
    op_name: &str,
    f: impl Fn() -> Result<T>,
) -> Result<T> {
    let mut delay_ms = config.retry_delay_ms;
    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let jitter = rand::random::<u64>() % delay_ms.max(1);
            std::thread::sleep(Duration::from_millis(delay_ms + jitter));
            delay_ms = (delay_ms * 2).min(config.retry_max_delay_ms);
        }
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if e.is_retriable() && attempt < config.max_retries => {
                warn!(
                    "kms {op_name}: transient error (attempt {}/{}), retrying: {e}",
                    attempt + 1,
                    config.max_retries,
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or(ShroudError::KmsUnavailable("retries exhausted".into())))
}
