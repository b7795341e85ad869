use serde::{Deserialize, Serialize};

use shroud_crypto::Algorithm;
use shroud_types::{Result, ShroudError};

use crate::manifest::{validate_chunk_size, DEFAULT_CHUNK_SIZE};
use crate::metadata::DEFAULT_METADATA_BUDGET;

/// Which AEAD new objects are sealed with. `Auto` micro-benchmarks both
/// engines once at startup; decryption always honors the algorithm
/// recorded on the object regardless of this setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmChoice {
    #[default]
    Auto,
    #[serde(untagged)]
    Fixed(Algorithm),
}

/// Retry policy for KMS calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

/// Engine configuration. Loading and merging from files or the
/// environment is the embedding application's concern; this crate only
/// defines the shape, defaults, and validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub algorithm: AlgorithmChoice,

    /// Plaintext bytes per chunk; fixed for the lifetime of an object.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Worker threads for the seal/open pipeline. 0 means auto
    /// (`max(2, min(available_parallelism, 32))`).
    #[serde(default)]
    pub workers: usize,

    /// Objects at or below this many bytes (when the size is known) are
    /// processed with a single worker; the pipeline degenerates to the
    /// serial path.
    #[serde(default = "default_serial_threshold")]
    pub serial_threshold: u64,

    /// How many wrapping-key versions behind the envelope's recorded
    /// version unwrapping may reach during rotation.
    #[serde(default = "default_dual_read_window")]
    pub dual_read_window: u32,

    /// Per-provider cap on encoded crypto metadata, in bytes.
    #[serde(default = "default_metadata_budget")]
    pub metadata_budget: usize,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_serial_threshold() -> u64 {
    2 * DEFAULT_CHUNK_SIZE as u64
}

fn default_dual_read_window() -> u32 {
    1
}

fn default_metadata_budget() -> usize {
    DEFAULT_METADATA_BUDGET
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    2_000
}

const MAX_WORKERS: usize = 32;

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            algorithm: AlgorithmChoice::Auto,
            chunk_size: default_chunk_size(),
            workers: 0,
            serial_threshold: default_serial_threshold(),
            dual_read_window: default_dual_read_window(),
            metadata_budget: default_metadata_budget(),
            retry: RetryConfig::default(),
        }
    }
}

impl EncryptionConfig {
    pub fn validate(&self) -> Result<()> {
        validate_chunk_size(self.chunk_size)?;
        if self.workers > MAX_WORKERS {
            return Err(ShroudError::Config(format!(
                "workers {} exceeds the maximum of {MAX_WORKERS}",
                self.workers
            )));
        }
        if self.metadata_budget == 0 {
            return Err(ShroudError::Config(
                "metadata budget must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Worker count for an object of `declared_len` bytes (when known).
    pub fn resolved_workers(&self, declared_len: Option<u64>) -> usize {
        if declared_len.is_some_and(|len| len <= self.serial_threshold) {
            return 1;
        }
        if self.workers > 0 {
            return self.workers;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        cpus.clamp(2, MAX_WORKERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EncryptionConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_chunk_size_rejected() {
        let config = EncryptionConfig {
            chunk_size: 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn excessive_workers_rejected() {
        let config = EncryptionConfig {
            workers: 64,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn small_objects_run_serial() {
        let config = EncryptionConfig {
            workers: 8,
            ..Default::default()
        };
        assert_eq!(config.resolved_workers(Some(1024)), 1);
        assert_eq!(config.resolved_workers(Some(100 * 1024 * 1024)), 8);
        // Unknown length cannot assume small.
        assert_eq!(config.resolved_workers(None), 8);
    }

    #[test]
    fn auto_workers_at_least_two() {
        let config = EncryptionConfig::default();
        assert!(config.resolved_workers(None) >= 2);
        assert!(config.resolved_workers(None) <= MAX_WORKERS);
    }

    #[test]
    fn algorithm_choice_parses_from_json() {
        let auto: AlgorithmChoice = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(auto, AlgorithmChoice::Auto);

        let fixed: AlgorithmChoice = serde_json::from_str("\"chacha20-poly1305\"").unwrap();
        assert_eq!(fixed, AlgorithmChoice::Fixed(Algorithm::ChaCha20Poly1305));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: EncryptionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.dual_read_window, 1);
        assert_eq!(config.retry.max_retries, 3);
    }
}
