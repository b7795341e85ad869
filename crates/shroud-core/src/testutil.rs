use std::sync::Arc;

use shroud_crypto::Algorithm;

use crate::config::{AlgorithmChoice, EncryptionConfig};
use crate::engine::Engine;
use crate::kms::local::LocalKeyManager;
use crate::kms::provisioner::KeyProvisioner;

/// Deterministic byte pattern used across tests.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

pub fn test_config(algorithm: Algorithm, chunk_size: usize, workers: usize) -> EncryptionConfig {
    EncryptionConfig {
        algorithm: AlgorithmChoice::Fixed(algorithm),
        chunk_size,
        workers,
        serial_threshold: 0,
        ..Default::default()
    }
}

/// Engine in password-fallback mode.
pub fn password_engine(algorithm: Algorithm, chunk_size: usize, workers: usize) -> Engine {
    Engine::new(
        test_config(algorithm, chunk_size, workers),
        KeyProvisioner::Password {
            password: "test-password".into(),
        },
    )
    .expect("test engine")
}

/// Engine backed by a fresh local keyring; returns both so tests can
/// drive rotation.
pub fn kms_engine(
    algorithm: Algorithm,
    chunk_size: usize,
    dual_read_window: u32,
) -> (Engine, Arc<LocalKeyManager>) {
    let manager = Arc::new(LocalKeyManager::new("test-wrap-key", dual_read_window));
    let engine = Engine::new(
        test_config(algorithm, chunk_size, 2),
        KeyProvisioner::Kms(Arc::clone(&manager) as _),
    )
    .expect("test engine");
    (engine, manager)
}
