use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use shroud_crypto::kdf::KdfParams;
use shroud_crypto::Algorithm;

use crate::cancel::CancelToken;
use crate::engine::ClientObjectInfo;
use crate::kms::{KeyManager, ObjectContext};
use crate::metadata::ObjectCryptoMetadata;
use crate::storage::memory::MemoryStore;
use crate::storage::ObjectStore;
use crate::testutil::{kms_engine, password_engine, pattern};

fn ctx(key: &str) -> ObjectContext {
    ObjectContext::new("compat-bucket", key)
}

/// Objects written under older (cheaper) KDF parameters keep decrypting
/// after the defaults change, because the parameters travel with the
/// object.
#[test]
fn old_kdf_parameters_still_decrypt() {
    let engine = password_engine(Algorithm::Aes256Gcm, 16 * 1024, 2);
    let store = MemoryStore::new();
    let data = pattern(30_000);

    engine
        .put_object(
            &store,
            &ctx("kdf"),
            Cursor::new(data.clone()),
            ClientObjectInfo {
                content_length: Some(30_000),
                ..Default::default()
            },
            &BTreeMap::new(),
            CancelToken::new(),
        )
        .unwrap();

    // Rewrite the object's metadata as if it had been produced with an
    // older parameter set, re-deriving the key accordingly.
    let raw = store.get("compat-bucket", "kdf", None).unwrap();
    let mut stored = ObjectCryptoMetadata::decode(&raw.metadata).unwrap();
    let crate::metadata::KeySource::PasswordDerived { salt, kdf } = &mut stored.key_source else {
        panic!("expected password-derived object");
    };
    let old_params = KdfParams {
        time_cost: 1,
        memory_cost: 8192,
        parallelism: 1,
        ..KdfParams::default()
    };
    let old_dek =
        shroud_crypto::kdf::derive_fallback_key("test-password", salt, &old_params).unwrap();
    *kdf = old_params;

    // Re-seal the payload under the old-parameter key so the stored
    // object is self-consistent.
    let mut old_sealed = Vec::new();
    let mut reseal = crate::encrypt::EncryptStream::new(
        Cursor::new(data.clone()),
        &old_dek,
        Algorithm::Aes256Gcm,
        16 * 1024,
        Some(30_000),
        2,
        std::sync::Arc::new(crate::buffer_pool::BufferPool::with_chunk_size(16 * 1024)),
        std::sync::Arc::new(crate::metrics::Metrics::new()),
        CancelToken::new(),
    )
    .unwrap();
    reseal.read_to_end(&mut old_sealed).unwrap();
    stored.manifest = reseal.manifest();

    let rewritten = stored.encode(8 * 1024).unwrap();
    store
        .put(
            "compat-bucket",
            "kdf",
            &mut Cursor::new(old_sealed),
            &rewritten,
        )
        .unwrap();

    let mut object = engine
        .get_object(&store, &ctx("kdf"), CancelToken::new())
        .unwrap();
    let mut plain = Vec::new();
    object.body.read_to_end(&mut plain).unwrap();
    assert_eq!(plain, data);
}

/// Objects survive several rotations as long as each read lands inside
/// the dual-read window, and every rotated read is accounted separately.
#[test]
fn repeated_rotation_inside_the_window() {
    let (engine, manager) = kms_engine(Algorithm::ChaCha20Poly1305, 16 * 1024, 2);
    let store = MemoryStore::new();

    // One object per keyring generation.
    for generation in 0..4u32 {
        let key = format!("gen-{generation}");
        let data = pattern(20_000 + generation as usize);
        engine
            .put_object(
                &store,
                &ctx(&key),
                Cursor::new(data),
                ClientObjectInfo {
                    content_length: Some(20_000 + generation as u64),
                    ..Default::default()
                },
                &BTreeMap::new(),
                CancelToken::new(),
            )
            .unwrap();
        manager.rotate().unwrap();
    }
    // Active version is 5; the window of 2 retains keys {3, 4, 5}.
    assert_eq!(manager.active_key_version().unwrap(), 5);

    for generation in 0..4u32 {
        let key = format!("gen-{generation}");
        let wrapped_at = generation + 1;
        let result = engine.get_object(&store, &ctx(&key), CancelToken::new());
        if wrapped_at >= 3 {
            let mut plain = Vec::new();
            result.unwrap().body.read_to_end(&mut plain).unwrap();
            assert_eq!(plain.len(), 20_000 + generation as usize);
        } else {
            assert!(matches!(
                result.unwrap_err(),
                crate::ShroudError::KmsDecrypt
            ));
        }
    }

    let snapshot = engine.metrics().snapshot();
    assert_eq!(snapshot.rotated_reads.get(&(3, 5)), Some(&1));
    assert_eq!(snapshot.rotated_reads.get(&(4, 5)), Some(&1));
}

/// Metadata written with the short-name map (tight provider budgets) is
/// read back transparently.
#[test]
fn short_name_metadata_decrypts() {
    let engine = password_engine(Algorithm::Aes256Gcm, 16 * 1024, 2);
    let store = MemoryStore::new();
    let data = pattern(5_000);

    engine
        .put_object(
            &store,
            &ctx("short"),
            Cursor::new(data.clone()),
            ClientObjectInfo {
                content_length: Some(5_000),
                ..Default::default()
            },
            &BTreeMap::new(),
            CancelToken::new(),
        )
        .unwrap();

    // Re-encode the stored metadata at a budget that forces short names.
    let raw = store.get("compat-bucket", "short", None).unwrap();
    let stored = ObjectCryptoMetadata::decode(&raw.metadata).unwrap();
    let long_size: usize = raw.metadata.iter().map(|(k, v)| k.len() + v.len()).sum();
    let short = stored.encode(long_size - 1).unwrap();
    assert!(short.keys().all(|k| !k.starts_with("x-amz-meta-encryption-")));

    let mut body = raw.body;
    let mut sealed = Vec::new();
    body.read_to_end(&mut sealed).unwrap();
    store
        .put("compat-bucket", "short", &mut Cursor::new(sealed), &short)
        .unwrap();

    let mut object = engine
        .get_object(&store, &ctx("short"), CancelToken::new())
        .unwrap();
    let mut plain = Vec::new();
    object.body.read_to_end(&mut plain).unwrap();
    assert_eq!(plain, data);
}
