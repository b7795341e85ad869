use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use shroud_crypto::select::select_fastest_aead;
use shroud_crypto::Algorithm;
use shroud_types::{Result, ShroudError};

use crate::buffer_pool::BufferPool;
use crate::cancel::CancelToken;
use crate::config::{AlgorithmChoice, EncryptionConfig};
use crate::decrypt::{DecryptStream, TrimReader};
use crate::encrypt::EncryptStream;
use crate::kms::provisioner::KeyProvisioner;
use crate::kms::ObjectContext;
use crate::manifest::{ChunkManifest, DEFAULT_CHUNK_SIZE};
use crate::metadata::{self, KeySource, ObjectCryptoMetadata};
use crate::metrics::{audit_event, Metrics};
use crate::range::{parse_range_header, plan_range};
use crate::storage::{ByteRange, ObjectStore};

/// Client-declared attributes of an incoming object, preserved in
/// metadata so GET and HEAD can restore them.
#[derive(Debug, Clone, Default)]
pub struct ClientObjectInfo {
    pub content_length: Option<u64>,
    pub etag: Option<String>,
    pub content_type: Option<String>,
}

/// Everything known about an object's crypto state before its stream has
/// been drained; combined with the finished manifest it yields the
/// metadata to persist.
pub struct PendingObject {
    algorithm: Algorithm,
    key_source: KeySource,
    info: ClientObjectInfo,
}

impl PendingObject {
    pub fn into_metadata(self, manifest: ChunkManifest) -> ObjectCryptoMetadata {
        ObjectCryptoMetadata {
            algorithm: self.algorithm,
            manifest,
            key_source: self.key_source,
            original_content_length: self.info.content_length,
            original_etag: self.info.etag,
            original_content_type: self.info.content_type,
        }
    }
}

/// A decrypted object (or range) ready to stream back to the client,
/// with the crypto namespace stripped and original attributes restored.
pub struct PlaintextObject {
    pub body: Box<dyn Read + Send>,
    /// Plaintext length of the full object, when recoverable.
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    /// Remaining (non-crypto) object metadata.
    pub metadata: BTreeMap<String, String>,
}

impl std::fmt::Debug for PlaintextObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaintextObject")
            .field("body", &"<stream>")
            .field("content_length", &self.content_length)
            .field("content_type", &self.content_type)
            .field("etag", &self.etag)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// A decrypted plaintext range plus the coordinates needed for a
/// `Content-Range` response.
pub struct PlaintextRange {
    pub body: Box<dyn Read + Send>,
    pub start: u64,
    pub end: u64,
    pub total_size: u64,
}

/// The gateway's crypto engine: owns the resolved algorithm, the key
/// provisioner, the buffer pool, and the metrics registry, and drives the
/// encrypt / decrypt / range-decrypt paths over them.
pub struct Engine {
    config: EncryptionConfig,
    algorithm: Algorithm,
    provisioner: KeyProvisioner,
    pool: Arc<BufferPool>,
    metrics: Arc<Metrics>,
}

impl Engine {
    pub fn new(config: EncryptionConfig, provisioner: KeyProvisioner) -> Result<Self> {
        config.validate()?;
        let algorithm = match config.algorithm {
            AlgorithmChoice::Fixed(algorithm) => algorithm,
            AlgorithmChoice::Auto => {
                let picked = select_fastest_aead();
                debug!(algorithm = %picked, "auto-selected AEAD");
                picked
            }
        };
        let pool = if config.chunk_size == DEFAULT_CHUNK_SIZE {
            BufferPool::global()
        } else {
            Arc::new(BufferPool::with_chunk_size(config.chunk_size))
        };
        Ok(Self {
            config,
            algorithm,
            provisioner,
            pool,
            metrics: Arc::new(Metrics::new()),
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn health_check(&self) -> Result<()> {
        self.provisioner.health_check()
    }

    pub fn close(&self) -> Result<()> {
        self.provisioner.close()
    }

    /// Begin encrypting an object. Returns the ciphertext stream and the
    /// pending crypto state; call [`EncryptStream::manifest`] once the
    /// stream is drained (or immediately, given a declared length) and
    /// feed it to [`PendingObject::into_metadata`].
    pub fn encrypt(
        &self,
        source: impl Read + Send + 'static,
        ctx: &ObjectContext,
        info: ClientObjectInfo,
        token: CancelToken,
    ) -> Result<(EncryptStream, PendingObject)> {
        let (dek, key_source) =
            self.provisioner
                .provision(ctx, &self.config.retry, &self.metrics)?;
        let stream = EncryptStream::new(
            source,
            &dek,
            self.algorithm,
            self.config.chunk_size,
            info.content_length,
            self.config.resolved_workers(info.content_length),
            Arc::clone(&self.pool),
            Arc::clone(&self.metrics),
            token,
        )?;
        // `dek` drops (and zeroizes) here; the stream holds only the
        // instantiated cipher.
        Ok((
            stream,
            PendingObject {
                algorithm: self.algorithm,
                key_source,
                info,
            },
        ))
    }

    /// Begin decrypting a whole object from its stored metadata. The
    /// stored algorithm is honored; the engine's configured preference
    /// plays no part (no downgrade).
    pub fn decrypt(
        &self,
        source: impl Read + Send + 'static,
        stored: &ObjectCryptoMetadata,
        ctx: &ObjectContext,
        token: CancelToken,
    ) -> Result<DecryptStream> {
        let dek =
            self.provisioner
                .recover(&stored.key_source, ctx, &self.config.retry, &self.metrics)?;
        let end_chunk = stored.manifest.chunk_count.saturating_sub(1);
        DecryptStream::new(
            source,
            &dek,
            stored.algorithm,
            &stored.manifest,
            0,
            end_chunk,
            self.resolved_decrypt_workers(stored),
            Arc::clone(&self.pool),
            Arc::clone(&self.metrics),
            token,
        )
    }

    fn resolved_decrypt_workers(&self, stored: &ObjectCryptoMetadata) -> usize {
        let plaintext_len = stored
            .manifest
            .plaintext_size(stored.original_content_length, None);
        self.config.resolved_workers(plaintext_len)
    }

    /// Encrypt `source` and store it at `bucket/key`, merging the crypto
    /// metadata with the client's own metadata pairs.
    ///
    /// With a declared content length the ciphertext streams straight to
    /// the backend; without one it is staged in memory first, because the
    /// chunk count (and thus the manifest) is only known at EOF.
    pub fn put_object(
        &self,
        store: &dyn ObjectStore,
        ctx: &ObjectContext,
        source: impl Read + Send + 'static,
        info: ClientObjectInfo,
        client_metadata: &BTreeMap<String, String>,
        token: CancelToken,
    ) -> Result<()> {
        let started = Instant::now();
        let key_version = self.active_key_version();
        let result = self.put_object_inner(store, ctx, source, info, client_metadata, token);
        audit_event(
            "encrypt",
            ctx,
            self.algorithm.wire_name(),
            key_version,
            result.is_ok(),
            started.elapsed().as_millis() as u64,
        );
        result
    }

    fn put_object_inner(
        &self,
        store: &dyn ObjectStore,
        ctx: &ObjectContext,
        source: impl Read + Send + 'static,
        info: ClientObjectInfo,
        client_metadata: &BTreeMap<String, String>,
        token: CancelToken,
    ) -> Result<()> {
        let declared_len = info.content_length;
        let (mut stream, pending) = self.encrypt(source, ctx, info, token)?;

        if declared_len.is_some() {
            let manifest = stream.manifest();
            let metadata = self.merge_metadata(pending, manifest, client_metadata)?;
            store.put(&ctx.bucket, &ctx.key, &mut stream, &metadata)?;
            return Ok(());
        }

        let mut ciphertext = Vec::new();
        stream
            .read_to_end(&mut ciphertext)
            .map_err(ShroudError::from_io)?;
        let manifest = stream.manifest();
        let metadata = self.merge_metadata(pending, manifest, client_metadata)?;
        store.put(
            &ctx.bucket,
            &ctx.key,
            &mut std::io::Cursor::new(ciphertext),
            &metadata,
        )
    }

    fn merge_metadata(
        &self,
        pending: PendingObject,
        manifest: ChunkManifest,
        client_metadata: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        let mut merged = metadata::strip_crypto_metadata(client_metadata);
        merged.extend(pending.into_metadata(manifest).encode(self.config.metadata_budget)?);
        Ok(merged)
    }

    /// Fetch and decrypt a whole object.
    pub fn get_object(
        &self,
        store: &dyn ObjectStore,
        ctx: &ObjectContext,
        token: CancelToken,
    ) -> Result<PlaintextObject> {
        let started = Instant::now();
        let result = self.get_object_inner(store, ctx, token);
        audit_event(
            "decrypt",
            ctx,
            self.algorithm.wire_name(),
            self.active_key_version(),
            result.is_ok(),
            started.elapsed().as_millis() as u64,
        );
        result
    }

    fn get_object_inner(
        &self,
        store: &dyn ObjectStore,
        ctx: &ObjectContext,
        token: CancelToken,
    ) -> Result<PlaintextObject> {
        let object = store.get(&ctx.bucket, &ctx.key, None)?;
        let stored = ObjectCryptoMetadata::decode(&object.metadata)?;
        let content_length = self.plaintext_size(&stored, object.content_length);
        let stream = self.decrypt(object.body, &stored, ctx, token)?;
        Ok(PlaintextObject {
            body: Box::new(stream),
            content_length,
            content_type: stored.original_content_type.clone(),
            etag: stored.original_etag.clone(),
            metadata: metadata::strip_crypto_metadata(&object.metadata),
        })
    }

    /// Serve a plaintext `Range` request by fetching only the sealed
    /// chunks that cover it.
    pub fn get_object_range(
        &self,
        store: &dyn ObjectStore,
        ctx: &ObjectContext,
        range_header: &str,
        token: CancelToken,
    ) -> Result<PlaintextRange> {
        let started = Instant::now();
        let result = self.get_object_range_inner(store, ctx, range_header, token);
        audit_event(
            "decrypt_range",
            ctx,
            self.algorithm.wire_name(),
            self.active_key_version(),
            result.is_ok(),
            started.elapsed().as_millis() as u64,
        );
        result
    }

    fn get_object_range_inner(
        &self,
        store: &dyn ObjectStore,
        ctx: &ObjectContext,
        range_header: &str,
        token: CancelToken,
    ) -> Result<PlaintextRange> {
        let head = store.head(&ctx.bucket, &ctx.key)?;
        let stored = ObjectCryptoMetadata::decode(&head.metadata)?;
        let total_size = self
            .plaintext_size(&stored, head.content_length)
            .ok_or_else(|| {
                ShroudError::MetadataMalformed("plaintext size not recoverable".into())
            })?;

        let (start, end) = parse_range_header(range_header, Some(total_size))?;
        let plan = plan_range(&stored.manifest, start, end, Some(total_size))?;
        debug!(
            start,
            end,
            first_chunk = plan.first_chunk,
            last_chunk = plan.last_chunk,
            encrypted_start = plan.encrypted_start,
            encrypted_end = plan.encrypted_end,
            "serving plaintext range from sealed chunk span"
        );

        let object = store.get(
            &ctx.bucket,
            &ctx.key,
            Some(ByteRange {
                start: plan.encrypted_start,
                end: plan.encrypted_end,
            }),
        )?;

        let dek =
            self.provisioner
                .recover(&stored.key_source, ctx, &self.config.retry, &self.metrics)?;
        let stream = DecryptStream::new(
            object.body,
            &dek,
            stored.algorithm,
            &stored.manifest,
            plan.first_chunk,
            plan.last_chunk,
            self.config.resolved_workers(Some(end - start + 1)),
            Arc::clone(&self.pool),
            Arc::clone(&self.metrics),
            token,
        )?;

        Ok(PlaintextRange {
            body: Box::new(TrimReader::new(stream, plan.head_trim, Some(end - start + 1))),
            start,
            end,
            total_size,
        })
    }

    /// Restore a HEAD response: strip the crypto namespace and surface
    /// the original attributes.
    pub fn head_object(&self, store: &dyn ObjectStore, ctx: &ObjectContext) -> Result<PlaintextObject> {
        let head = store.head(&ctx.bucket, &ctx.key)?;
        let stored = ObjectCryptoMetadata::decode(&head.metadata)?;
        Ok(PlaintextObject {
            body: Box::new(std::io::empty()),
            content_length: self.plaintext_size(&stored, head.content_length),
            content_type: stored.original_content_type.clone(),
            etag: stored.original_etag.clone(),
            metadata: metadata::strip_crypto_metadata(&head.metadata),
        })
    }

    /// Plaintext size of a stored object: the recorded original length
    /// when present, otherwise reconstructed from the final sealed
    /// chunk's length (a streamed PUT may not have declared one).
    fn plaintext_size(&self, stored: &ObjectCryptoMetadata, encrypted_len: u64) -> Option<u64> {
        let manifest = &stored.manifest;
        let final_sealed = if manifest.chunk_count == 0 {
            None
        } else {
            encrypted_len.checked_sub((manifest.chunk_count - 1) * manifest.sealed_chunk_len())
        };
        manifest.plaintext_size(stored.original_content_length, final_sealed)
    }

    fn active_key_version(&self) -> Option<u32> {
        match &self.provisioner {
            KeyProvisioner::Kms(manager) => manager.active_key_version().ok(),
            KeyProvisioner::Password { .. } => None,
        }
    }
}
