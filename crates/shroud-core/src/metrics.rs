use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tracing::info;

use shroud_types::Result;

use crate::kms::ObjectContext;

/// Process-local counters for the encrypt/decrypt paths. Plain atomics:
/// the embedding service scrapes [`snapshot`](Metrics::snapshot) into its
/// own registry. Buffer-pool hit/miss counters live on the pool itself.
#[derive(Default)]
pub struct Metrics {
    encrypt_bytes: AtomicU64,
    decrypt_bytes: AtomicU64,
    chunks_sealed: AtomicU64,
    chunks_opened: AtomicU64,
    kms_ops: AtomicU64,
    kms_latency_us: AtomicU64,
    /// (from_version, to_version) -> count of decrypts served by a
    /// non-active wrapping key.
    rotated_reads: Mutex<BTreeMap<(u32, u32), u64>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub encrypt_bytes: u64,
    pub decrypt_bytes: u64,
    pub chunks_sealed: u64,
    pub chunks_opened: u64,
    pub kms_ops: u64,
    pub kms_latency_us: u64,
    pub rotated_reads: BTreeMap<(u32, u32), u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_chunk_sealed(&self, plaintext_bytes: u64) {
        self.chunks_sealed.fetch_add(1, Ordering::Relaxed);
        self.encrypt_bytes.fetch_add(plaintext_bytes, Ordering::Relaxed);
    }

    pub fn record_chunk_opened(&self, plaintext_bytes: u64) {
        self.chunks_opened.fetch_add(1, Ordering::Relaxed);
        self.decrypt_bytes.fetch_add(plaintext_bytes, Ordering::Relaxed);
    }

    pub fn record_rotated_read(&self, from_version: u32, to_version: u32) {
        let mut map = self.rotated_reads.lock().unwrap();
        *map.entry((from_version, to_version)).or_insert(0) += 1;
    }

    /// Run a KMS call, accumulating its latency.
    pub fn time_kms_op<T>(&self, op: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let start = Instant::now();
        let result = f();
        let elapsed_us = start.elapsed().as_micros() as u64;
        self.kms_ops.fetch_add(1, Ordering::Relaxed);
        self.kms_latency_us.fetch_add(elapsed_us, Ordering::Relaxed);
        if result.is_err() {
            tracing::debug!(op, elapsed_us, "kms operation failed");
        }
        result
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            encrypt_bytes: self.encrypt_bytes.load(Ordering::Relaxed),
            decrypt_bytes: self.decrypt_bytes.load(Ordering::Relaxed),
            chunks_sealed: self.chunks_sealed.load(Ordering::Relaxed),
            chunks_opened: self.chunks_opened.load(Ordering::Relaxed),
            kms_ops: self.kms_ops.load(Ordering::Relaxed),
            kms_latency_us: self.kms_latency_us.load(Ordering::Relaxed),
            rotated_reads: self.rotated_reads.lock().unwrap().clone(),
        }
    }
}

/// Emit the per-operation audit record. One event per encrypt or decrypt,
/// structured for the audit sink subscriber; key material never appears.
pub fn audit_event(
    operation: &str,
    ctx: &ObjectContext,
    algorithm: &str,
    key_version: Option<u32>,
    success: bool,
    duration_ms: u64,
) {
    info!(
        target: "shroud::audit",
        operation,
        bucket = %ctx.bucket,
        key = %ctx.key,
        trace_id = ctx.trace_id.as_deref().unwrap_or(""),
        algorithm,
        key_version = key_version.unwrap_or(0),
        success,
        duration_ms,
        "object crypto operation"
    );
}
