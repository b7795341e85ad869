use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use zeroize::Zeroize;

use shroud_crypto::TAG_SIZE;

use crate::manifest::DEFAULT_CHUNK_SIZE;

/// Buffer size classes. The fixed classes cover chunk-index words, AEAD
/// nonces, and key material; the chunk class is sized per pool to hold one
/// sealed chunk (`chunk_size + TAG_SIZE`).
pub const CLASS_WORD: usize = 4;
pub const CLASS_NONCE: usize = 12;
pub const CLASS_KEY: usize = 32;

const NUM_CLASSES: usize = 4;
const CHUNK_CLASS: usize = 3;

// Free-list depth per class. Chunk buffers are the expensive ones and the
// pipeline never holds more than a few times the worker count.
const MAX_POOLED: usize = 128;

/// Size-classed reusable buffer pool. Every buffer is zeroized before it
/// re-enters a free list, so plaintext and key material never linger in
/// recycled allocations regardless of which exit path returned them.
pub struct BufferPool {
    free: [Mutex<Vec<Vec<u8>>>; NUM_CLASSES],
    hits: [AtomicU64; NUM_CLASSES],
    misses: [AtomicU64; NUM_CLASSES],
    outstanding: AtomicI64,
    peak_outstanding: AtomicI64,
    chunk_capacity: usize,
}

/// Pool counters, by class in `{4, 12, 32, chunk}` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: [u64; NUM_CLASSES],
    pub misses: [u64; NUM_CLASSES],
    /// Buffers currently checked out (gets minus puts).
    pub outstanding: i64,
    /// High-water mark of `outstanding` over the pool's lifetime.
    pub peak_outstanding: i64,
}

static GLOBAL: OnceLock<Arc<BufferPool>> = OnceLock::new();

impl BufferPool {
    /// Pool whose chunk class holds one sealed chunk of `chunk_size`
    /// plaintext bytes.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            free: Default::default(),
            hits: Default::default(),
            misses: Default::default(),
            outstanding: AtomicI64::new(0),
            peak_outstanding: AtomicI64::new(0),
            chunk_capacity: chunk_size + TAG_SIZE,
        }
    }

    /// Process-wide pool sized for the default chunk layout. Engines with a
    /// non-default chunk size construct their own pool.
    pub fn global() -> Arc<BufferPool> {
        GLOBAL
            .get_or_init(|| Arc::new(BufferPool::with_chunk_size(DEFAULT_CHUNK_SIZE)))
            .clone()
    }

    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    fn class_of(&self, size: usize) -> Option<usize> {
        match size {
            CLASS_WORD => Some(0),
            CLASS_NONCE => Some(1),
            CLASS_KEY => Some(2),
            n if n > CLASS_KEY && n <= self.chunk_capacity => Some(CHUNK_CLASS),
            _ => None,
        }
    }

    fn class_capacity(&self, class: usize) -> usize {
        match class {
            0 => CLASS_WORD,
            1 => CLASS_NONCE,
            2 => CLASS_KEY,
            _ => self.chunk_capacity,
        }
    }

    /// Check out a buffer able to hold `size` bytes. The buffer comes back
    /// with `len == 0` and the full class capacity reserved; sizes matching
    /// no class are plain allocations that will not be pooled on return.
    pub fn get(self: &Arc<Self>, size: usize) -> PooledBuf {
        let class = self.class_of(size);
        let buf = match class {
            Some(class) => {
                let reused = self.free[class].lock().unwrap().pop();
                match reused {
                    Some(buf) => {
                        self.hits[class].fetch_add(1, Ordering::Relaxed);
                        buf
                    }
                    None => {
                        self.misses[class].fetch_add(1, Ordering::Relaxed);
                        Vec::with_capacity(self.class_capacity(class))
                    }
                }
            }
            None => Vec::with_capacity(size),
        };
        let now = self.outstanding.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_outstanding.fetch_max(now, Ordering::Relaxed);
        PooledBuf {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// Convenience for the pipeline's chunk buffers.
    pub fn get_chunk(self: &Arc<Self>) -> PooledBuf {
        self.get(self.chunk_capacity)
    }

    /// Zeroize `buf` over its full capacity and return it to its class
    /// free list. Buffers whose capacity matches no class (or whose class
    /// list is full) are scrubbed and dropped.
    fn put(&self, mut buf: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        scrub(&mut buf);
        if let Some(class) = self.class_of(buf.capacity()) {
            if buf.capacity() == self.class_capacity(class) {
                let mut free = self.free[class].lock().unwrap();
                if free.len() < MAX_POOLED {
                    free.push(buf);
                }
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let load = |arr: &[AtomicU64; NUM_CLASSES]| {
            [
                arr[0].load(Ordering::Relaxed),
                arr[1].load(Ordering::Relaxed),
                arr[2].load(Ordering::Relaxed),
                arr[3].load(Ordering::Relaxed),
            ]
        };
        PoolStats {
            hits: load(&self.hits),
            misses: load(&self.misses),
            outstanding: self.outstanding.load(Ordering::Relaxed),
            peak_outstanding: self.peak_outstanding.load(Ordering::Relaxed),
        }
    }

    /// Inspect a class free list. Test hook for the zeroization invariant.
    #[cfg(test)]
    fn with_free_list<T>(&self, class: usize, f: impl FnOnce(&[Vec<u8>]) -> T) -> T {
        f(&self.free[class].lock().unwrap())
    }
}

/// Zero the buffer over its entire capacity, not just its current length.
fn scrub(buf: &mut Vec<u8>) {
    let cap = buf.capacity();
    buf.clear();
    buf.resize(cap, 0);
    buf.as_mut_slice().zeroize();
    buf.clear();
}

/// RAII handle to a pooled buffer. Dereferences to `Vec<u8>`; dropping it
/// returns the buffer to the pool, which zeroizes it first. This is how
/// the zeroization invariant holds on error and cancellation paths: any
/// stage that abandons a buffer still runs this drop.
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}
