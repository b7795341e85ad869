use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::RngCore;

use shroud_crypto::{Algorithm, ChunkCipher, Dek, NONCE_SIZE};
use shroud_types::Result;

use crate::buffer_pool::BufferPool;
use crate::cancel::CancelToken;
use crate::manifest::{
    checked_chunk_index, chunk_count_for_len, derive_chunk_iv, validate_chunk_size, ChunkManifest,
};
use crate::metrics::Metrics;
use crate::pipeline::{self, Feed, OrderedPipeline, PipelineSpec};

/// Read `buf.len()` bytes from `source`, tolerating a short final fill.
/// Returns the number of bytes actually read (0 at EOF).
pub(crate) fn read_full(source: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Streaming chunked encryptor.
///
/// Reads plaintext from the source, seals it chunk by chunk through the
/// parallel pipeline, and yields the concatenated sealed chunks in index
/// order via [`Read`]. Memory use is bounded by the pipeline's job cap
/// regardless of object size.
pub struct EncryptStream {
    inner: OrderedPipeline,
    chunk_size: u32,
    base_iv: [u8; NONCE_SIZE],
    /// Chunks fed so far; authoritative once the stream hits EOF.
    fed: Arc<AtomicU64>,
    /// Chunk count known up front from a declared content length.
    declared_count: Option<u64>,
}

impl EncryptStream {
    /// Start encrypting `source` with `dek` under `algorithm`.
    ///
    /// `declared_len` is the client-declared plaintext length, when known;
    /// it fixes the manifest's chunk count before any data flows. Without
    /// it the count is complete only after the stream reaches EOF.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: impl Read + Send + 'static,
        dek: &Dek,
        algorithm: Algorithm,
        chunk_size: usize,
        declared_len: Option<u64>,
        workers: usize,
        pool: Arc<BufferPool>,
        metrics: Arc<Metrics>,
        token: CancelToken,
    ) -> Result<Self> {
        validate_chunk_size(chunk_size)?;
        if let Some(len) = declared_len {
            // Fail on the 2^32-chunk nonce limit before streaming starts.
            checked_chunk_index(chunk_count_for_len(len, chunk_size))?;
        }

        let mut base_iv = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut base_iv);

        let cipher: Box<dyn ChunkCipher> = algorithm.cipher(dek);
        let fed = Arc::new(AtomicU64::new(0));

        let mut source = source;
        let fed_feeder = Arc::clone(&fed);
        let feed = move |_seq: u64, buf: &mut Vec<u8>| -> Result<Feed> {
            buf.clear();
            buf.resize(chunk_size, 0);
            let n = read_full(&mut source, buf)?;
            if n == 0 {
                return Ok(Feed::Eof);
            }
            buf.truncate(n);
            fed_feeder.fetch_add(1, Ordering::Relaxed);
            Ok(Feed::Data)
        };

        let seal_iv = base_iv;
        let transform = Arc::new(move |abs: u64, input: &[u8], out: &mut Vec<u8>| {
            let iv = derive_chunk_iv(&seal_iv, checked_chunk_index(abs)?);
            cipher.seal(&iv, input, out)?;
            metrics.record_chunk_sealed(input.len() as u64);
            Ok(())
        });

        let inner = pipeline::spawn(
            PipelineSpec {
                workers,
                start_index: 0,
                pool,
                token,
            },
            feed,
            transform,
        );

        Ok(Self {
            inner,
            chunk_size: chunk_size as u32,
            base_iv,
            fed,
            declared_count: declared_len.map(|len| chunk_count_for_len(len, chunk_size)),
        })
    }

    /// Snapshot of the layout manifest. The chunk count is exact once a
    /// declared length was provided, or once the stream has been drained
    /// to EOF; mid-stream without a declared length it reflects only the
    /// chunks fed so far.
    pub fn manifest(&self) -> ChunkManifest {
        ChunkManifest {
            version: crate::manifest::MANIFEST_VERSION,
            chunk_size: self.chunk_size,
            chunk_count: self
                .declared_count
                .unwrap_or_else(|| self.fed.load(Ordering::Relaxed)),
            base_iv: self.base_iv,
        }
    }
}

impl Read for EncryptStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.inner.read(out)
    }
}
