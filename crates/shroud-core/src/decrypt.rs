use std::io::{self, Read};
use std::sync::Arc;

use shroud_crypto::{Algorithm, ChunkCipher, Dek, TAG_SIZE};
use shroud_types::{Result, ShroudError};

use crate::buffer_pool::BufferPool;
use crate::cancel::CancelToken;
use crate::encrypt::read_full;
use crate::manifest::{checked_chunk_index, derive_chunk_iv, ChunkManifest};
use crate::metrics::Metrics;
use crate::pipeline::{self, Feed, OrderedPipeline, PipelineSpec};

/// Streaming chunked decryptor.
///
/// Reads sealed chunks (`chunk_size + 16` bytes each, the object's final
/// chunk possibly shorter), opens them in parallel, and yields plaintext
/// in chunk order via [`Read`]. `start_chunk` supports range serving: the
/// source is then expected to begin at that chunk's sealed offset, and
/// nonce derivation still uses absolute indices.
pub struct DecryptStream {
    inner: OrderedPipeline,
}

impl DecryptStream {
    /// Decrypt chunks `start_chunk ..= end_chunk` of an object laid out
    /// per `manifest`. Whole-object reads pass `0 ..= chunk_count - 1`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: impl Read + Send + 'static,
        dek: &Dek,
        algorithm: Algorithm,
        manifest: &ChunkManifest,
        start_chunk: u64,
        end_chunk: u64,
        workers: usize,
        pool: Arc<BufferPool>,
        metrics: Arc<Metrics>,
        token: CancelToken,
    ) -> Result<Self> {
        manifest.validate()?;
        if manifest.chunk_count == 0 {
            // Empty object: nothing to read, any chunk span is vacuous.
            return Ok(Self {
                inner: pipeline::spawn(
                    PipelineSpec {
                        workers: 1,
                        start_index: 0,
                        pool,
                        token,
                    },
                    |_seq, _buf| Ok(Feed::Eof),
                    Arc::new(|_abs, _input: &[u8], _out: &mut Vec<u8>| Ok(())),
                ),
            });
        }
        if start_chunk > end_chunk || end_chunk >= manifest.chunk_count {
            return Err(ShroudError::InvalidRange(format!(
                "chunk span {start_chunk}..={end_chunk} outside object of {} chunks",
                manifest.chunk_count
            )));
        }
        checked_chunk_index(end_chunk)?;

        let chunk_size = manifest.chunk_size as usize;
        let chunk_count = manifest.chunk_count;
        let base_iv = manifest.base_iv;

        let mut source = source;
        let feed = move |seq: u64, buf: &mut Vec<u8>| -> Result<Feed> {
            let abs = start_chunk + seq;
            if abs > end_chunk {
                return Ok(Feed::Eof);
            }
            let sealed_len = chunk_size + TAG_SIZE;
            buf.clear();
            buf.resize(sealed_len, 0);
            let n = read_full(&mut source, buf)?;

            let final_of_object = abs == chunk_count - 1;
            if n == 0 {
                return Err(ShroudError::Truncation {
                    chunk: abs,
                    expected: if final_of_object { TAG_SIZE + 1 } else { sealed_len },
                    actual: 0,
                });
            }
            if n < sealed_len && !final_of_object {
                return Err(ShroudError::Truncation {
                    chunk: abs,
                    expected: sealed_len,
                    actual: n,
                });
            }
            if n <= TAG_SIZE {
                // Too short to carry even the tag plus one plaintext byte.
                return Err(ShroudError::Truncation {
                    chunk: abs,
                    expected: TAG_SIZE + 1,
                    actual: n,
                });
            }
            buf.truncate(n);
            Ok(Feed::Data)
        };

        let cipher: Box<dyn ChunkCipher> = algorithm.cipher(dek);
        let transform = Arc::new(move |abs: u64, input: &[u8], out: &mut Vec<u8>| {
            let iv = derive_chunk_iv(&base_iv, checked_chunk_index(abs)?);
            // The AEAD reports one opaque error for a failed open; at this
            // point framing is already validated, so it means the tag did
            // not verify.
            if cipher.open(&iv, input, out).is_err() {
                return Err(ShroudError::Authentication { chunk: abs });
            }
            metrics.record_chunk_opened(out.len() as u64);
            Ok(())
        });

        Ok(Self {
            inner: pipeline::spawn(
                PipelineSpec {
                    workers,
                    start_index: start_chunk,
                    pool,
                    token,
                },
                feed,
                transform,
            ),
        })
    }
}

impl Read for DecryptStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.inner.read(out)
    }
}

/// Discards a prefix and bounds the total emitted, turning a decrypted
/// chunk span into the exact plaintext byte range a client asked for.
pub struct TrimReader<R> {
    inner: R,
    skip_remaining: u64,
    take_remaining: Option<u64>,
}

impl<R: Read> TrimReader<R> {
    pub fn new(inner: R, head_trim: u64, take: Option<u64>) -> Self {
        Self {
            inner,
            skip_remaining: head_trim,
            take_remaining: take,
        }
    }
}

impl<R: Read> Read for TrimReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        // Drain the head trim without surfacing it.
        let mut scratch = [0u8; 4096];
        while self.skip_remaining > 0 {
            let want = (self.skip_remaining as usize).min(scratch.len());
            let n = self.inner.read(&mut scratch[..want])?;
            if n == 0 {
                return Ok(0); // object shorter than the trim
            }
            self.skip_remaining -= n as u64;
        }

        let limit = match self.take_remaining {
            Some(0) => return Ok(0),
            Some(remaining) => (remaining as usize).min(out.len()),
            None => out.len(),
        };
        let n = self.inner.read(&mut out[..limit])?;
        if let Some(remaining) = self.take_remaining.as_mut() {
            *remaining -= n as u64;
        }
        Ok(n)
    }
}
