use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use tracing::debug;

use shroud_types::{Result, ShroudError};

use crate::buffer_pool::{BufferPool, PooledBuf};
use crate::cancel::CancelToken;

/// How often blocked channel/budget waits re-check the cancellation token.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// What the feeder produced for one call.
pub(crate) enum Feed {
    /// `buf` holds a chunk's input bytes.
    Data,
    /// Source exhausted; no more chunks.
    Eof,
}

// ---------------------------------------------------------------------------
// SlotBudget — semaphore-style cap on in-flight pipeline jobs
// ---------------------------------------------------------------------------

/// Caps the number of chunks admitted into the pipeline at once.
///
/// The feeder acquires a slot before reading a chunk from the source and
/// the consumer releases it when the chunk's output leaves the reorder
/// buffer. A full budget therefore blocks the feeder, which is what
/// propagates back-pressure to the upstream reader and bounds pipeline
/// memory independently of object size.
struct SlotBudget {
    state: Mutex<SlotState>,
    freed: Condvar,
}

struct SlotState {
    available: usize,
    poisoned: bool,
}

impl SlotBudget {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(SlotState {
                available: capacity,
                poisoned: false,
            }),
            freed: Condvar::new(),
        }
    }

    /// Block until a slot frees up, polling the token. `Err` on
    /// cancellation or poisoning.
    fn acquire(&self, token: &CancelToken) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        loop {
            token.checkpoint()?;
            if st.poisoned {
                return Err(ShroudError::Cancelled);
            }
            if st.available > 0 {
                st.available -= 1;
                return Ok(());
            }
            let (guard, _) = self.freed.wait_timeout(st, POLL_INTERVAL).unwrap();
            st = guard;
        }
    }

    fn release(&self) {
        let mut st = self.state.lock().unwrap();
        st.available += 1;
        self.freed.notify_all();
    }

    /// Fail all current and future acquires. Called on terminal errors so
    /// a blocked feeder stops instead of waiting for slots that will never
    /// return.
    fn poison(&self) {
        let mut st = self.state.lock().unwrap();
        st.poisoned = true;
        self.freed.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Ordered parallel pipeline: feeder -> workers -> reordering consumer
// ---------------------------------------------------------------------------

struct WorkMsg {
    seq: u64,
    abs_index: u64,
    input: PooledBuf,
}

enum JobOutcome {
    Output(PooledBuf),
    Failed(ShroudError),
}

struct JobMsg {
    seq: u64,
    outcome: JobOutcome,
}

/// Per-pipeline knobs.
pub(crate) struct PipelineSpec {
    pub workers: usize,
    /// Absolute index of the first chunk (nonce derivation uses absolute
    /// indices; range reads start mid-object).
    pub start_index: u64,
    pub pool: Arc<BufferPool>,
    pub token: CancelToken,
}

/// Single-producer / N-worker / single-consumer pipeline whose output is
/// strictly chunk-index ordered.
///
/// The feeder thread pulls chunk inputs from `feed` into pooled buffers
/// and dispatches them over a bounded channel; workers run `transform`
/// (seal or open) and send results to a bounded result channel; this
/// struct is the consumer, holding a reorder buffer keyed by sequence
/// number and implementing [`io::Read`] over the in-order outputs.
///
/// Failure containment: a worker error travels with its job's sequence
/// number and surfaces exactly when the consumer reaches that job, after
/// all earlier output has been emitted. Later errors are logged by their
/// workers and dropped. Cancellation poisons the budget, abandons pending
/// jobs, and returns their buffers (zeroized) to the pool via drops.
pub(crate) struct OrderedPipeline {
    result_rx: Receiver<JobMsg>,
    pending: BTreeMap<u64, JobOutcome>,
    next_seq: u64,
    current: Option<(PooledBuf, usize)>,
    budget: Arc<SlotBudget>,
    /// Child of the caller's token; cancelling it on drop tears down the
    /// worker threads without affecting the caller's other operations.
    token: CancelToken,
    deferred_err: Option<ShroudError>,
    terminated: Option<&'static str>,
    finished: bool,
}

enum NextChunk {
    Output(PooledBuf),
    Eof,
}

pub(crate) fn spawn<F, T>(spec: PipelineSpec, mut feed: F, transform: Arc<T>) -> OrderedPipeline
where
    F: FnMut(u64, &mut Vec<u8>) -> Result<Feed> + Send + 'static,
    T: Fn(u64, &[u8], &mut Vec<u8>) -> Result<()> + Send + Sync + 'static,
{
    let workers = spec.workers.max(1);
    debug!(workers, start_index = spec.start_index, "starting chunk pipeline");

    // In-flight jobs are capped at twice the worker count; the channel
    // bounds below only provide scheduling slack within that cap.
    let budget = Arc::new(SlotBudget::new(workers * 2));
    let token = spec.token.child();
    let (work_tx, work_rx) = bounded::<WorkMsg>(workers);
    let (result_tx, result_rx) = bounded::<JobMsg>(workers);

    // --- Feeder thread: read chunks in order, pre-acquiring a job slot ---
    {
        let budget = Arc::clone(&budget);
        let token = token.clone();
        let pool = Arc::clone(&spec.pool);
        let start_index = spec.start_index;
        let error_tx = result_tx.clone();
        std::thread::spawn(move || {
            let mut seq = 0u64;
            loop {
                if budget.acquire(&token).is_err() {
                    return;
                }
                let mut buf = pool.get_chunk();
                match feed(seq, &mut buf) {
                    Ok(Feed::Data) => {
                        let msg = WorkMsg {
                            seq,
                            abs_index: start_index + seq,
                            input: buf,
                        };
                        if send_polled(&work_tx, msg, &token).is_err() {
                            return;
                        }
                        seq += 1;
                    }
                    Ok(Feed::Eof) => {
                        budget.release();
                        return; // work_tx drops; workers drain and exit
                    }
                    Err(e) => {
                        // The error occupies this job's slot so the
                        // consumer surfaces it in order, after all chunks
                        // that were fed before it.
                        let msg = JobMsg {
                            seq,
                            outcome: JobOutcome::Failed(e),
                        };
                        let _ = send_polled(&error_tx, msg, &token);
                        return;
                    }
                }
            }
        });
    }

    // --- Worker threads ---
    for _ in 0..workers {
        let work_rx = work_rx.clone();
        let result_tx = result_tx.clone();
        let transform = Arc::clone(&transform);
        let token = token.clone();
        let pool = Arc::clone(&spec.pool);
        std::thread::spawn(move || {
            for msg in work_rx {
                if token.is_cancelled() {
                    return; // msg.input drops back to the pool
                }
                let mut out = pool.get_chunk();
                let outcome = match transform(msg.abs_index, &msg.input, &mut out) {
                    Ok(()) => JobOutcome::Output(out),
                    Err(e) => {
                        debug!(chunk = msg.abs_index, error = %e, "chunk transform failed");
                        JobOutcome::Failed(e)
                    }
                };
                drop(msg.input);
                let msg = JobMsg {
                    seq: msg.seq,
                    outcome,
                };
                if send_polled(&result_tx, msg, &token).is_err() {
                    return;
                }
            }
        });
    }
    drop(work_rx);
    drop(result_tx);

    OrderedPipeline {
        result_rx,
        pending: BTreeMap::new(),
        next_seq: 0,
        current: None,
        budget,
        token,
        deferred_err: None,
        terminated: None,
        finished: false,
    }
}

/// Bounded send that polls the cancellation token while blocked.
fn send_polled<T>(tx: &Sender<T>, mut msg: T, token: &CancelToken) -> std::result::Result<(), ()> {
    loop {
        match tx.send_timeout(msg, POLL_INTERVAL) {
            Ok(()) => return Ok(()),
            Err(SendTimeoutError::Timeout(back)) => {
                if token.is_cancelled() {
                    return Err(());
                }
                msg = back;
            }
            Err(SendTimeoutError::Disconnected(_)) => return Err(()),
        }
    }
}

impl OrderedPipeline {
    /// Wait for the next chunk in sequence order.
    fn next_in_order(&mut self) -> Result<NextChunk> {
        loop {
            // Cancellation is terminal even when completed chunks are still
            // queued; the threads' channel teardown must not read as EOF.
            self.token.checkpoint()?;
            if let Some(outcome) = self.pending.remove(&self.next_seq) {
                self.next_seq += 1;
                self.budget.release();
                match outcome {
                    JobOutcome::Output(buf) => return Ok(NextChunk::Output(buf)),
                    JobOutcome::Failed(e) => {
                        self.budget.poison();
                        self.token.cancel();
                        return Err(e);
                    }
                }
            }

            match self.result_rx.recv_timeout(POLL_INTERVAL) {
                Ok(msg) => {
                    self.pending.insert(msg.seq, msg.outcome);
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.token.checkpoint()?;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    if self.pending.is_empty() {
                        return Ok(NextChunk::Eof);
                    }
                    // Every dispatched job reports exactly once, so a gap
                    // here means a worker died without reporting.
                    return Err(ShroudError::Crypto(
                        "pipeline worker exited without reporting its chunk".into(),
                    ));
                }
            }
        }
    }
}

impl io::Read for OrderedPipeline {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if let Some(code) = self.terminated {
            return Err(io::Error::other(format!("stream already failed: {code}")));
        }
        if self.finished || out.is_empty() {
            return Ok(0);
        }
        if let Some(e) = self.deferred_err.take() {
            self.terminated = Some(e.code());
            return Err(e.into());
        }

        let mut total = 0;
        while total < out.len() {
            if let Some((buf, offset)) = self.current.as_mut() {
                let n = (buf.len() - *offset).min(out.len() - total);
                out[total..total + n].copy_from_slice(&buf[*offset..*offset + n]);
                *offset += n;
                total += n;
                if *offset == buf.len() {
                    self.current = None; // buffer drops back to the pool
                }
                continue;
            }

            match self.next_in_order() {
                Ok(NextChunk::Output(buf)) => {
                    if !buf.is_empty() {
                        self.current = Some((buf, 0));
                    }
                }
                Ok(NextChunk::Eof) => {
                    self.finished = true;
                    break;
                }
                Err(e) => {
                    if total > 0 {
                        // Hand back what was produced; the error surfaces
                        // on the next call.
                        self.deferred_err = Some(e);
                        break;
                    }
                    self.terminated = Some(e.code());
                    return Err(e.into());
                }
            }
        }
        Ok(total)
    }
}

impl Drop for OrderedPipeline {
    fn drop(&mut self) {
        // Stop the feeder and workers; their in-flight buffers return to
        // the pool (and are zeroized) as each thread unwinds.
        self.token.cancel();
        self.budget.poison();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn test_pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::with_chunk_size(16 * 1024))
    }

    fn spec(workers: usize, pool: &Arc<BufferPool>) -> PipelineSpec {
        PipelineSpec {
            workers,
            start_index: 0,
            pool: Arc::clone(pool),
            token: CancelToken::new(),
        }
    }

    /// Feeder producing `count` four-byte chunks carrying their index.
    fn counting_feed(count: u64) -> impl FnMut(u64, &mut Vec<u8>) -> Result<Feed> + Send {
        move |seq, buf| {
            if seq >= count {
                return Ok(Feed::Eof);
            }
            buf.clear();
            buf.extend_from_slice(&(seq as u32).to_be_bytes());
            Ok(Feed::Data)
        }
    }

    fn identity() -> Arc<impl Fn(u64, &[u8], &mut Vec<u8>) -> Result<()> + Send + Sync> {
        Arc::new(|_abs: u64, input: &[u8], out: &mut Vec<u8>| {
            out.clear();
            out.extend_from_slice(input);
            Ok(())
        })
    }

    #[test]
    fn output_is_in_order_for_any_worker_count() {
        for workers in [1, 2, 4, 8] {
            let pool = test_pool();
            let jitter = Arc::new(move |abs: u64, input: &[u8], out: &mut Vec<u8>| {
                // Reverse-order sleep forces out-of-order completion.
                if abs < 8 {
                    std::thread::sleep(Duration::from_millis(8 - abs));
                }
                out.clear();
                out.extend_from_slice(input);
                Ok(())
            });
            let mut pipeline = spawn(spec(workers, &pool), counting_feed(64), jitter);
            let mut output = Vec::new();
            pipeline.read_to_end(&mut output).unwrap();

            let expected: Vec<u8> = (0..64u32).flat_map(|i| i.to_be_bytes()).collect();
            assert_eq!(output, expected, "workers = {workers}");
        }
    }

    #[test]
    fn worker_error_surfaces_at_its_position() {
        let pool = test_pool();
        let failing = Arc::new(|abs: u64, input: &[u8], out: &mut Vec<u8>| {
            if abs == 3 {
                return Err(ShroudError::Authentication { chunk: abs });
            }
            out.clear();
            out.extend_from_slice(input);
            Ok(())
        });
        let mut pipeline = spawn(spec(4, &pool), counting_feed(16), failing);
        let mut output = Vec::new();
        let err = pipeline.read_to_end(&mut output).unwrap_err();
        // Chunks 0..3 were emitted before the failure surfaced.
        assert_eq!(output.len(), 12);
        let recovered = ShroudError::from_io(err);
        assert!(matches!(recovered, ShroudError::Authentication { chunk: 3 }));
    }

    #[test]
    fn feeder_error_surfaces_after_prior_chunks() {
        let pool = test_pool();
        let mut fed = 0u64;
        let feed = move |_seq: u64, buf: &mut Vec<u8>| {
            if fed == 4 {
                return Err(ShroudError::Io(std::io::Error::other("source broke")));
            }
            fed += 1;
            buf.clear();
            buf.extend_from_slice(b"chnk");
            Ok(Feed::Data)
        };
        let mut pipeline = spawn(spec(2, &pool), feed, identity());
        let mut output = Vec::new();
        let err = pipeline.read_to_end(&mut output).unwrap_err();
        assert_eq!(output.len(), 16);
        assert!(err.to_string().contains("source broke"));
    }

    #[test]
    fn error_is_sticky() {
        let pool = test_pool();
        let failing = Arc::new(|abs: u64, _input: &[u8], _out: &mut Vec<u8>| {
            Err::<(), _>(ShroudError::Authentication { chunk: abs })
        });
        let mut pipeline = spawn(spec(2, &pool), counting_feed(4), failing);
        let mut buf = [0u8; 16];
        assert!(pipeline.read(&mut buf).is_err());
        assert!(pipeline.read(&mut buf).is_err());
    }

    #[test]
    fn cancellation_terminates_the_stream() {
        let pool = test_pool();
        let token = CancelToken::new();
        let spec = PipelineSpec {
            workers: 2,
            start_index: 0,
            pool: Arc::clone(&pool),
            token: token.clone(),
        };
        // Endless feeder: the stream only ends via cancellation.
        let feed = |_seq: u64, buf: &mut Vec<u8>| {
            buf.clear();
            buf.extend_from_slice(&[0u8; 64]);
            Ok(Feed::Data)
        };
        let mut pipeline = spawn(spec, feed, identity());

        let mut buf = [0u8; 256];
        pipeline.read(&mut buf).unwrap();
        token.cancel();

        // A partial buffer may drain first; within a few reads the
        // cancellation must surface.
        let mut cancelled = false;
        for _ in 0..64 {
            match pipeline.read(&mut buf) {
                Ok(_) => continue,
                Err(e) => {
                    let recovered = ShroudError::from_io(e);
                    assert!(matches!(recovered, ShroudError::Cancelled));
                    cancelled = true;
                    break;
                }
            }
        }
        assert!(cancelled, "cancellation never surfaced");
    }

    #[test]
    fn slow_consumer_keeps_memory_bounded() {
        let pool = test_pool();
        let workers = 4;
        let mut pipeline = spawn(spec(workers, &pool), counting_feed(512), identity());

        let mut sink = Vec::new();
        let mut byte = [0u8; 1];
        // Read slowly so the feeder runs far ahead of the consumer.
        for _ in 0..256 {
            pipeline.read(&mut byte).unwrap();
            sink.push(byte[0]);
            std::thread::sleep(Duration::from_micros(200));
        }
        drop(pipeline);

        // Feeder admission is capped at 2*workers jobs; each job touches an
        // input and an output buffer, plus per-worker transients and the
        // consumer's current buffer.
        let bound = (4 * workers + 4) as i64;
        let peak = pool.stats().peak_outstanding;
        assert!(peak <= bound, "peak {peak} buffers exceeds bound {bound}");
    }

    #[test]
    fn start_index_offsets_absolute_indices() {
        let pool = test_pool();
        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = Arc::clone(&seen);
        let record = Arc::new(move |abs: u64, input: &[u8], out: &mut Vec<u8>| {
            seen2.fetch_max(abs, Ordering::Relaxed);
            out.clear();
            out.extend_from_slice(input);
            Ok(())
        });
        let spec = PipelineSpec {
            workers: 2,
            start_index: 100,
            pool,
            token: CancelToken::new(),
        };
        let mut pipeline = spawn(spec, counting_feed(8), record);
        let mut output = Vec::new();
        pipeline.read_to_end(&mut output).unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 107);
    }

    #[test]
    fn empty_source_yields_empty_stream() {
        let pool = test_pool();
        let mut pipeline = spawn(spec(2, &pool), counting_feed(0), identity());
        let mut output = Vec::new();
        pipeline.read_to_end(&mut output).unwrap();
        assert!(output.is_empty());
    }
}
