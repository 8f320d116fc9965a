//! Order-preserving parallel batch dispatch.
//!
//! Large batches (spots to fit, localizations to z-fit) are split into
//! contiguous, roughly equal chunks and farmed out to a pool of worker
//! threads. Workers share nothing mutable: each claims chunk indices from an
//! atomic cursor, runs the chunk against the immutable shared input, and
//! publishes its result into a write-once slot for that chunk. The caller
//! gathers slots in index order, so the merged output always matches input
//! order no matter which worker finished first.
//!
//! [`dispatch`] returns immediately with a [`BatchJob`] handle; callers either
//! block on [`BatchJob::wait`] or poll the completion counters to drive
//! external progress reporting. A panicking worker surfaces as an error at
//! wait time and invalidates the whole batch — there is no partial-result
//! recovery.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Result};
use tracing::debug;

/// Worker-pool sizing and chunking policy.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Explicit worker count. When `None`, the count is derived from the
    /// available hardware parallelism via `worker_fraction`.
    /// Default: None
    pub num_workers: Option<usize>,
    /// Fraction of hardware parallelism to use when `num_workers` is `None`.
    /// Kept below 1.0 to leave headroom for the orchestrating process.
    /// Default: 0.75
    pub worker_fraction: f32,
    /// Chunks per worker for fine-grained batches (z fitting), where many
    /// small chunks allow progress reporting between completions.
    /// Default: 100
    pub tasks_per_worker: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: None,
            worker_fraction: 0.75,
            tasks_per_worker: 100,
        }
    }
}

impl PoolConfig {
    /// Resolved worker count: explicit, or `worker_fraction` of the
    /// hardware parallelism, never below one.
    pub fn effective_workers(&self) -> usize {
        match self.num_workers {
            Some(n) => n.max(1),
            None => {
                let hw = thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                ((hw as f32 * self.worker_fraction) as usize).max(1)
            }
        }
    }
}

/// Split `n_items` into `n_chunks` contiguous, order-preserving ranges.
///
/// The first `n_items % n_chunks` chunks are one element larger, so chunk
/// sizes differ by at most one. Trailing chunks may be empty when there are
/// more chunks than items.
pub fn chunk_ranges(n_items: usize, n_chunks: usize) -> Vec<Range<usize>> {
    let n_chunks = n_chunks.max(1);
    let base = n_items / n_chunks;
    let remainder = n_items % n_chunks;
    let mut ranges = Vec::with_capacity(n_chunks);
    let mut start = 0;
    for i in 0..n_chunks {
        let len = if i < remainder { base + 1 } else { base };
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

/// Handle to an in-flight batch dispatched across worker threads.
///
/// Results are published per chunk as workers finish; completion counters may
/// advance in any order and are for progress reporting only — ordering
/// guarantees come from the index-ordered gather in [`BatchJob::wait`].
pub struct BatchJob<T> {
    workers: Vec<JoinHandle<()>>,
    slots: Arc<Vec<OnceLock<Vec<T>>>>,
    completed: Arc<AtomicUsize>,
}

impl<T: Send + Sync + 'static> BatchJob<T> {
    /// Total number of chunks in this job.
    pub fn total_chunks(&self) -> usize {
        self.slots.len()
    }

    /// Number of chunks completed so far (any order).
    pub fn completed_chunks(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    /// True once every worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.workers.iter().all(|h| h.is_finished())
    }

    /// Block until all workers finish, then concatenate chunk results in
    /// submission order.
    ///
    /// A worker panic (or a chunk left unfilled because its worker died)
    /// fails the entire batch.
    pub fn wait(self) -> Result<Vec<T>> {
        for handle in self.workers {
            handle
                .join()
                .map_err(|_| anyhow!("Worker thread panicked; aborting batch"))?;
        }
        let slots = Arc::try_unwrap(self.slots)
            .map_err(|_| anyhow!("Batch result slots still shared after workers exited"))?;
        let mut merged = Vec::new();
        for (i, slot) in slots.into_iter().enumerate() {
            let chunk = slot
                .into_inner()
                .ok_or_else(|| anyhow!("Chunk {i} never completed"))?;
            merged.extend(chunk);
        }
        Ok(merged)
    }
}

/// Partition `n_items` into `n_chunks` and run `work` over the chunks on
/// `n_workers` threads. Returns immediately; the work runs in the background.
///
/// `work` receives the index range of one chunk and returns that chunk's
/// results in element order. It must be pure with respect to shared state —
/// each invocation owns its scratch space.
pub fn dispatch<T, F>(n_items: usize, n_chunks: usize, n_workers: usize, work: F) -> BatchJob<T>
where
    T: Send + Sync + 'static,
    F: Fn(Range<usize>) -> Vec<T> + Send + Sync + 'static,
{
    let ranges = Arc::new(chunk_ranges(n_items, n_chunks));
    let slots: Arc<Vec<OnceLock<Vec<T>>>> =
        Arc::new((0..ranges.len()).map(|_| OnceLock::new()).collect());
    let cursor = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));
    let work = Arc::new(work);

    let n_workers = n_workers.clamp(1, ranges.len());
    debug!(
        "Dispatching {} items as {} chunks on {} workers",
        n_items,
        ranges.len(),
        n_workers
    );

    let workers = (0..n_workers)
        .map(|_| {
            let ranges = Arc::clone(&ranges);
            let slots = Arc::clone(&slots);
            let cursor = Arc::clone(&cursor);
            let completed = Arc::clone(&completed);
            let work = Arc::clone(&work);
            thread::spawn(move || loop {
                let i = cursor.fetch_add(1, Ordering::Relaxed);
                if i >= ranges.len() {
                    break;
                }
                let result = work(ranges[i].clone());
                // Each index is claimed exactly once, so the slot is empty.
                let _ = slots[i].set(result);
                completed.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect();

    BatchJob {
        workers,
        slots,
        completed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_ranges_balanced() {
        let ranges = chunk_ranges(10, 3);
        assert_eq!(ranges, vec![0..4, 4..7, 7..10]);
    }

    #[test]
    fn test_chunk_ranges_exact_division() {
        let ranges = chunk_ranges(9, 3);
        assert_eq!(ranges, vec![0..3, 3..6, 6..9]);
    }

    #[test]
    fn test_chunk_ranges_more_chunks_than_items() {
        let ranges = chunk_ranges(2, 4);
        assert_eq!(ranges, vec![0..1, 1..2, 2..2, 2..2]);
    }

    #[test]
    fn test_chunk_ranges_empty_input() {
        let ranges = chunk_ranges(0, 3);
        assert!(ranges.iter().all(|r| r.is_empty()));
    }

    #[test]
    fn test_dispatch_preserves_order() {
        let input: Vec<u64> = (0..1000).collect();
        let shared = Arc::new(input.clone());
        let job = dispatch(1000, 17, 4, move |range| {
            shared[range].iter().map(|&v| v * 2).collect()
        });
        let merged = job.wait().unwrap();
        let expected: Vec<u64> = input.iter().map(|&v| v * 2).collect();
        assert_eq!(merged, expected);
    }

    #[test]
    fn test_dispatch_progress_counters() {
        let job = dispatch(100, 10, 2, |range: Range<usize>| {
            vec![0u8; range.len()]
        });
        assert_eq!(job.total_chunks(), 10);
        let merged = job.wait().unwrap();
        assert_eq!(merged.len(), 100);
    }

    #[test]
    fn test_worker_panic_fails_batch() {
        let job = dispatch(10, 2, 2, |range: Range<usize>| {
            if range.start == 0 {
                panic!("bad chunk");
            }
            vec![1u8; range.len()]
        });
        assert!(job.wait().is_err());
    }

    #[test]
    fn test_completed_chunks_reaches_total() {
        let job = dispatch(50, 5, 3, |range: Range<usize>| vec![1u32; range.len()]);
        while !job.is_finished() {
            std::thread::yield_now();
        }
        assert_eq!(job.completed_chunks(), 5);
        job.wait().unwrap();
    }
}
