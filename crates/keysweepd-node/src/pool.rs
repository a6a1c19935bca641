//! The node-side search pool.
//!
//! An assigned range is split into contiguous sub-ranges, one per blocking
//! search thread. Threads share nothing mutable except the found flag (plus
//! the winning index it guards) and their own progress boundary, which the
//! checkpoint coordinator reads; all network IO stays out of this module.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use keysweep_core::enumerate::Enumerator;
use keysweep_core::fingerprint::TargetFingerprint;
use keysweep_core::types::IndexRange;
use keysweep_core::verify::Verifier;

/// Candidates a search thread tests between checks of the shared found flag.
/// Cancellation is cooperative, so this bounds the worst-case stop latency.
pub const FLAG_POLL_BATCH: u64 = 512;

/// Set while no candidate has matched; -1 in `winning_index` means "none".
#[derive(Debug)]
struct SharedSearch {
    found: AtomicBool,
    winning_index: AtomicI64,
    tested: AtomicU64,
    live_threads: AtomicUsize,
}

#[derive(Debug)]
pub struct SearchPool {
    shared: Arc<SharedSearch>,
    /// Per thread: the lowest index of its sub-range not yet confirmed
    /// exhausted. Written by the owning thread, read by the coordinator.
    boundaries: Vec<Arc<AtomicI64>>,
    sub_ranges: Vec<IndexRange>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl SearchPool {
    /// Splits `range` across `threads` blocking search tasks and starts them.
    pub fn launch(
        range: IndexRange,
        threads: usize,
        enumerator: Arc<dyn Enumerator>,
        verifier: Arc<dyn Verifier>,
        target: TargetFingerprint,
    ) -> Self {
        let sub_ranges = range.split(threads);
        let shared = Arc::new(SharedSearch {
            found: AtomicBool::new(false),
            winning_index: AtomicI64::new(-1),
            tested: AtomicU64::new(0),
            live_threads: AtomicUsize::new(sub_ranges.len()),
        });

        let mut boundaries = Vec::with_capacity(sub_ranges.len());
        let mut handles = Vec::with_capacity(sub_ranges.len());
        for sub in &sub_ranges {
            let boundary = Arc::new(AtomicI64::new(sub.start));
            boundaries.push(boundary.clone());

            let sub = *sub;
            let shared = shared.clone();
            let enumerator = enumerator.clone();
            let verifier = verifier.clone();
            let target = target.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                search_sub_range(sub, &shared, &boundary, &*enumerator, &*verifier, &target);
                shared.live_threads.fetch_sub(1, Ordering::AcqRel);
            }));
        }

        Self {
            shared,
            boundaries,
            sub_ranges,
            handles,
        }
    }

    pub fn sub_ranges(&self) -> &[IndexRange] {
        &self.sub_ranges
    }

    /// The matched index, once a thread has won the flag race.
    pub fn found_index(&self) -> Option<i64> {
        let index = self.shared.winning_index.load(Ordering::Acquire);
        (index >= 0).then_some(index)
    }

    /// Raises the found flag without a match; threads wind down within one
    /// poll batch.
    pub fn stop(&self) {
        self.shared.found.store(true, Ordering::Release);
    }

    /// Total candidates tested so far, across all threads.
    pub fn tested(&self) -> u64 {
        self.shared.tested.load(Ordering::Acquire)
    }

    /// True once every thread has returned (exhausted, matched, or stopped).
    pub fn is_idle(&self) -> bool {
        self.shared.live_threads.load(Ordering::Acquire) == 0
    }

    /// The exhausted-through boundary of thread `i`'s sub-range.
    pub fn boundary(&self, i: usize) -> i64 {
        self.boundaries[i].load(Ordering::Acquire)
    }

    /// Waits for every thread to return. Callers raise the flag first if the
    /// threads are not already winding down on their own.
    pub async fn join(&mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

fn search_sub_range(
    sub: IndexRange,
    shared: &SharedSearch,
    boundary: &AtomicI64,
    enumerator: &dyn Enumerator,
    verifier: &dyn Verifier,
    target: &TargetFingerprint,
) {
    let mut index = sub.start;
    let mut batch_tested: u64 = 0;

    while index <= sub.end {
        if batch_tested >= FLAG_POLL_BATCH {
            boundary.store(index, Ordering::Release);
            shared.tested.fetch_add(batch_tested, Ordering::AcqRel);
            batch_tested = 0;
            if shared.found.load(Ordering::Acquire) {
                return;
            }
        }

        let candidate = enumerator.candidate(index);
        match verifier.verify(&candidate, target) {
            Ok(true) => {
                shared.tested.fetch_add(batch_tested + 1, Ordering::AcqRel);
                boundary.store(index, Ordering::Release);
                if shared
                    .found
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    shared.winning_index.store(index, Ordering::Release);
                    tracing::info!(
                        target: "keysweep_proof",
                        event = "candidate_matched",
                        index,
                        "candidate verified against target"
                    );
                }
                return;
            }
            Ok(false) => {}
            Err(err) => {
                // A failing backend burns one candidate, never the run.
                tracing::warn!(index, error = %err, "verification failed; skipping candidate");
            }
        }

        index += 1;
        batch_tested += 1;
    }

    boundary.store(sub.end + 1, Ordering::Release);
    shared.tested.fetch_add(batch_tested, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use keysweep_core::enumerate::AlphabetEnumerator;
    use keysweep_core::verify::Blake3Verifier;
    use std::time::Duration;

    fn fixtures(winning_candidate: &[u8]) -> (Arc<dyn Enumerator>, Arc<dyn Verifier>, TargetFingerprint) {
        let hash = Blake3Verifier::fingerprint("pool-test", winning_candidate);
        let target = TargetFingerprint::parse(&hash).unwrap();
        (
            Arc::new(AlphabetEnumerator::new(b"abcdefgh").unwrap()),
            Arc::new(Blake3Verifier),
            target,
        )
    }

    async fn wait_idle(pool: &SearchPool) {
        for _ in 0..400 {
            if pool.is_idle() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pool never went idle");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn exhausting_a_range_without_a_match_reports_full_boundaries() {
        let (enumerator, verifier, target) = fixtures(b"not-reachable");
        let range = IndexRange { start: 0, end: 999 };
        let mut pool = SearchPool::launch(range, 4, enumerator, verifier, target);

        wait_idle(&pool).await;
        pool.join().await;

        assert_eq!(pool.found_index(), None);
        assert_eq!(pool.tested(), 1000);
        for (i, sub) in pool.sub_ranges().iter().enumerate() {
            assert_eq!(pool.boundary(i), sub.end + 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn exactly_one_thread_wins_the_found_race() {
        let enumerator = AlphabetEnumerator::new(b"abcdefgh").unwrap();
        let winning_index = 443;
        let winning_candidate = enumerator.candidate(winning_index);
        let (enumerator, verifier, target) = fixtures(&winning_candidate);

        let range = IndexRange { start: 0, end: 999 };
        let mut pool = SearchPool::launch(range, 4, enumerator, verifier, target);

        wait_idle(&pool).await;
        pool.join().await;

        assert_eq!(pool.found_index(), Some(winning_index));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_winds_threads_down_without_a_match() {
        let (enumerator, verifier, target) = fixtures(b"not-reachable");
        // Large enough that the threads cannot finish before the stop.
        let range = IndexRange {
            start: 0,
            end: 200_000_000,
        };
        let mut pool = SearchPool::launch(range, 4, enumerator, verifier, target);

        pool.stop();
        pool.join().await;

        assert_eq!(pool.found_index(), None);
        assert!(pool.is_idle());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_thread_gets_the_whole_range() {
        let (enumerator, verifier, target) = fixtures(b"not-reachable");
        let range = IndexRange { start: 10, end: 29 };
        let mut pool = SearchPool::launch(range, 1, enumerator, verifier, target);

        assert_eq!(pool.sub_ranges(), &[range]);
        wait_idle(&pool).await;
        pool.join().await;
        assert_eq!(pool.tested(), 20);
    }
}
