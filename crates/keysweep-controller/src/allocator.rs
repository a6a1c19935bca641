//! The global search cursor and the reclaim pool.
//!
//! Every mutation happens under the controller state lock, so at most one
//! allocation decision is in flight at a time.

use keysweep_core::types::IndexRange;

#[derive(Debug, Default)]
pub struct WorkAllocator {
    /// Lowest index never yet handed out fresh. Only ever advances.
    cursor: i64,
    /// Ranges recovered from dead sessions, reassigned LIFO before fresh work.
    pool: Vec<IndexRange>,
}

impl WorkAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out the next range: reclaimed work first (re-verifying abandoned
    /// history keeps the cursor from growing past permanently lost gaps),
    /// otherwise `work_size` fresh indexes at the cursor.
    ///
    /// `work_size` must be positive; the config layer enforces that.
    pub fn allocate(&mut self, work_size: i64) -> IndexRange {
        debug_assert!(work_size > 0);
        if let Some(range) = self.pool.pop() {
            return range;
        }
        let start = self.cursor;
        let end = start.saturating_add(work_size - 1);
        self.cursor = end.saturating_add(1);
        IndexRange { start, end }
    }

    /// Returns the unexhausted remainder of a dead session's range to the
    /// pool: scans its checkpoints in start order and emits every gap between
    /// them and the assigned bounds. No checkpoints means the whole range
    /// comes back. Returns how many gaps were pooled.
    pub fn reclaim(&mut self, assigned: IndexRange, checkpoints: &[IndexRange]) -> usize {
        let mut sorted = checkpoints.to_vec();
        sorted.sort();

        let mut next_unconfirmed = assigned.start;
        let mut pooled = 0usize;
        for cp in sorted {
            if cp.start > next_unconfirmed {
                let gap_end = (cp.start - 1).min(assigned.end);
                if next_unconfirmed <= gap_end {
                    self.pool.push(IndexRange {
                        start: next_unconfirmed,
                        end: gap_end,
                    });
                    pooled += 1;
                }
            }
            next_unconfirmed = next_unconfirmed.max(cp.end.saturating_add(1));
        }
        if next_unconfirmed <= assigned.end {
            self.pool.push(IndexRange {
                start: next_unconfirmed,
                end: assigned.end,
            });
            pooled += 1;
        }
        pooled
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    pub fn pool_depth(&self) -> usize {
        self.pool.len()
    }

    pub fn pool(&self) -> &[IndexRange] {
        &self.pool
    }
}
