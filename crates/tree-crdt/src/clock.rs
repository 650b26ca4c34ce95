//! Logical clock issuing per-peer monotonic timestamps.
//!
//! Every locally originated operation is stamped from the clock; every
//! remotely observed timestamp is merged back in so the next local stamp
//! is strictly greater than anything seen anywhere.

use std::sync::atomic::{AtomicU64, Ordering};

/// Issues and merges logical timestamps.
///
/// Implementations must guarantee that `get_timestamp` never returns the
/// same value twice and that it always exceeds every value previously
/// issued or passed to `update_timestamp`.
pub trait Clock<T> {
    /// Issue a fresh timestamp strictly greater than any previously issued
    /// or observed value.
    fn get_timestamp(&self) -> T;

    /// Current high-water mark, without advancing it.
    fn peek_timestamp(&self) -> T;

    /// Merge an externally observed timestamp: the new high-water mark is
    /// `max(current, received) + 1`. Returns the value before the merge.
    fn update_timestamp(&self, received: T) -> T;
}

/// Lock-free `u64` clock.
///
/// Safe under concurrent callers: the merge runs a compare-exchange retry
/// loop, so racing updates never lose a high-water mark.
#[derive(Debug)]
pub struct AtomicClock {
    now: AtomicU64,
}

impl AtomicClock {
    /// Clock resuming from a persisted high-water mark (0 for a new tree).
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }
}

impl Default for AtomicClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Clock<u64> for AtomicClock {
    fn get_timestamp(&self) -> u64 {
        self.now.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn peek_timestamp(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn update_timestamp(&self, received: u64) -> u64 {
        let mut current = self.now.load(Ordering::SeqCst);
        loop {
            let next = current.max(received) + 1;
            match self
                .now
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(previous) => return previous,
                Err(actual) => current = actual,
            }
        }
    }
}
