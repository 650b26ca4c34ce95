//! Totally ordered operation keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A logical clock value paired with the peer that issued it.
///
/// Comparison is lexicographic: clock first, peer id as the tie-breaker.
/// Because a peer never issues the same clock value twice, the pair is
/// unique across all operations ever created, which is what lets every
/// replica agree on a single global order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CombinedTimestamp<T, P> {
    pub clock: T,
    pub peer: P,
}

impl<T, P> CombinedTimestamp<T, P> {
    pub fn new(clock: T, peer: P) -> Self {
        Self { clock, peer }
    }
}

impl<T: fmt::Display, P: fmt::Display> fmt::Display for CombinedTimestamp<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.clock, self.peer)
    }
}
