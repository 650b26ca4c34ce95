//! Operation log and per-peer timestamp ledger.
//!
//! The log is the ordered history of applied operations, keyed by combined
//! timestamp. The ledger tracks, per peer, the newest timestamp observed
//! from it; the minimum over all peers is the causal-stability threshold
//! below which the log can be trimmed.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use thiserror::Error;

use crate::op::LogRecord;
use crate::timestamp::CombinedTimestamp;

#[derive(Debug, Error)]
pub enum LogError {
    /// Overwriting an applied entry is a defect in the caller; `replace` is
    /// the only sanctioned way to swap a record during replay.
    #[error("log already contains an entry for {0}")]
    DuplicateEntry(String),
}

/// Ordered, append-only collection of applied operations.
pub trait OpLog<T, P, M, Id> {
    fn peek_oldest(&self) -> Option<(&CombinedTimestamp<T, P>, &LogRecord<T, P, M, Id>)>;

    fn take_oldest(&mut self) -> Option<(CombinedTimestamp<T, P>, LogRecord<T, P, M, Id>)>;

    fn peek_newest(&self) -> Option<(&CombinedTimestamp<T, P>, &LogRecord<T, P, M, Id>)>;

    /// Entries newer than `since` (also `since` itself when `inclusive`),
    /// oldest first.
    fn newest_slice(
        &self,
        since: &CombinedTimestamp<T, P>,
        inclusive: bool,
    ) -> Vec<(CombinedTimestamp<T, P>, LogRecord<T, P, M, Id>)>;

    /// Every entry, oldest first.
    fn all(&self) -> Vec<(CombinedTimestamp<T, P>, LogRecord<T, P, M, Id>)>;

    fn is_empty(&self) -> bool;

    fn contains_key(&self, timestamp: &CombinedTimestamp<T, P>) -> bool;

    fn len(&self) -> usize;

    /// Append an entry. Fails if the timestamp is already present.
    fn put(
        &mut self,
        timestamp: CombinedTimestamp<T, P>,
        record: LogRecord<T, P, M, Id>,
    ) -> Result<(), LogError>;

    /// Swap the entry at `timestamp`, inserting if absent. Used when a
    /// replayed operation produces different effects than first recorded.
    fn replace(&mut self, timestamp: CombinedTimestamp<T, P>, record: LogRecord<T, P, M, Id>);
}

/// `BTreeMap`-backed log.
#[derive(Debug, Clone)]
pub struct InMemoryOpLog<T, P, M, Id>
where
    T: Ord,
    P: Ord,
{
    entries: BTreeMap<CombinedTimestamp<T, P>, LogRecord<T, P, M, Id>>,
}

impl<T: Ord, P: Ord, M, Id> InMemoryOpLog<T, P, M, Id> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T: Ord, P: Ord, M, Id> Default for InMemoryOpLog<T, P, M, Id> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, P, M, Id> OpLog<T, P, M, Id> for InMemoryOpLog<T, P, M, Id>
where
    T: Clone + Ord + fmt::Display,
    P: Clone + Ord + fmt::Display,
    M: Clone,
    Id: Clone,
{
    fn peek_oldest(&self) -> Option<(&CombinedTimestamp<T, P>, &LogRecord<T, P, M, Id>)> {
        self.entries.first_key_value()
    }

    fn take_oldest(&mut self) -> Option<(CombinedTimestamp<T, P>, LogRecord<T, P, M, Id>)> {
        self.entries.pop_first()
    }

    fn peek_newest(&self) -> Option<(&CombinedTimestamp<T, P>, &LogRecord<T, P, M, Id>)> {
        self.entries.last_key_value()
    }

    fn newest_slice(
        &self,
        since: &CombinedTimestamp<T, P>,
        inclusive: bool,
    ) -> Vec<(CombinedTimestamp<T, P>, LogRecord<T, P, M, Id>)> {
        let lower = if inclusive {
            Bound::Included(since)
        } else {
            Bound::Excluded(since)
        };
        self.entries
            .range((lower, Bound::Unbounded))
            .map(|(ts, record)| (ts.clone(), record.clone()))
            .collect()
    }

    fn all(&self) -> Vec<(CombinedTimestamp<T, P>, LogRecord<T, P, M, Id>)> {
        self.entries
            .iter()
            .map(|(ts, record)| (ts.clone(), record.clone()))
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn contains_key(&self, timestamp: &CombinedTimestamp<T, P>) -> bool {
        self.entries.contains_key(timestamp)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn put(
        &mut self,
        timestamp: CombinedTimestamp<T, P>,
        record: LogRecord<T, P, M, Id>,
    ) -> Result<(), LogError> {
        if self.entries.contains_key(&timestamp) {
            return Err(LogError::DuplicateEntry(timestamp.to_string()));
        }
        self.entries.insert(timestamp, record);
        Ok(())
    }

    fn replace(&mut self, timestamp: CombinedTimestamp<T, P>, record: LogRecord<T, P, M, Id>) {
        self.entries.insert(timestamp, record);
    }
}

/// Per-peer high-water mark of observed timestamps.
pub trait PeerTimestampLog<T, P> {
    fn get_for_peer(&self, peer: &P) -> Option<T>;

    fn put_for_peer(&mut self, peer: P, timestamp: T);
}

/// `BTreeMap`-backed ledger.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPeerLog<T, P>
where
    P: Ord,
{
    seen: BTreeMap<P, T>,
}

impl<T, P: Ord> InMemoryPeerLog<T, P> {
    pub fn new() -> Self {
        Self {
            seen: BTreeMap::new(),
        }
    }
}

impl<T: Clone, P: Ord> PeerTimestampLog<T, P> for InMemoryPeerLog<T, P> {
    fn get_for_peer(&self, peer: &P) -> Option<T> {
        self.seen.get(peer).cloned()
    }

    fn put_for_peer(&mut self, peer: P, timestamp: T) {
        self.seen.insert(peer, timestamp);
    }
}
