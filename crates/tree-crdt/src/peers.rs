//! Peer directory and outbound operation recording.
//!
//! The tree itself never talks to the network. Committed local operations
//! are handed to an [`OpRecorder`]; the bundled [`OpOutbox`] implementation
//! queues them per destination peer for a transport to drain, oldest first,
//! acknowledging each send with `commit_for`.

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::op::OpMove;
use crate::timestamp::CombinedTimestamp;

/// The replication group as seen by one tree instance.
pub trait PeerDirectory<P> {
    /// This peer's own identity.
    fn self_id(&self) -> P;

    /// Every known peer, self included. Used to compute the
    /// causal-stability threshold for log trimming.
    fn all_peers(&self) -> Vec<P>;
}

/// Fixed membership known at construction.
#[derive(Debug, Clone)]
pub struct StaticPeers<P> {
    self_id: P,
    peers: Vec<P>,
}

impl<P: Clone> StaticPeers<P> {
    /// `peers` must contain `self_id`.
    pub fn new(self_id: P, peers: Vec<P>) -> Self {
        Self { self_id, peers }
    }
}

impl<P: Clone> PeerDirectory<P> for StaticPeers<P> {
    fn self_id(&self) -> P {
        self.self_id.clone()
    }

    fn all_peers(&self) -> Vec<P> {
        self.peers.clone()
    }
}

/// Sink for operations that must reach other peers. Fire-and-forget from the
/// tree's perspective; delivery retries belong to the transport.
pub trait OpRecorder<T, P, M, Id> {
    /// Queue `op` for broadcast to every other peer.
    fn record_op(&mut self, op: &OpMove<T, P, M, Id>);

    /// Queue `op` for one peer only (bootstrap resync).
    fn record_op_for_peer(&mut self, peer: &P, op: &OpMove<T, P, M, Id>);
}

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("no pending ops for peer {0}")]
    NothingPending(String),

    #[error("commit for peer {0} did not match the oldest pending op")]
    CommitNotOldest(String),
}

/// Per-peer queues of operations awaiting transmission, ordered by
/// timestamp so each peer receives a monotone stream.
#[derive(Debug, Clone)]
pub struct OpOutbox<T, P, M, Id>
where
    T: Ord,
    P: Ord,
{
    targets: Vec<P>,
    queues: BTreeMap<P, BTreeMap<CombinedTimestamp<T, P>, OpMove<T, P, M, Id>>>,
}

impl<T, P, M, Id> OpOutbox<T, P, M, Id>
where
    T: Clone + Ord,
    P: Clone + Ord + fmt::Display,
    M: Clone,
    Id: Clone,
{
    /// `targets` are the broadcast destinations: every peer except self.
    pub fn new(targets: Vec<P>) -> Self {
        Self {
            targets,
            queues: BTreeMap::new(),
        }
    }

    pub fn has_pending_for(&self, peer: &P) -> bool {
        self.queues.get(peer).is_some_and(|queue| !queue.is_empty())
    }

    /// Up to `limit` queued ops for `peer`, oldest first. The ops stay
    /// queued until acknowledged with [`commit_for`](Self::commit_for).
    pub fn pending_for(&self, peer: &P, limit: usize) -> Vec<OpMove<T, P, M, Id>> {
        match self.queues.get(peer) {
            Some(queue) => queue.values().take(limit).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Acknowledge that the op at `timestamp` reached `peer`. Sends must be
    /// confirmed oldest-first; anything else is a transport defect.
    pub fn commit_for(
        &mut self,
        peer: &P,
        timestamp: &CombinedTimestamp<T, P>,
    ) -> Result<(), OutboxError> {
        let queue = self
            .queues
            .get_mut(peer)
            .ok_or_else(|| OutboxError::NothingPending(peer.to_string()))?;
        match queue.first_key_value() {
            Some((oldest, _)) if oldest == timestamp => {
                queue.pop_first();
                Ok(())
            }
            Some(_) => Err(OutboxError::CommitNotOldest(peer.to_string())),
            None => Err(OutboxError::NothingPending(peer.to_string())),
        }
    }
}

impl<T, P, M, Id> OpRecorder<T, P, M, Id> for OpOutbox<T, P, M, Id>
where
    T: Clone + Ord,
    P: Clone + Ord + fmt::Display,
    M: Clone,
    Id: Clone,
{
    fn record_op(&mut self, op: &OpMove<T, P, M, Id>) {
        for peer in self.targets.clone() {
            self.record_op_for_peer(&peer, op);
        }
    }

    fn record_op_for_peer(&mut self, peer: &P, op: &OpMove<T, P, M, Id>) {
        self.queues
            .entry(peer.clone())
            .or_default()
            .insert(op.timestamp.clone(), op.clone());
    }
}
