//! The replicated-tree engine.
//!
//! Every structural edit is an [`OpMove`] stamped with a `(clock, peer)` key.
//! All replicas sort operations by that key into one global order and keep
//! their trees equal to "the result of applying the ordered log", so the
//! engine's job on every delivery is to restore that equation:
//!
//! 1. An op newer than everything applied so far is appended and applied
//!    directly (the fast path when delivery happens to be in order).
//! 2. An op older than the newest applied entry is spliced in: the log
//!    suffix newer than it is undone (reverse order), the op is applied in
//!    its correct slot, and the suffix is recomputed and reapplied. Replayed
//!    entries may legitimately produce different effects than first
//!    recorded, so their log records are replaced.
//!
//! Conflicts resolve deterministically from the order alone: same-name
//! creations rename both sides with id suffixes, a move into a node's own
//! subtree is absorbed as a no-op, and a move onto an occupied name sends
//! the occupant to the trash. Once every peer has acknowledged a timestamp,
//! the log prefix below it can never be spliced into again and is trimmed,
//! deleting trashed nodes for good.
//!
//! The engine is synchronous, does no I/O of its own, and expects to run
//! inside whatever transaction/lock scope owns the storage; concurrent use
//! of one tree instance must be serialized by the caller.

use std::collections::{BTreeMap, HashSet, VecDeque};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::log::{LogError, OpLog, PeerTimestampLog};
use crate::meta::NodeMeta;
use crate::node::TreeNode;
use crate::op::{LogEffect, LogRecord, OldInfo, OpMove};
use crate::peers::{OpRecorder, PeerDirectory};
use crate::store::{StorageError, TreeStorage};
use crate::timestamp::CombinedTimestamp;

#[derive(Debug, Error)]
pub enum TreeError {
    /// Creation would collide with an existing name and the caller asked for
    /// that to fail instead of auto-renaming. The only recoverable error.
    #[error("'{name}' already exists under {parent}")]
    AlreadyExists { name: String, parent: String },

    /// A move tried to change a node's concrete metadata shape.
    #[error("metadata kind changed for node {0}")]
    MetaKindMismatch(String),

    /// A trash entry must be named by its own id.
    #[error("trash entry for {0} is not named by its id")]
    BadTrashName(String),

    /// The tree references a node the storage no longer has.
    #[error("node {0} is referenced by the tree but missing from storage")]
    MissingNode(String),

    /// A placed node carries no placement op; the storage is corrupt.
    #[error("node {0} has no effective operation recorded")]
    MissingEffectiveOp(String),

    /// Two distinct operations compared equal. Possible only with a broken
    /// clock or peer directory; guessing an order would diverge replicas.
    #[error("two operations share the timestamp {0}")]
    DuplicateTimestamp(String),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, TreeError>;

type Key<S> = CombinedTimestamp<<S as TreeStorage>::Timestamp, <S as TreeStorage>::PeerId>;
type Op<S> = OpMove<
    <S as TreeStorage>::Timestamp,
    <S as TreeStorage>::PeerId,
    <S as TreeStorage>::Meta,
    <S as TreeStorage>::NodeId,
>;
type Effect<S> = LogEffect<
    <S as TreeStorage>::Timestamp,
    <S as TreeStorage>::PeerId,
    <S as TreeStorage>::Meta,
    <S as TreeStorage>::NodeId,
>;
type Record<S> = LogRecord<
    <S as TreeStorage>::Timestamp,
    <S as TreeStorage>::PeerId,
    <S as TreeStorage>::Meta,
    <S as TreeStorage>::NodeId,
>;
type Node<S> = TreeNode<
    <S as TreeStorage>::Timestamp,
    <S as TreeStorage>::PeerId,
    <S as TreeStorage>::Meta,
    <S as TreeStorage>::NodeId,
>;

/// One tree replica: storage, peer directory, clock and op recorder wired
/// together.
pub struct ReplicatedTree<S, D, C, R> {
    storage: S,
    peers: D,
    clock: C,
    recorder: R,
}

impl<S, D, C, R> ReplicatedTree<S, D, C, R>
where
    S: TreeStorage,
    D: PeerDirectory<S::PeerId>,
    C: Clock<S::Timestamp>,
    R: OpRecorder<S::Timestamp, S::PeerId, S::Meta, S::NodeId>,
{
    pub fn new(storage: S, peers: D, clock: C, recorder: R) -> Self {
        Self {
            storage,
            peers,
            clock,
            recorder,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn recorder(&self) -> &R {
        &self.recorder
    }

    pub fn recorder_mut(&mut self) -> &mut R {
        &mut self.recorder
    }

    /// Mint a fresh node id for a caller about to create a node.
    pub fn new_node_id(&self) -> S::NodeId {
        self.storage.new_node_id()
    }

    /// Clock high-water mark, for periodic timestamp pushes to peers.
    pub fn current_timestamp(&self) -> S::Timestamp {
        self.clock.peek_timestamp()
    }

    /// Resolve a path of child names starting at the root. `None` as soon as
    /// any segment is missing.
    pub fn traverse(&self, names: &[&str]) -> Option<S::NodeId> {
        let mut current = self.storage.root_id();
        for name in names {
            let node = self.storage.get_by_id(&current)?;
            current = node.children().get(*name)?.clone();
        }
        Some(current)
    }

    /// Place `child` under `new_parent` with `new_meta`, creating it if it
    /// does not exist yet. Name collisions on creation resolve by renaming
    /// both sides.
    pub fn move_node(
        &mut self,
        new_parent: S::NodeId,
        new_meta: S::Meta,
        child: S::NodeId,
    ) -> Result<()> {
        self.submit_move(new_parent, Some(new_meta), child, false)
    }

    /// Like [`move_node`](Self::move_node), but a creation that collides
    /// with an existing name fails with [`TreeError::AlreadyExists`].
    pub fn move_node_exclusive(
        &mut self,
        new_parent: S::NodeId,
        new_meta: S::Meta,
        child: S::NodeId,
    ) -> Result<()> {
        self.submit_move(new_parent, Some(new_meta), child, true)
    }

    /// Move `node` into the trash, renamed to its own id. The node stays
    /// recoverable until the op becomes causally stable and is trimmed.
    pub fn trash(&mut self, meta: S::Meta, node: S::NodeId) -> Result<()> {
        let renamed = meta.with_name(&node.to_string());
        let trash_id = self.storage.trash_id();
        self.submit_move(trash_id, Some(renamed), node, false)
    }

    /// Accept an operation delivered from another peer.
    pub fn apply_external_op(&mut self, from: S::PeerId, op: Op<S>) -> Result<()> {
        self.apply_op(from, op, false)
    }

    /// Merge a bare timestamp from `from` (periodic keepalive). Advances the
    /// causal-stability bookkeeping without applying an op.
    pub fn update_external_timestamp(
        &mut self,
        from: S::PeerId,
        timestamp: S::Timestamp,
    ) -> Result<()> {
        self.clock.update_timestamp(timestamp.clone());
        let ledger = self.storage.peer_log_mut();
        match ledger.get_for_peer(&from) {
            Some(seen) if seen >= timestamp => {}
            _ => ledger.put_for_peer(from, timestamp),
        }
        self.try_trim_log()
    }

    /// Breadth-first walk over every node reachable from the root.
    pub fn walk_tree<F>(&self, mut visit: F)
    where
        F: FnMut(&Node<S>),
    {
        let mut queue = VecDeque::new();
        queue.push_back(self.storage.root_id());
        while let Some(id) = queue.pop_front() {
            let Some(node) = self.storage.get_by_id(&id) else {
                continue;
            };
            queue.extend(node.children().values().cloned());
            visit(&node);
        }
    }

    /// Breadth-first search for the first child matching `predicate`;
    /// returns the child's name and its parent's id.
    pub fn find_parent<F>(&self, predicate: F) -> Option<(String, S::NodeId)>
    where
        F: Fn(&Node<S>) -> bool,
    {
        let mut queue = VecDeque::new();
        queue.push_back(self.storage.root_id());
        while let Some(id) = queue.pop_front() {
            let Some(node) = self.storage.get_by_id(&id) else {
                continue;
            };
            for (name, child_id) in node.children() {
                let Some(child) = self.storage.get_by_id(child_id) else {
                    continue;
                };
                if predicate(&child) {
                    return Some((name.clone(), id));
                }
                queue.push_back(child_id.clone());
            }
        }
        None
    }

    /// Queue for `peer` the minimal op set that regenerates current state:
    /// every live node's last placement op, unioned with everything still in
    /// the log, in timestamp order. Used to resync a peer without replaying
    /// the full history.
    pub fn record_bootstrap_for(&mut self, peer: &S::PeerId) {
        let mut ops: BTreeMap<Key<S>, Op<S>> = BTreeMap::new();
        self.walk_tree(|node| {
            if let Some(op) = node.last_effective_op() {
                ops.insert(op.timestamp.clone(), op.clone());
            }
        });
        for (_, record) in self.storage.log().all() {
            ops.insert(record.op.timestamp.clone(), record.op);
        }
        for op in ops.values() {
            self.recorder.record_op_for_peer(peer, op);
        }
    }

    fn submit_move(
        &mut self,
        new_parent_id: S::NodeId,
        new_meta: Option<S::Meta>,
        child_id: S::NodeId,
        fail_creating_if_exists: bool,
    ) -> Result<()> {
        let op = OpMove::new(
            CombinedTimestamp::new(self.clock.get_timestamp(), self.peers.self_id()),
            new_parent_id,
            new_meta,
            child_id,
        );
        self.apply_op(self.peers.self_id(), op.clone(), fail_creating_if_exists)?;
        self.recorder.record_op(&op);
        Ok(())
    }

    fn apply_op(&mut self, from: S::PeerId, op: Op<S>, fail_creating_if_exists: bool) -> Result<()> {
        // Each peer's op stream is monotone; anything at or below the ledger
        // mark is a redelivery.
        if let Some(seen) = self.storage.peer_log().get_for_peer(&from) {
            if seen >= op.timestamp.clock {
                warn!(peer = %from, clock = %op.timestamp.clock,
                    "dropping stale or duplicate delivery");
                return Ok(());
            }
        }
        self.clock.update_timestamp(op.timestamp.clock.clone());
        self.storage
            .peer_log_mut()
            .put_for_peer(from, op.timestamp.clock.clone());

        if self.storage.log().contains_key(&op.timestamp) {
            // Already applied; the same op can arrive via more than one peer.
            return self.try_trim_log();
        }

        let newest = self
            .storage
            .log()
            .peek_newest()
            .map(|(timestamp, _)| timestamp.clone());
        match newest {
            Some(newest) if op.timestamp < newest => {
                let replay = self.storage.log().newest_slice(&op.timestamp, false);
                debug!(timestamp = %op.timestamp, replayed = replay.len(),
                    "late delivery; splicing into the log");
                for (_, record) in replay.iter().rev() {
                    self.undo_op(record)?;
                }
                self.do_and_put(&op, fail_creating_if_exists)?;
                for (timestamp, record) in replay {
                    self.redo_op(timestamp, record)?;
                }
            }
            Some(newest) if op.timestamp == newest => {
                return Err(TreeError::DuplicateTimestamp(op.timestamp.to_string()));
            }
            _ => {
                trace!(timestamp = %op.timestamp, "appending at the head of the log");
                self.do_and_put(&op, fail_creating_if_exists)?;
            }
        }
        self.try_trim_log()
    }

    fn do_and_put(&mut self, op: &Op<S>, fail_creating_if_exists: bool) -> Result<()> {
        let record = self.do_op(op, fail_creating_if_exists)?;
        self.storage.log_mut().put(op.timestamp.clone(), record)?;
        Ok(())
    }

    fn do_op(&mut self, op: &Op<S>, fail_creating_if_exists: bool) -> Result<Record<S>> {
        let record = self.compute_effects(op, fail_creating_if_exists)?;
        if let Some(effects) = record.effects.as_deref() {
            self.apply_effects(effects)?;
        }
        Ok(record)
    }

    /// Reapply an undone entry in its slot. The replay may produce different
    /// effects than first recorded (the tree underneath changed), so the log
    /// record is replaced, not reused.
    fn redo_op(&mut self, timestamp: Key<S>, record: Record<S>) -> Result<()> {
        let recomputed = self.do_op(&record.op, false)?;
        self.storage.log_mut().replace(timestamp, recomputed);
        Ok(())
    }

    fn undo_op(&mut self, record: &Record<S>) -> Result<()> {
        if let Some(effects) = &record.effects {
            for effect in effects.iter().rev() {
                self.undo_effect(effect)?;
            }
        }
        Ok(())
    }

    fn undo_effect(&mut self, effect: &Effect<S>) -> Result<()> {
        let child = self
            .storage
            .get_by_id(&effect.child_id)
            .ok_or_else(|| TreeError::MissingNode(effect.child_id.to_string()))?;
        let current_parent = self
            .storage
            .get_by_id(&effect.new_parent_id)
            .ok_or_else(|| TreeError::MissingNode(effect.new_parent_id.to_string()))?;

        match &effect.old_info {
            Some(old) => {
                // Detach from the current parent before reading the old one:
                // they may be the same node.
                self.storage
                    .put_node(current_parent.without_child(&effect.new_name()));
                let old_parent = self
                    .storage
                    .get_by_id(&old.old_parent_id)
                    .ok_or_else(|| TreeError::MissingNode(old.old_parent_id.to_string()))?;
                self.storage
                    .put_node(old_parent.with_child(effect.old_name(), effect.child_id.clone()));
                self.storage.put_node(
                    child
                        .with_parent(Some(old.old_parent_id.clone()))
                        .with_meta(old.old_meta.clone())
                        .with_last_effective_op(Some(old.old_effective_op.clone())),
                );
            }
            None => {
                // The effect created this node: detach it and clear its
                // placement so a replay can re-create it from scratch.
                self.storage
                    .put_node(current_parent.without_child(&effect.new_name()));
                self.storage
                    .put_node(child.with_parent(None).with_last_effective_op(None));
            }
        }
        Ok(())
    }

    fn compute_effects(&self, op: &Op<S>, fail_creating_if_exists: bool) -> Result<Record<S>> {
        let child = self.storage.get_by_id(&op.child_id);

        let new_parent = match self.storage.get_by_id(&op.new_parent_id) {
            Some(parent) => parent,
            None => {
                warn!(parent = %op.new_parent_id, child = %op.child_id,
                    "move targets an unknown parent; anchoring it under lost-found");
                return self.effects_for_unknown_parent(op, child);
            }
        };

        let (child, old_parent_id) = match child {
            Some(node) => match node.parent().cloned() {
                Some(parent_id) => (node, parent_id),
                None => return self.effects_for_creation(op, &new_parent, fail_creating_if_exists),
            },
            None => return self.effects_for_creation(op, &new_parent, fail_creating_if_exists),
        };

        if op.child_id == op.new_parent_id || self.is_ancestor(&op.child_id, &op.new_parent_id)? {
            debug!(child = %op.child_id, parent = %op.new_parent_id,
                "move would create a cycle; absorbed as a no-op");
            return Ok(LogRecord {
                op: op.clone(),
                effects: None,
            });
        }

        if let (Some(current), Some(incoming)) = (child.meta(), op.new_meta.as_ref()) {
            if !current.same_kind(incoming) {
                return Err(TreeError::MetaKindMismatch(op.child_id.to_string()));
            }
        }

        let old_effective_op = child
            .last_effective_op()
            .cloned()
            .ok_or_else(|| TreeError::MissingEffectiveOp(op.child_id.to_string()))?;
        let old_info = OldInfo {
            old_effective_op,
            old_parent_id,
            old_meta: child.meta().cloned(),
        };

        let new_name = op.new_name();
        let occupant_id = new_parent
            .children()
            .get(&new_name)
            .filter(|id| **id != op.child_id)
            .cloned();

        let mut effects = Vec::with_capacity(2);
        if let Some(occupant_id) = occupant_id {
            effects.push(self.displace_to_trash(op, occupant_id)?);
        }
        effects.push(LogEffect {
            old_info: Some(old_info),
            effective_op: op.clone(),
            new_parent_id: op.new_parent_id.clone(),
            new_meta: op.new_meta.clone(),
            child_id: op.child_id.clone(),
        });
        Ok(LogRecord {
            op: op.clone(),
            effects: Some(effects),
        })
    }

    /// First placement of a node that has no parent yet: either brand new or
    /// one whose creation was undone mid-replay.
    fn effects_for_creation(
        &self,
        op: &Op<S>,
        new_parent: &Node<S>,
        fail_creating_if_exists: bool,
    ) -> Result<Record<S>> {
        let new_name = op.new_name();
        let occupant_id = new_parent
            .children()
            .get(&new_name)
            .filter(|id| **id != op.child_id)
            .cloned();
        let Some(occupant_id) = occupant_id else {
            return Ok(LogRecord {
                op: op.clone(),
                effects: Some(vec![Self::creation_effect(op)]),
            });
        };

        if fail_creating_if_exists {
            return Err(TreeError::AlreadyExists {
                name: new_name,
                parent: op.new_parent_id.to_string(),
            });
        }

        // Two creations raced for one name: rename both deterministically,
        // ids as tie-breakers. The incumbent keeps its own placement op;
        // only its name changes.
        let occupant = self
            .storage
            .get_by_id(&occupant_id)
            .ok_or_else(|| TreeError::MissingNode(occupant_id.to_string()))?;
        let occupant_op = occupant
            .last_effective_op()
            .cloned()
            .ok_or_else(|| TreeError::MissingEffectiveOp(occupant_id.to_string()))?;
        let occupant_name = format!("{new_name}.conflict.{occupant_id}");
        let incoming_name = format!("{}.conflict.{}", new_name, op.child_id);
        debug!(name = %new_name, "creation conflict; renaming both sides");
        Ok(LogRecord {
            op: op.clone(),
            effects: Some(vec![
                LogEffect {
                    old_info: Some(OldInfo {
                        old_effective_op: occupant_op.clone(),
                        old_parent_id: op.new_parent_id.clone(),
                        old_meta: occupant.meta().cloned(),
                    }),
                    effective_op: occupant_op,
                    new_parent_id: op.new_parent_id.clone(),
                    new_meta: occupant.meta().map(|meta| meta.with_name(&occupant_name)),
                    child_id: occupant_id,
                },
                LogEffect {
                    old_info: None,
                    effective_op: op.clone(),
                    new_parent_id: op.new_parent_id.clone(),
                    new_meta: op.new_meta.as_ref().map(|meta| meta.with_name(&incoming_name)),
                    child_id: op.child_id.clone(),
                },
            ]),
        })
    }

    /// A child can be delivered before its parent is known. Anchor the
    /// unknown parent id under lost-found as a placeholder and put the child
    /// beneath it; once an op establishing the real parent arrives, the
    /// replay machinery converges everything to its final location.
    fn effects_for_unknown_parent(&self, op: &Op<S>, child: Option<Node<S>>) -> Result<Record<S>> {
        let placeholder = LogEffect {
            old_info: None,
            effective_op: op.clone(),
            new_parent_id: self.storage.lost_found_id(),
            new_meta: None,
            child_id: op.new_parent_id.clone(),
        };
        let child_effect = match child {
            Some(node) => match node.parent().cloned() {
                Some(old_parent_id) => {
                    let old_effective_op = node
                        .last_effective_op()
                        .cloned()
                        .ok_or_else(|| TreeError::MissingEffectiveOp(op.child_id.to_string()))?;
                    LogEffect {
                        old_info: Some(OldInfo {
                            old_effective_op,
                            old_parent_id,
                            old_meta: node.meta().cloned(),
                        }),
                        effective_op: op.clone(),
                        new_parent_id: op.new_parent_id.clone(),
                        new_meta: op.new_meta.clone(),
                        child_id: op.child_id.clone(),
                    }
                }
                None => Self::creation_effect(op),
            },
            None => Self::creation_effect(op),
        };
        Ok(LogRecord {
            op: op.clone(),
            effects: Some(vec![placeholder, child_effect]),
        })
    }

    /// The node occupying the destination name is replaced: it moves to the
    /// trash, renamed to its own id so trash children stay unique.
    fn displace_to_trash(&self, op: &Op<S>, occupant_id: S::NodeId) -> Result<Effect<S>> {
        let occupant = self
            .storage
            .get_by_id(&occupant_id)
            .ok_or_else(|| TreeError::MissingNode(occupant_id.to_string()))?;
        let occupant_op = occupant
            .last_effective_op()
            .cloned()
            .ok_or_else(|| TreeError::MissingEffectiveOp(occupant_id.to_string()))?;
        Ok(LogEffect {
            old_info: Some(OldInfo {
                old_effective_op: occupant_op,
                old_parent_id: op.new_parent_id.clone(),
                old_meta: occupant.meta().cloned(),
            }),
            effective_op: op.clone(),
            new_parent_id: self.storage.trash_id(),
            new_meta: occupant
                .meta()
                .map(|meta| meta.with_name(&occupant_id.to_string())),
            child_id: occupant_id,
        })
    }

    fn creation_effect(op: &Op<S>) -> Effect<S> {
        LogEffect {
            old_info: None,
            effective_op: op.clone(),
            new_parent_id: op.new_parent_id.clone(),
            new_meta: op.new_meta.clone(),
            child_id: op.child_id.clone(),
        }
    }

    fn apply_effects(&mut self, effects: &[Effect<S>]) -> Result<()> {
        for effect in effects {
            self.apply_effect(effect)?;
        }
        Ok(())
    }

    fn apply_effect(&mut self, effect: &Effect<S>) -> Result<()> {
        let new_name = effect.new_name();
        if effect.new_parent_id == self.storage.trash_id()
            && new_name != effect.child_id.to_string()
        {
            return Err(TreeError::BadTrashName(effect.child_id.to_string()));
        }

        let child = match self.storage.get_by_id(&effect.child_id) {
            Some(existing) => {
                if let Some(current_parent_id) = existing.parent().cloned() {
                    let current_parent = self
                        .storage
                        .get_by_id(&current_parent_id)
                        .ok_or_else(|| TreeError::MissingNode(current_parent_id.to_string()))?;
                    let current_name = existing.name();
                    self.storage
                        .put_node(current_parent.without_child(&current_name));
                }
                existing
            }
            None => {
                self.storage
                    .create_new_node(effect.child_id.clone(), None, effect.new_meta.clone())?
            }
        };

        // Re-read the destination: the detach above may have updated it when
        // the old and new parent are the same node.
        let new_parent = self
            .storage
            .get_by_id(&effect.new_parent_id)
            .ok_or_else(|| TreeError::MissingNode(effect.new_parent_id.to_string()))?;
        self.storage
            .put_node(new_parent.with_child(new_name, effect.child_id.clone()));

        self.storage.put_node(
            child
                .with_parent(Some(effect.new_parent_id.clone()))
                .with_meta(effect.new_meta.clone())
                .with_last_effective_op(Some(effect.effective_op.clone())),
        );
        Ok(())
    }

    /// Whether `child` is `parent` itself or a transitive ancestor of it.
    fn is_ancestor(&self, child: &S::NodeId, parent: &S::NodeId) -> Result<bool> {
        let mut current = parent.clone();
        loop {
            let node = self
                .storage
                .get_by_id(&current)
                .ok_or_else(|| TreeError::MissingNode(current.to_string()))?;
            match node.parent() {
                Some(next) if next == child => return Ok(true),
                Some(next) => current = next.clone(),
                None => return Ok(false),
            }
        }
    }

    /// Trim the log prefix no future delivery can ever splice into, and
    /// garbage-collect nodes that ended their trimmed history in the trash.
    fn try_trim_log(&mut self) -> Result<()> {
        let peers = self.peers.all_peers();
        if peers.is_empty() {
            return Ok(());
        }
        let mut threshold: Option<S::Timestamp> = None;
        for peer in &peers {
            let Some(seen) = self.storage.peer_log().get_for_peer(peer) else {
                // A peer we have never heard from pins the whole log.
                return Ok(());
            };
            threshold = Some(match threshold {
                None => seen,
                Some(current) if seen < current => seen,
                Some(current) => current,
            });
        }
        let Some(threshold) = threshold else {
            return Ok(());
        };

        let trash_id = self.storage.trash_id();
        let mut in_trash: HashSet<S::NodeId> = HashSet::new();
        let mut trimmed = 0usize;
        loop {
            let stable = match self.storage.log().peek_oldest() {
                Some((timestamp, _)) => timestamp.clock <= threshold,
                None => false,
            };
            if !stable {
                break;
            }
            let Some((_, record)) = self.storage.log_mut().take_oldest() else {
                break;
            };
            trimmed += 1;
            for effect in record.effects.iter().flatten() {
                if effect.new_parent_id == trash_id {
                    in_trash.insert(effect.child_id.clone());
                } else {
                    in_trash.remove(&effect.child_id);
                }
            }
        }
        if trimmed > 0 {
            debug!(trimmed, garbage = in_trash.len(), "trimmed causally stable log prefix");
        }
        if in_trash.is_empty() {
            return Ok(());
        }

        // Anything still in the trash after the stable prefix can never be
        // revived: every peer has already acknowledged past its deletion.
        let mut trash = self
            .storage
            .get_by_id(&trash_id)
            .ok_or_else(|| TreeError::MissingNode(trash_id.to_string()))?;
        for id in in_trash {
            trash = trash.without_child(&id.to_string());
            self.storage.remove_node(&id)?;
        }
        self.storage.put_node(trash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::AtomicClock;
    use crate::peers::{OpOutbox, StaticPeers};
    use crate::store::InMemoryStorage;
    use uuid::Uuid;

    type Storage = InMemoryStorage<u64, u64, String>;
    type Tree =
        ReplicatedTree<Storage, StaticPeers<u64>, AtomicClock, OpOutbox<u64, u64, String, Uuid>>;

    fn tree(self_id: u64, members: &[u64]) -> Tree {
        let targets = members
            .iter()
            .copied()
            .filter(|id| *id != self_id)
            .collect();
        ReplicatedTree::new(
            Storage::new(),
            StaticPeers::new(self_id, members.to_vec()),
            AtomicClock::default(),
            OpOutbox::new(targets),
        )
    }

    fn ext_op(clock: u64, peer: u64, parent: Uuid, name: &str, child: Uuid) -> OpMove<u64, u64, String, Uuid> {
        OpMove::new(
            CombinedTimestamp::new(clock, peer),
            parent,
            Some(name.to_string()),
            child,
        )
    }

    #[test]
    fn creates_and_traverses_nested_nodes() {
        let mut tree = tree(1, &[1]);
        let root = tree.storage().root_id();
        let docs = tree.new_node_id();
        let file = tree.new_node_id();
        tree.move_node(root, "docs".to_string(), docs).unwrap();
        tree.move_node(docs, "readme".to_string(), file).unwrap();

        assert_eq!(tree.traverse(&["docs"]), Some(docs));
        assert_eq!(tree.traverse(&["docs", "readme"]), Some(file));
        assert_eq!(tree.traverse(&["docs", "missing"]), None);
        assert_eq!(tree.traverse(&[]), Some(root));

        let node = tree.storage().get_by_id(&file).unwrap();
        assert_eq!(node.parent(), Some(&docs));
        assert_eq!(node.name(), "readme");
    }

    #[test]
    fn rename_within_parent_updates_children_map() {
        let mut tree = tree(1, &[1]);
        let root = tree.storage().root_id();
        let id = tree.new_node_id();
        tree.move_node(root, "draft".to_string(), id).unwrap();
        tree.move_node(root, "final".to_string(), id).unwrap();

        let root_node = tree.storage().get_by_id(&root).unwrap();
        assert_eq!(root_node.children().get("final"), Some(&id));
        assert_eq!(root_node.children().get("draft"), None);
    }

    #[test]
    fn trash_names_entry_by_node_id() {
        // peer 2 never acknowledges, so nothing is trimmed under the test
        let mut tree = tree(1, &[1, 2]);
        let root = tree.storage().root_id();
        let id = tree.new_node_id();
        tree.move_node(root, "scratch".to_string(), id).unwrap();
        tree.trash("scratch".to_string(), id).unwrap();

        let trash = tree.storage().get_by_id(&tree.storage().trash_id()).unwrap();
        assert_eq!(trash.children().get(&id.to_string()), Some(&id));
        assert_eq!(tree.traverse(&["scratch"]), None);
    }

    #[test]
    fn exclusive_create_fails_on_name_collision() {
        let mut tree = tree(1, &[1, 2]);
        let root = tree.storage().root_id();
        let first = tree.new_node_id();
        let second = tree.new_node_id();
        tree.move_node_exclusive(root, "f".to_string(), first).unwrap();
        let err = tree
            .move_node_exclusive(root, "f".to_string(), second)
            .unwrap_err();
        assert!(matches!(err, TreeError::AlreadyExists { .. }));
        // the losing op was not logged
        assert_eq!(tree.storage().log().len(), 1);
    }

    #[test]
    fn creation_conflict_renames_both_sides() {
        let mut tree = tree(1, &[1]);
        let root = tree.storage().root_id();
        let first = tree.new_node_id();
        let second = tree.new_node_id();
        tree.move_node(root, "f".to_string(), first).unwrap();
        tree.move_node(root, "f".to_string(), second).unwrap();

        let root_node = tree.storage().get_by_id(&root).unwrap();
        assert_eq!(root_node.children().get("f"), None);
        assert_eq!(
            root_node.children().get(&format!("f.conflict.{first}")),
            Some(&first)
        );
        assert_eq!(
            root_node.children().get(&format!("f.conflict.{second}")),
            Some(&second)
        );
        // the incumbent keeps its own placement op
        let incumbent = tree.storage().get_by_id(&first).unwrap();
        assert_eq!(incumbent.last_effective_op().unwrap().child_id, first);
    }

    #[test]
    fn cycle_creating_move_is_absorbed_as_noop() {
        let mut tree = tree(1, &[1, 2]);
        let root = tree.storage().root_id();
        let a = tree.new_node_id();
        let b = tree.new_node_id();
        tree.move_node(root, "a".to_string(), a).unwrap();
        tree.move_node(a, "b".to_string(), b).unwrap();

        tree.move_node(b, "a".to_string(), a).unwrap();

        // unchanged: a stays under root, b under a
        assert_eq!(tree.traverse(&["a", "b"]), Some(b));
        let (_, newest) = tree.storage().log().peek_newest().unwrap();
        assert!(newest.effects.is_none());
    }

    #[test]
    fn move_onto_occupied_name_displaces_occupant_to_trash() {
        let mut tree = tree(1, &[1, 2]);
        let root = tree.storage().root_id();
        let a = tree.new_node_id();
        let b = tree.new_node_id();
        tree.move_node(root, "f".to_string(), a).unwrap();
        tree.move_node(root, "g".to_string(), b).unwrap();

        // external move of b onto the name "f"
        let op = ext_op(100, 2, root, "f", b);
        tree.apply_external_op(2, op).unwrap();

        let root_node = tree.storage().get_by_id(&root).unwrap();
        assert_eq!(root_node.children().get("f"), Some(&b));
        assert_eq!(root_node.children().get("g"), None);
        let trash = tree.storage().get_by_id(&tree.storage().trash_id()).unwrap();
        assert_eq!(trash.children().get(&a.to_string()), Some(&a));
        let displaced = tree.storage().get_by_id(&a).unwrap();
        assert_eq!(displaced.name(), a.to_string());
    }

    #[test]
    fn unknown_parent_is_anchored_under_lost_found() {
        let mut tree = tree(1, &[1, 2]);
        let parent = Uuid::new_v4();
        let child = Uuid::new_v4();
        tree.apply_external_op(2, ext_op(10, 2, parent, "c", child))
            .unwrap();

        // the unknown parent exists as a placeholder under lost-found
        let lost_found = tree
            .storage()
            .get_by_id(&tree.storage().lost_found_id())
            .unwrap();
        assert_eq!(lost_found.children().get(&parent.to_string()), Some(&parent));
        let placeholder = tree.storage().get_by_id(&parent).unwrap();
        assert!(placeholder.meta().is_none());
        // the child sits under its true parent id
        let child_node = tree.storage().get_by_id(&child).unwrap();
        assert_eq!(child_node.parent(), Some(&parent));
        assert_eq!(placeholder.children().get("c"), Some(&child));
    }

    #[test]
    fn late_delivery_is_spliced_in_timestamp_order() {
        let mut tree = tree(1, &[1, 2, 3]);
        let root = tree.storage().root_id();
        let x = Uuid::new_v4();
        let y = Uuid::new_v4();
        tree.apply_external_op(2, ext_op(10, 2, root, "x", x)).unwrap();
        tree.apply_external_op(3, ext_op(5, 3, root, "y", y)).unwrap();

        assert_eq!(tree.traverse(&["x"]), Some(x));
        assert_eq!(tree.traverse(&["y"]), Some(y));
        let order: Vec<u64> = tree
            .storage()
            .log()
            .all()
            .iter()
            .map(|(timestamp, _)| timestamp.clock)
            .collect();
        assert_eq!(order, vec![5, 10]);
    }

    #[test]
    fn redelivery_via_another_peer_is_idempotent() {
        let mut tree = tree(1, &[1, 2, 3]);
        let root = tree.storage().root_id();
        let z = Uuid::new_v4();
        let op = ext_op(7, 3, root, "z", z);
        tree.apply_external_op(2, op.clone()).unwrap();
        let log_before = tree.storage().log().all();

        // the originator delivers the same op directly
        tree.apply_external_op(3, op.clone()).unwrap();
        assert_eq!(tree.storage().log().all(), log_before);
        // and a repeat from the same relay is dropped by the ledger guard
        tree.apply_external_op(2, op).unwrap();
        assert_eq!(tree.storage().log().all(), log_before);
        assert_eq!(tree.traverse(&["z"]), Some(z));
    }

    #[test]
    fn trim_discards_stable_prefix_and_collects_trash() {
        let mut tree = tree(1, &[1, 2]);
        let root = tree.storage().root_id();
        let dir = tree.new_node_id();
        let file = tree.new_node_id();
        tree.move_node(root, "a".to_string(), dir).unwrap();
        tree.move_node(dir, "f".to_string(), file).unwrap();
        tree.trash("f".to_string(), file).unwrap();

        // peer 2 has acknowledged nothing yet: the log is pinned
        assert_eq!(tree.storage().log().len(), 3);
        assert!(tree.storage().get_by_id(&file).is_some());

        tree.update_external_timestamp(2, 10).unwrap();

        assert!(tree.storage().log().is_empty());
        assert!(tree.storage().get_by_id(&file).is_none());
        let trash = tree.storage().get_by_id(&tree.storage().trash_id()).unwrap();
        assert!(trash.children().is_empty());
        // nothing outside the trash was removed
        assert_eq!(tree.traverse(&["a"]), Some(dir));
    }

    #[test]
    fn trim_skips_entries_past_the_threshold() {
        let mut tree = tree(1, &[1, 2]);
        let root = tree.storage().root_id();
        let a = tree.new_node_id();
        let b = tree.new_node_id();
        tree.move_node(root, "a".to_string(), a).unwrap(); // clock 1
        tree.update_external_timestamp(2, 1).unwrap();
        tree.move_node(root, "b".to_string(), b).unwrap(); // clock > 1

        // only the first op was causally stable
        let remaining: Vec<u64> = tree
            .storage()
            .log()
            .all()
            .iter()
            .map(|(timestamp, _)| timestamp.clock)
            .collect();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0] > 1);
        assert_eq!(tree.traverse(&["a"]), Some(a));
        assert_eq!(tree.traverse(&["b"]), Some(b));
    }

    #[test]
    fn local_ops_are_recorded_for_broadcast() {
        let mut tree = tree(1, &[1, 2, 3]);
        let root = tree.storage().root_id();
        let id = tree.new_node_id();
        tree.move_node(root, "docs".to_string(), id).unwrap();

        for peer in [2u64, 3] {
            let pending = tree.recorder().pending_for(&peer, usize::MAX);
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].child_id, id);
        }
        // external ops are not re-broadcast
        let other = Uuid::new_v4();
        tree.apply_external_op(2, ext_op(50, 2, root, "ext", other))
            .unwrap();
        assert_eq!(tree.recorder().pending_for(&2, usize::MAX).len(), 1);
    }

    #[test]
    fn find_parent_locates_child_by_predicate() {
        let mut tree = tree(1, &[1]);
        let root = tree.storage().root_id();
        let dir = tree.new_node_id();
        let file = tree.new_node_id();
        tree.move_node(root, "dir".to_string(), dir).unwrap();
        tree.move_node(dir, "needle".to_string(), file).unwrap();

        let (name, parent) = tree.find_parent(|node| node.name() == "needle").unwrap();
        assert_eq!(name, "needle");
        assert_eq!(parent, dir);
        assert!(tree.find_parent(|node| node.name() == "absent").is_none());
    }

    #[test]
    fn walk_tree_visits_every_reachable_node() {
        let mut tree = tree(1, &[1]);
        let root = tree.storage().root_id();
        let a = tree.new_node_id();
        let b = tree.new_node_id();
        let c = tree.new_node_id();
        tree.move_node(root, "a".to_string(), a).unwrap();
        tree.move_node(a, "b".to_string(), b).unwrap();
        tree.move_node(b, "c".to_string(), c).unwrap();

        let mut seen = Vec::new();
        tree.walk_tree(|node| seen.push(*node.key()));
        assert_eq!(seen.len(), 4); // root + 3
        for id in [root, a, b, c] {
            assert!(seen.contains(&id));
        }
    }

    #[test]
    fn bootstrap_regenerates_state_from_minimal_ops() {
        let mut source = tree(1, &[1, 2]);
        let root = source.storage().root_id();
        let dir = source.new_node_id();
        let file = source.new_node_id();
        let gone = source.new_node_id();
        source.move_node(root, "dir".to_string(), dir).unwrap();
        source.move_node(dir, "file".to_string(), file).unwrap();
        source.move_node(root, "gone".to_string(), gone).unwrap();
        source.trash("gone".to_string(), gone).unwrap();
        // make the full history causally stable and trimmed away
        source.update_external_timestamp(2, 100).unwrap();
        assert!(source.storage().log().is_empty());

        // discard the regular broadcast queue, then bootstrap peer 2
        let queued = source.recorder().pending_for(&2, usize::MAX);
        for op in queued {
            source.recorder_mut().commit_for(&2, &op.timestamp).unwrap();
        }
        source.record_bootstrap_for(&2);
        let ops = source.recorder().pending_for(&2, usize::MAX);
        // one op per live node, nothing for the deleted one
        assert_eq!(ops.len(), 2);

        let mut joiner = tree(2, &[1, 2]);
        for op in ops {
            joiner.apply_external_op(1, op).unwrap();
        }
        assert_eq!(joiner.traverse(&["dir"]), Some(dir));
        assert_eq!(joiner.traverse(&["dir", "file"]), Some(file));
        assert_eq!(joiner.traverse(&["gone"]), None);
    }
}
