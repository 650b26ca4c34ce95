//! Node storage abstraction.
//!
//! Implementations:
//! - `InMemoryStorage` - For testing and single-process embedding
//! - Durable backends live with the host application: any transactional
//!   store that can hold node records and the op log qualifies
//!
//! The engine reads and writes through this trait only and never caches, so
//! the owning transaction scope fully decides visibility and rollback.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use thiserror::Error;
use uuid::Uuid;

use crate::log::{InMemoryOpLog, InMemoryPeerLog, OpLog, PeerTimestampLog};
use crate::meta::NodeMeta;
use crate::node::TreeNode;

#[derive(Debug, Error)]
pub enum StorageError {
    /// A node was created twice under one id; the tree never does this, so
    /// it signals a corrupted store or a misbehaving caller.
    #[error("node {0} already exists")]
    NodeExists(String),

    #[error("node {0} does not exist")]
    NodeMissing(String),
}

/// Storage for one replicated tree: node records, the operation log, and the
/// per-peer timestamp ledger.
pub trait TreeStorage {
    type Timestamp: Clone + Ord + fmt::Display;
    type PeerId: Clone + Ord + fmt::Display;
    type Meta: NodeMeta;
    type NodeId: Clone + Eq + Hash + fmt::Display;
    type Log: OpLog<Self::Timestamp, Self::PeerId, Self::Meta, Self::NodeId>;
    type PeerLog: PeerTimestampLog<Self::Timestamp, Self::PeerId>;

    /// Id of the tree root. Fixed for the lifetime of the tree.
    fn root_id(&self) -> Self::NodeId;

    /// Id of the trash node, the destination of logical deletes.
    fn trash_id(&self) -> Self::NodeId;

    /// Id of the lost-found node anchoring placeholders for parents that
    /// have not been observed yet.
    fn lost_found_id(&self) -> Self::NodeId;

    /// Mint a fresh node id, unique across all peers.
    fn new_node_id(&self) -> Self::NodeId;

    fn get_by_id(
        &self,
        id: &Self::NodeId,
    ) -> Option<TreeNode<Self::Timestamp, Self::PeerId, Self::Meta, Self::NodeId>>;

    /// Register a brand-new node. Fails if `key` is already present.
    fn create_new_node(
        &mut self,
        key: Self::NodeId,
        parent: Option<Self::NodeId>,
        meta: Option<Self::Meta>,
    ) -> Result<TreeNode<Self::Timestamp, Self::PeerId, Self::Meta, Self::NodeId>, StorageError>;

    fn put_node(&mut self, node: TreeNode<Self::Timestamp, Self::PeerId, Self::Meta, Self::NodeId>);

    fn remove_node(&mut self, id: &Self::NodeId) -> Result<(), StorageError>;

    fn log(&self) -> &Self::Log;

    fn log_mut(&mut self) -> &mut Self::Log;

    fn peer_log(&self) -> &Self::PeerLog;

    fn peer_log_mut(&mut self) -> &mut Self::PeerLog;
}

// Reserved node ids are fixed so every replica agrees on them without
// coordination.
const ROOT_ID: Uuid = Uuid::from_u128(1);
const TRASH_ID: Uuid = Uuid::from_u128(2);
const LOST_FOUND_ID: Uuid = Uuid::from_u128(3);

/// In-memory storage with `Uuid` node ids.
///
/// Seeds the three reserved nodes at construction; they carry no metadata
/// and are never removed.
#[derive(Debug, Clone)]
pub struct InMemoryStorage<T, P, M>
where
    T: Ord,
    P: Ord,
{
    nodes: HashMap<Uuid, TreeNode<T, P, M, Uuid>>,
    log: InMemoryOpLog<T, P, M, Uuid>,
    peer_log: InMemoryPeerLog<T, P>,
}

impl<T, P, M> InMemoryStorage<T, P, M>
where
    T: Clone + Ord + fmt::Display,
    P: Clone + Ord + fmt::Display,
    M: NodeMeta,
{
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        for id in [ROOT_ID, TRASH_ID, LOST_FOUND_ID] {
            nodes.insert(id, TreeNode::new(id, None, None));
        }
        Self {
            nodes,
            log: InMemoryOpLog::new(),
            peer_log: InMemoryPeerLog::new(),
        }
    }

    /// Number of node records held, reserved nodes included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl<T, P, M> Default for InMemoryStorage<T, P, M>
where
    T: Clone + Ord + fmt::Display,
    P: Clone + Ord + fmt::Display,
    M: NodeMeta,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, P, M> TreeStorage for InMemoryStorage<T, P, M>
where
    T: Clone + Ord + fmt::Display,
    P: Clone + Ord + fmt::Display,
    M: NodeMeta,
{
    type Timestamp = T;
    type PeerId = P;
    type Meta = M;
    type NodeId = Uuid;
    type Log = InMemoryOpLog<T, P, M, Uuid>;
    type PeerLog = InMemoryPeerLog<T, P>;

    fn root_id(&self) -> Uuid {
        ROOT_ID
    }

    fn trash_id(&self) -> Uuid {
        TRASH_ID
    }

    fn lost_found_id(&self) -> Uuid {
        LOST_FOUND_ID
    }

    fn new_node_id(&self) -> Uuid {
        Uuid::new_v4()
    }

    fn get_by_id(&self, id: &Uuid) -> Option<TreeNode<T, P, M, Uuid>> {
        self.nodes.get(id).cloned()
    }

    fn create_new_node(
        &mut self,
        key: Uuid,
        parent: Option<Uuid>,
        meta: Option<M>,
    ) -> Result<TreeNode<T, P, M, Uuid>, StorageError> {
        if self.nodes.contains_key(&key) {
            return Err(StorageError::NodeExists(key.to_string()));
        }
        let node = TreeNode::new(key, parent, meta);
        self.nodes.insert(key, node.clone());
        Ok(node)
    }

    fn put_node(&mut self, node: TreeNode<T, P, M, Uuid>) {
        self.nodes.insert(*node.key(), node);
    }

    fn remove_node(&mut self, id: &Uuid) -> Result<(), StorageError> {
        match self.nodes.remove(id) {
            Some(_) => Ok(()),
            None => Err(StorageError::NodeMissing(id.to_string())),
        }
    }

    fn log(&self) -> &Self::Log {
        &self.log
    }

    fn log_mut(&mut self) -> &mut Self::Log {
        &mut self.log
    }

    fn peer_log(&self) -> &Self::PeerLog {
        &self.peer_log
    }

    fn peer_log_mut(&mut self) -> &mut Self::PeerLog {
        &mut self.peer_log
    }
}
