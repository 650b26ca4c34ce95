//! tree-crdt: Replicated tree that converges under concurrent structural
//! edits (create, move/rename, delete-to-trash) from multiple peers with no
//! coordinator.
//!
//! This crate provides the core functionality for:
//! - Stamping every edit with a totally ordered (clock, peer) key
//! - Applying deliveries in any order via undo/redo splicing of the op log
//! - Deterministic conflict resolution (rename-on-create-conflict,
//!   replace-to-trash, cycle absorption, lost-found placeholders)
//! - Causal-stability log trimming with trash garbage collection
//! - Minimal bootstrap export for resyncing a peer
//!
//! Storage, peer membership, clocks and the outbound op queue are injected
//! through traits; in-memory implementations are bundled for testing and
//! single-process embedding.

pub mod clock;
pub mod log;
pub mod meta;
pub mod node;
pub mod op;
pub mod peer_id;
pub mod peers;
pub mod store;
pub mod timestamp;
pub mod tree;

pub use clock::{AtomicClock, Clock};
pub use log::{InMemoryOpLog, InMemoryPeerLog, LogError, OpLog, PeerTimestampLog};
pub use meta::NodeMeta;
pub use node::TreeNode;
pub use op::{LogEffect, LogRecord, OldInfo, OpMove};
pub use peer_id::{PeerId, PeerIdError};
pub use peers::{OpOutbox, OpRecorder, OutboxError, PeerDirectory, StaticPeers};
pub use store::{InMemoryStorage, StorageError, TreeStorage};
pub use timestamp::CombinedTimestamp;
pub use tree::{ReplicatedTree, TreeError};
