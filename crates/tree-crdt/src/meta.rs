//! Opaque per-node metadata.
//!
//! The tree never inspects metadata beyond its name: it moves payloads
//! between nodes, renames them during conflict resolution, and checks that
//! a move never changes a payload's concrete shape (a file cannot become a
//! directory by replication).

/// Metadata payload carried by a tree node.
///
/// Implementors are closed unions of concrete shapes (e.g. directory vs
/// file). Renaming must not change the shape.
pub trait NodeMeta: Clone {
    /// Name of the node within its parent's children map.
    fn name(&self) -> &str;

    /// A copy of this metadata renamed to `name`.
    fn with_name(&self, name: &str) -> Self;

    /// Whether `other` has the same concrete shape as `self`. Enum
    /// implementors typically compare `std::mem::discriminant`.
    fn same_kind(&self, other: &Self) -> bool;
}

/// Name-only metadata, for trees whose nodes carry nothing but a name.
impl NodeMeta for String {
    fn name(&self) -> &str {
        self
    }

    fn with_name(&self, name: &str) -> Self {
        name.to_string()
    }

    fn same_kind(&self, _other: &Self) -> bool {
        true
    }
}
