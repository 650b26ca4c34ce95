//! Tree nodes as immutable values.
//!
//! Updates go through the `with_*` constructors, which copy rather than
//! mutate. During undo/redo the engine frequently holds two handles that
//! would alias the same node (a node's old and new parent can be the same);
//! value semantics make that safe by construction.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use crate::meta::NodeMeta;
use crate::op::OpMove;

/// A node of the replicated tree.
///
/// `parent` is `None` only for the reserved nodes (root, trash, lost-found)
/// and for nodes whose creation was undone mid-replay. `meta` is `None` only
/// for the reserved nodes and for placeholders fabricated under lost-found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode<T, P, M, Id>
where
    Id: Eq + Hash,
{
    key: Id,
    parent: Option<Id>,
    meta: Option<M>,
    children: HashMap<String, Id>,
    last_effective_op: Option<OpMove<T, P, M, Id>>,
}

impl<T, P, M, Id> TreeNode<T, P, M, Id>
where
    M: NodeMeta,
    Id: Clone + Eq + Hash + fmt::Display,
{
    pub fn new(key: Id, parent: Option<Id>, meta: Option<M>) -> Self {
        Self {
            key,
            parent,
            meta,
            children: HashMap::new(),
            last_effective_op: None,
        }
    }

    pub fn key(&self) -> &Id {
        &self.key
    }

    pub fn parent(&self) -> Option<&Id> {
        self.parent.as_ref()
    }

    pub fn meta(&self) -> Option<&M> {
        self.meta.as_ref()
    }

    pub fn children(&self) -> &HashMap<String, Id> {
        &self.children
    }

    /// The operation that most recently placed this node at its current
    /// parent. `None` for reserved nodes and un-created nodes.
    pub fn last_effective_op(&self) -> Option<&OpMove<T, P, M, Id>> {
        self.last_effective_op.as_ref()
    }

    /// The node's name: its metadata name, or its key rendered as a string
    /// when it carries no metadata.
    pub fn name(&self) -> String {
        match &self.meta {
            Some(meta) => meta.name().to_string(),
            None => self.key.to_string(),
        }
    }

    pub fn with_parent(mut self, parent: Option<Id>) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_meta(mut self, meta: Option<M>) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_last_effective_op(mut self, op: Option<OpMove<T, P, M, Id>>) -> Self {
        self.last_effective_op = op;
        self
    }

    pub fn with_children(mut self, children: HashMap<String, Id>) -> Self {
        self.children = children;
        self
    }

    /// Copy with `id` inserted under `name`.
    pub fn with_child(mut self, name: String, id: Id) -> Self {
        self.children.insert(name, id);
        self
    }

    /// Copy with the child under `name` removed.
    pub fn without_child(mut self, name: &str) -> Self {
        self.children.remove(name);
        self
    }
}
