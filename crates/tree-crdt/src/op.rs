//! Operations and the effects they produce.
//!
//! An [`OpMove`] is the only kind of edit: "place this child under that
//! parent with this metadata". Applying one produces zero, one, or two
//! [`LogEffect`]s, each carrying enough pre-effect state ([`OldInfo`]) to be
//! inverted exactly when a late-arriving operation forces a replay.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::meta::NodeMeta;
use crate::timestamp::CombinedTimestamp;

/// A move request. Immutable once created; replicas exchange these verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpMove<T, P, M, Id> {
    pub timestamp: CombinedTimestamp<T, P>,
    pub new_parent_id: Id,
    pub new_meta: Option<M>,
    pub child_id: Id,
}

impl<T, P, M, Id> OpMove<T, P, M, Id> {
    pub fn new(
        timestamp: CombinedTimestamp<T, P>,
        new_parent_id: Id,
        new_meta: Option<M>,
        child_id: Id,
    ) -> Self {
        Self {
            timestamp,
            new_parent_id,
            new_meta,
            child_id,
        }
    }
}

impl<T, P, M: NodeMeta, Id: fmt::Display> OpMove<T, P, M, Id> {
    /// Name the child takes: the metadata name, or the child id rendered as
    /// a string when the operation carries no metadata.
    pub fn new_name(&self) -> String {
        match &self.new_meta {
            Some(meta) => meta.name().to_string(),
            None => self.child_id.to_string(),
        }
    }
}

/// Pre-effect state of the affected node: exactly what is needed to put it
/// back. Absent when the effect created the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OldInfo<T, P, M, Id> {
    pub old_effective_op: OpMove<T, P, M, Id>,
    pub old_parent_id: Id,
    pub old_meta: Option<M>,
}

/// One atomic mutation of the tree produced by applying an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEffect<T, P, M, Id> {
    pub old_info: Option<OldInfo<T, P, M, Id>>,
    /// The operation that caused this effect. Usually the incoming op, but a
    /// conflict rename keeps the displaced node's own placement op.
    pub effective_op: OpMove<T, P, M, Id>,
    pub new_parent_id: Id,
    pub new_meta: Option<M>,
    pub child_id: Id,
}

impl<T, P, M: NodeMeta, Id: fmt::Display> LogEffect<T, P, M, Id> {
    /// Name the child holds after this effect.
    pub fn new_name(&self) -> String {
        match &self.new_meta {
            Some(meta) => meta.name().to_string(),
            None => self.child_id.to_string(),
        }
    }

    /// Name the child held before this effect. Meaningful only when
    /// `old_info` is present.
    pub fn old_name(&self) -> String {
        match self.old_info.as_ref().and_then(|old| old.old_meta.as_ref()) {
            Some(meta) => meta.name().to_string(),
            None => self.child_id.to_string(),
        }
    }
}

/// A log entry: the operation plus the effects it had when (re)applied.
/// `effects == None` records an operation absorbed as a no-op, e.g. a move
/// that would have created a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord<T, P, M, Id> {
    pub op: OpMove<T, P, M, Id>,
    pub effects: Option<Vec<LogEffect<T, P, M, Id>>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(name: &str) -> OpMove<u64, u64, String, u64> {
        OpMove::new(
            CombinedTimestamp::new(1, 1),
            10,
            Some(name.to_string()),
            42,
        )
    }

    #[test]
    fn new_name_prefers_meta() {
        assert_eq!(op("docs").new_name(), "docs");
    }

    #[test]
    fn new_name_falls_back_to_id() {
        let op = OpMove::<u64, u64, String, u64>::new(CombinedTimestamp::new(1, 1), 10, None, 42);
        assert_eq!(op.new_name(), "42");
    }

    #[test]
    fn effect_old_name_uses_old_meta() {
        let effect = LogEffect {
            old_info: Some(OldInfo {
                old_effective_op: op("before"),
                old_parent_id: 10u64,
                old_meta: Some("before".to_string()),
            }),
            effective_op: op("after"),
            new_parent_id: 11,
            new_meta: Some("after".to_string()),
            child_id: 42,
        };
        assert_eq!(effect.old_name(), "before");
        assert_eq!(effect.new_name(), "after");
    }

    #[test]
    fn serde_roundtrip() {
        let record = LogRecord {
            op: op("docs"),
            effects: Some(vec![LogEffect {
                old_info: None,
                effective_op: op("docs"),
                new_parent_id: 10u64,
                new_meta: Some("docs".to_string()),
                child_id: 42u64,
            }]),
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: LogRecord<u64, u64, String, u64> = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }
}
