//! Node identifiers.
//!
//! Node ids are globally unique, monotonically assigned by the tree builder,
//! and never reused. The root of the execution tree is always id 0.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an execution-tree node
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    /// The root node id
    pub const ROOT: Self = Self(0);

    /// Create a node id from a raw value
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value of this id
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The next id in monotone assignment order
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Whether this is the root id
    #[must_use]
    pub const fn is_root(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_id() {
        assert!(NodeId::ROOT.is_root());
        assert_eq!(NodeId::ROOT.raw(), 0);
        assert!(!NodeId::from_raw(1).is_root());
    }

    #[test]
    fn test_next_is_monotone() {
        let id = NodeId::from_raw(41);
        assert_eq!(id.next(), NodeId::from_raw(42));
        assert!(id < id.next());
    }

    #[test]
    fn test_serde_transparent() {
        let id = NodeId::from_raw(7);
        assert_eq!(serde_json::to_string(&id).unwrap(), "7");
        let back: NodeId = serde_json::from_str("7").unwrap();
        assert_eq!(back, id);
    }
}
