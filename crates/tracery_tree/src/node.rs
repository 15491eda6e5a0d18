//! Tree nodes.
//!
//! A node owns one contiguous slice of a flat trace. Concatenating the
//! slices along the root-to-node path reproduces the exact flat trace a
//! from-scratch replay of that node would observe. Once announced, a node's
//! trace slice never changes; answering a blocked node produces a new node.

use tracery_core::{CoreError, CoreResult, FlatTrace, Interaction, NodeId};

/// Persisted per-node attribute names, in storage order
pub const ATTRIBUTES: &[&str] = &[
    "parent_id",
    "tracepoints",
    "basic_blocks",
    "syscalls",
    "interactions",
    "datapoints",
    "maps",
];

/// One execution-tree node and its trace slice
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Node id, unique and never reused
    pub id: NodeId,
    /// Parent node; `None` for the root
    pub parent_id: Option<NodeId>,
    /// This node's contiguous trace slice
    pub trace: FlatTrace,
}

impl Node {
    /// Create an empty node
    #[must_use]
    pub fn new(id: NodeId, parent_id: Option<NodeId>) -> Self {
        Self {
            id,
            parent_id,
            trace: FlatTrace::empty(),
        }
    }

    /// Last interaction of this node's slice, if any
    #[must_use]
    pub fn trailing_interaction(&self) -> Option<&Interaction> {
        self.trace.interactions.last()
    }

    /// Whether this node ended blocked awaiting external input
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.trailing_interaction().is_some_and(Interaction::is_pending)
    }

    /// One attribute of this node, JSON-encoded for storage.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` for an unknown attribute name.
    pub fn attribute(&self, attr: &str) -> CoreResult<String> {
        let value = match attr {
            "parent_id" => serde_json::to_value(self.parent_id)?,
            "tracepoints" => serde_json::to_value(&self.trace.tracepoints)?,
            "basic_blocks" => serde_json::to_value(&self.trace.basic_blocks)?,
            "syscalls" => serde_json::to_value(&self.trace.syscalls)?,
            "interactions" => serde_json::to_value(&self.trace.interactions)?,
            "datapoints" => serde_json::to_value(&self.trace.datapoints)?,
            "maps" => serde_json::to_value(&self.trace.maps)?,
            other => {
                return Err(CoreError::Validation {
                    field: other.to_string(),
                    reason: "unknown node attribute".to_string(),
                })
            }
        };
        Ok(value.to_string())
    }

    /// Set one attribute from its JSON-encoded storage form.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` for an unknown attribute name and
    /// `CoreError::ParseError` for malformed JSON.
    pub fn set_attribute(&mut self, attr: &str, raw: &str) -> CoreResult<()> {
        match attr {
            "parent_id" => self.parent_id = serde_json::from_str(raw)?,
            "tracepoints" => self.trace.tracepoints = serde_json::from_str(raw)?,
            "basic_blocks" => self.trace.basic_blocks = serde_json::from_str(raw)?,
            "syscalls" => self.trace.syscalls = serde_json::from_str(raw)?,
            "interactions" => self.trace.interactions = serde_json::from_str(raw)?,
            "datapoints" => self.trace.datapoints = serde_json::from_str(raw)?,
            "maps" => self.trace.maps = serde_json::from_str(raw)?,
            other => {
                return Err(CoreError::Validation {
                    field: other.to_string(),
                    reason: "unknown node attribute".to_string(),
                })
            }
        }
        Ok(())
    }
}
