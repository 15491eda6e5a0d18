//! Wire messages.
//!
//! All messages are JSON objects. A trace request is a node id plus the
//! flat-trace fields inlined at the top level; a trace result echoes the same
//! shape back with the extended trace and an optional diagnostic annotation.
//! Byte payloads inside these messages use the latin-1 text encoding.

use serde::{Deserialize, Serialize};
use tracery_core::{FlatTrace, NodeId};

/// Work-list name trace requests are pushed to
pub const WORK_TRACE: &str = "work.trace";
/// Feed announcing each node as it enters the tree
pub const CHANNEL_NODE: &str = "node";
/// Feed carrying external answers for blocked nodes
pub const CHANNEL_INPUT: &str = "input";
/// Prefix shared by every trace-result channel
pub const TRACE_CHANNEL_PREFIX: &str = "trace.";

/// Result channel for an outcome kind, e.g. `trace.finished`
#[must_use]
pub fn result_channel(kind: &str) -> String {
    format!("{}{}", TRACE_CHANNEL_PREFIX, kind)
}

/// Request to replay a trace prefix and extend past it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRequest {
    /// Node whose root-path trace this is
    pub node_id: NodeId,
    /// The trace prefix to replay
    #[serde(flatten)]
    pub trace: FlatTrace,
}

/// Outcome of one tracing run, published on `trace.<kind>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceResult {
    /// Node the originating request named
    pub node_id: NodeId,
    /// The full trace the run observed
    #[serde(flatten)]
    pub trace: FlatTrace,
    /// Diagnostic text for failed runs
    #[serde(default)]
    pub annotation: Option<String>,
}

impl TraceResult {
    /// Build a result echoing a request's node id
    #[must_use]
    pub fn new(node_id: NodeId, trace: FlatTrace, annotation: Option<String>) -> Self {
        Self {
            node_id,
            trace,
            annotation,
        }
    }
}

/// Announcement of a node entering the execution tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAnnouncement {
    /// The new node
    pub id: NodeId,
    /// Its parent; `None` for the root
    #[serde(default)]
    pub parent_id: Option<NodeId>,
}

/// External answer for a blocked node.
///
/// Empty `data` is a valid answer and means end-of-input on the blocked
/// channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEvent {
    /// The blocked node being answered
    pub id: NodeId,
    /// Answer payload
    #[serde(with = "tracery_core::encoding::latin1")]
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracery_core::{Direction, Interaction, CHANNEL_STDIO};

    #[test]
    fn test_result_channel_names() {
        assert_eq!(result_channel("finished"), "trace.finished");
        assert_eq!(result_channel("blocked"), "trace.blocked");
        assert_eq!(result_channel("desync"), "trace.desync");
    }

    #[test]
    fn test_request_flattens_trace_fields() {
        let request = TraceRequest {
            node_id: NodeId::from_raw(3),
            trace: FlatTrace {
                basic_blocks: vec![0x1000],
                ..FlatTrace::empty()
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["node_id"], 3);
        assert_eq!(json["basic_blocks"][0], 0x1000);
        assert!(json.get("trace").is_none());
    }

    #[test]
    fn test_result_round_trips_binary_payloads() {
        let result = TraceResult::new(
            NodeId::from_raw(7),
            FlatTrace {
                interactions: vec![Interaction::resolved(
                    CHANNEL_STDIO,
                    Direction::Output,
                    vec![0x00, 0xff, 0x80],
                    2,
                )],
                ..FlatTrace::empty()
            },
            Some("note".to_string()),
        );
        let json = serde_json::to_string(&result).unwrap();
        let back: TraceResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_input_event_empty_data_is_valid() {
        let event: InputEvent = serde_json::from_str(r#"{"id": 4, "data": ""}"#).unwrap();
        assert_eq!(event.id, NodeId::from_raw(4));
        assert!(event.data.is_empty());
    }

    #[test]
    fn test_root_announcement_has_no_parent() {
        let json = serde_json::to_value(NodeAnnouncement {
            id: NodeId::ROOT,
            parent_id: None,
        })
        .unwrap();
        assert_eq!(json["id"], 0);
        assert_eq!(json["parent_id"], serde_json::Value::Null);
    }
}
