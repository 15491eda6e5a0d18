//! Flat execution traces.
//!
//! A flat trace is everything one run of the target observed, in absolute
//! `trace_index` order. The execution tree stores contiguous slices of this
//! shape per node; concatenating the slices along a root-to-node path
//! reproduces the flat trace a from-scratch replay would observe.

use crate::interaction::Interaction;
use crate::syscall::SyscallRecord;
use serde::{Deserialize, Serialize};

/// An opaque analysis datapoint anchored to a trace position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    /// Basic-block counter at the moment of capture
    pub trace_index: usize,
    /// Datapoint payload
    pub value: serde_json::Value,
}

/// Everything observed in one run (or one node's slice of it)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatTrace {
    /// Static instrumentation points; contributed by the root only
    #[serde(default)]
    pub tracepoints: Vec<u64>,
    /// Executed basic-block addresses, ordered; position is the trace index
    #[serde(default)]
    pub basic_blocks: Vec<u64>,
    /// Observed syscalls, ordered by trace index
    #[serde(default)]
    pub syscalls: Vec<SyscallRecord>,
    /// Observed interactions, ordered by trace index
    #[serde(default)]
    pub interactions: Vec<Interaction>,
    /// Analysis datapoints, ordered by trace index
    #[serde(default)]
    pub datapoints: Vec<Datapoint>,
    /// Memory-map snapshot; contributed by the root only
    #[serde(default)]
    pub maps: Option<String>,
}

impl FlatTrace {
    /// A trace with no recorded content
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether nothing has been recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.basic_blocks.is_empty()
            && self.syscalls.is_empty()
            && self.interactions.is_empty()
            && self.datapoints.is_empty()
    }

    /// Append another slice's content onto this trace, in order.
    ///
    /// `tracepoints` and `maps` are root-only attributes and are taken from
    /// the first slice that carries them.
    pub fn append_slice(&mut self, slice: &Self) {
        if self.tracepoints.is_empty() {
            self.tracepoints.extend_from_slice(&slice.tracepoints);
        }
        if self.maps.is_none() {
            self.maps = slice.maps.clone();
        }
        self.basic_blocks.extend_from_slice(&slice.basic_blocks);
        self.syscalls.extend_from_slice(&slice.syscalls);
        self.interactions.extend_from_slice(&slice.interactions);
        self.datapoints.extend_from_slice(&slice.datapoints);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::{Direction, CHANNEL_STDIO};

    fn slice_with_block(addr: u64) -> FlatTrace {
        FlatTrace {
            basic_blocks: vec![addr],
            ..FlatTrace::default()
        }
    }

    #[test]
    fn test_empty() {
        assert!(FlatTrace::empty().is_empty());
    }

    #[test]
    fn test_append_slice_concatenates() {
        let mut trace = slice_with_block(0x1000);
        let mut second = slice_with_block(0x2000);
        second
            .interactions
            .push(Interaction::resolved(CHANNEL_STDIO, Direction::Output, b"x".to_vec(), 1));
        trace.append_slice(&second);
        assert_eq!(trace.basic_blocks, vec![0x1000, 0x2000]);
        assert_eq!(trace.interactions.len(), 1);
    }

    #[test]
    fn test_root_attributes_taken_once() {
        let mut trace = FlatTrace {
            tracepoints: vec![0x42],
            maps: Some("root maps".to_string()),
            ..FlatTrace::default()
        };
        let child = FlatTrace {
            tracepoints: vec![0x99],
            maps: Some("child maps".to_string()),
            ..FlatTrace::default()
        };
        trace.append_slice(&child);
        assert_eq!(trace.tracepoints, vec![0x42]);
        assert_eq!(trace.maps.as_deref(), Some("root maps"));
    }

    #[test]
    fn test_json_shape() {
        let trace = FlatTrace::empty();
        let json = serde_json::to_value(&trace).unwrap();
        for key in ["tracepoints", "basic_blocks", "syscalls", "interactions", "datapoints", "maps"]
        {
            assert!(json.get(key).is_some(), "missing key {}", key);
        }
    }
}
