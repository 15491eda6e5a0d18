//! Interaction records.
//!
//! An interaction is one observed logical I/O transfer on a named channel.
//! Interactions are totally ordered by `trace_index`; consecutive interactions
//! with an equal `(channel, direction)` endpoint are the only candidates for
//! merging across a node boundary.

use serde::{Deserialize, Serialize};

/// Channel name of the target's standard input/output stream
pub const CHANNEL_STDIO: &str = "stdio";
/// Channel name of the target's standard error stream
pub const CHANNEL_STDERR: &str = "stderr";
/// Channel name of the synthetic error-marker interaction
pub const CHANNEL_ERROR: &str = "error";

/// Channel name for a socket channel established in order `index`
#[must_use]
pub fn tcp_channel(index: usize) -> String {
    format!("tcp:{}", index)
}

/// Direction of an interaction.
///
/// `Input` and `Output` are the two data-carrying directions. The remaining
/// variants appear only on synthetic error-marker interactions, where the
/// direction field carries the failure kind of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Data consumed by the target
    Input,
    /// Data produced by the target
    Output,
    /// Run exceeded its wall-clock budget
    Timeout,
    /// Replay produced different observable behavior
    Desync,
    /// Any other fault during tracing
    Error,
}

impl Direction {
    /// Whether this direction carries I/O data
    #[must_use]
    pub const fn is_io(self) -> bool {
        matches!(self, Self::Input | Self::Output)
    }
}

/// One observed read or write on a logical channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
    /// Logical endpoint name, e.g. `stdio`, `stderr`, `tcp:0`
    pub channel: String,
    /// Transfer direction
    pub direction: Direction,
    /// Raw payload; `None` means not yet known (blocking)
    #[serde(with = "crate::encoding::latin1_opt")]
    pub data: Option<Vec<u8>>,
    /// Basic-block counter at the moment of the syscall
    pub trace_index: usize,
}

impl Interaction {
    /// Create an input interaction with unknown data (a block point)
    #[must_use]
    pub fn pending_input(channel: impl Into<String>, trace_index: usize) -> Self {
        Self {
            channel: channel.into(),
            direction: Direction::Input,
            data: None,
            trace_index,
        }
    }

    /// Create a resolved interaction
    #[must_use]
    pub fn resolved(
        channel: impl Into<String>,
        direction: Direction,
        data: Vec<u8>,
        trace_index: usize,
    ) -> Self {
        Self {
            channel: channel.into(),
            direction,
            data: Some(data),
            trace_index,
        }
    }

    /// Create the synthetic error-marker interaction for a failed run
    #[must_use]
    pub fn error_marker(failure: Direction, trace_index: usize) -> Self {
        Self {
            channel: CHANNEL_ERROR.to_string(),
            direction: failure,
            data: Some(Vec::new()),
            trace_index,
        }
    }

    /// Whether the payload is still unknown
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.data.is_none()
    }

    /// Whether two interactions share the same `(channel, direction)` endpoint
    #[must_use]
    pub fn same_endpoint(&self, other: &Self) -> bool {
        self.channel == other.channel && self.direction == other.direction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_input() {
        let i = Interaction::pending_input(CHANNEL_STDIO, 12);
        assert!(i.is_pending());
        assert_eq!(i.direction, Direction::Input);
        assert_eq!(i.trace_index, 12);
    }

    #[test]
    fn test_same_endpoint() {
        let a = Interaction::resolved(CHANNEL_STDIO, Direction::Output, b"a".to_vec(), 1);
        let b = Interaction::resolved(CHANNEL_STDIO, Direction::Output, b"b".to_vec(), 2);
        let c = Interaction::resolved(CHANNEL_STDERR, Direction::Output, b"c".to_vec(), 3);
        assert!(a.same_endpoint(&b));
        assert!(!a.same_endpoint(&c));
    }

    #[test]
    fn test_direction_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Direction::Input).unwrap(), "\"input\"");
        assert_eq!(serde_json::to_string(&Direction::Desync).unwrap(), "\"desync\"");
        assert!(!Direction::Timeout.is_io());
    }

    #[test]
    fn test_null_data_round_trips() {
        let i = Interaction::pending_input(CHANNEL_STDIO, 0);
        let json = serde_json::to_string(&i).unwrap();
        assert!(json.contains("\"data\":null"));
        let back: Interaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, i);
    }

    #[test]
    fn test_binary_data_round_trips() {
        let i = Interaction::resolved(CHANNEL_STDIO, Direction::Output, vec![0, 159, 255], 3);
        let json = serde_json::to_string(&i).unwrap();
        let back: Interaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data.unwrap(), vec![0, 159, 255]);
    }

    #[test]
    fn test_tcp_channel_name() {
        assert_eq!(tcp_channel(0), "tcp:0");
        assert_eq!(tcp_channel(3), "tcp:3");
    }
}
