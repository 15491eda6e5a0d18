//! TRACERY replay-extend engine.
//!
//! The engine consumes the substrate's ordered event stream while holding
//! three tracing ledgers (basic blocks, syscalls, interactions), each with an
//! independent replay cursor. While a cursor is below the previously recorded
//! length the engine is in replay mode and every observation must match the
//! record exactly; past it, observations are appended fresh. A read on a
//! channel with no known data suspends the run (`Block`); a replay mismatch
//! is fatal to the run (`Desync`).

#![warn(clippy::all)]

pub mod channel;
pub mod dispatch;
pub mod engine;
pub mod ledger;

pub use channel::ChannelRouter;
pub use dispatch::{DispatchTable, EventFilter, EventKind, HandlerAction};
pub use engine::ReplayEngine;
pub use ledger::Ledger;

use serde::{Deserialize, Serialize};
use tracery_core::CoreError;

/// Replay/observation mismatch: replaying previously accepted history
/// produced different observable behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("desync in {what}: expected {expected}, received {received}")]
pub struct Desync {
    /// The recorded value
    pub expected: String,
    /// The freshly observed value
    pub received: String,
    /// Which check failed
    pub what: String,
}

/// Where a run suspended waiting for external input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPoint {
    /// Channel awaiting data
    pub channel: String,
    /// Syscall the target is suspended in
    pub syscall: String,
    /// Syscall arguments
    pub args: Vec<String>,
    /// Trace index at the suspension point
    pub trace_index: usize,
}

/// Early exit from the run loop
#[derive(Debug)]
pub enum Fault {
    /// Expected suspension awaiting external data; recoverable
    Block(BlockPoint),
    /// Fatal replay mismatch
    Desync(Desync),
    /// Any other fault during tracing
    Error(CoreError),
}

impl From<CoreError> for Fault {
    fn from(err: CoreError) -> Self {
        Self::Error(err)
    }
}

/// Outcome of one tracing run.
///
/// `TimedOut` is produced by the caller that owns the wall-clock budget; the
/// engine itself yields the other four.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Target ran to completion
    Completed,
    /// Target is suspended awaiting external input
    Blocked(BlockPoint),
    /// Replay produced different observable behavior
    Desynced(Desync),
    /// Wall-clock budget exceeded
    TimedOut,
    /// Any other fault
    Errored(String),
}

impl RunOutcome {
    /// Short tag used in result channel names
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Completed => "finished",
            Self::Blocked(_) => "blocked",
            Self::Desynced(_) => "desync",
            Self::TimedOut => "timeout",
            Self::Errored(_) => "error",
        }
    }

    /// Diagnostic text for failed runs
    #[must_use]
    pub fn annotation(&self) -> Option<String> {
        match self {
            Self::Desynced(desync) => Some(desync.to_string()),
            Self::Errored(message) => Some(message.clone()),
            _ => None,
        }
    }
}
