//! Event dispatch table.
//!
//! Handlers are declared once at engine construction as an explicit table of
//! `(registration id, event kind, filter, action)`. Dispatch for an event
//! delivers to every matching handler in ascending registration-id order, not
//! first-match. Syscall-name filters are anchored at both ends.

use regex::Regex;
use std::collections::HashSet;
use tracery_core::{CoreError, CoreResult};
use tracery_substrate::SubstrateEvent;

/// Kind of substrate event a handler subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Syscall entry
    SyscallStart,
    /// Syscall exit
    SyscallFinish,
    /// Executed basic block
    ExecBlock,
}

/// Handler filter
#[derive(Debug, Clone)]
pub enum EventFilter {
    /// Full-string match over the syscall name
    Syscall(Regex),
    /// Every block address
    AllBlocks,
    /// An explicit address set
    Addresses(HashSet<u64>),
}

impl EventFilter {
    /// Build an anchored syscall-name filter from a pattern.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ParseError` for an invalid pattern.
    pub fn syscall(pattern: &str) -> CoreResult<Self> {
        let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|err| {
            CoreError::ParseError {
                message: format!("bad syscall filter {:?}: {}", pattern, err),
            }
        })?;
        Ok(Self::Syscall(regex))
    }

    fn matches_name(&self, name: &str) -> bool {
        matches!(self, Self::Syscall(regex) if regex.is_match(name))
    }

    fn matches_addr(&self, addr: u64) -> bool {
        match self {
            Self::AllBlocks => true,
            Self::Addresses(set) => set.contains(&addr),
            Self::Syscall(_) => false,
        }
    }
}

/// What a matched handler does; interpreted by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerAction {
    /// Replay-check or record a syscall entry
    RecordSyscallStart,
    /// Replay-check or record a syscall exit
    RecordSyscallFinish,
    /// Replay-check or record an executed block
    RecordBlock,
    /// Route a read entry through the channel router
    RouteReadStart,
    /// Route a write exit through the channel router
    RouteWriteFinish,
    /// Bind a socket fd to a `tcp:<n>` channel
    BindSocket,
    /// Propagate a channel binding across `dup*`
    PropagateDup,
    /// Retire an fd's channel binding on `close`
    RetireFd,
}

/// One registered handler
#[derive(Debug, Clone)]
pub struct Handler {
    /// Strictly increasing registration id; dispatch order
    pub id: usize,
    /// Event kind this handler receives
    pub kind: EventKind,
    /// Filter over syscall name or block address
    pub filter: EventFilter,
    /// Action taken on match
    pub action: HandlerAction,
}

/// Statically declared dispatch table
#[derive(Debug, Clone, Default)]
pub struct DispatchTable {
    handlers: Vec<Handler>,
}

impl DispatchTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; ids are assigned in registration order
    pub fn register(&mut self, kind: EventKind, filter: EventFilter, action: HandlerAction) {
        let id = self.handlers.len();
        self.handlers.push(Handler {
            id,
            kind,
            filter,
            action,
        });
    }

    /// Number of registered handlers
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Actions of every handler matching the event, in ascending id order
    #[must_use]
    pub fn actions_for(&self, event: &SubstrateEvent) -> Vec<HandlerAction> {
        self.handlers
            .iter()
            .filter(|handler| Self::matches(handler, event))
            .map(|handler| handler.action)
            .collect()
    }

    fn matches(handler: &Handler, event: &SubstrateEvent) -> bool {
        match event {
            SubstrateEvent::SyscallStart { name, .. } => {
                handler.kind == EventKind::SyscallStart && handler.filter.matches_name(name)
            }
            SubstrateEvent::SyscallFinish { name, .. } => {
                handler.kind == EventKind::SyscallFinish && handler.filter.matches_name(name)
            }
            SubstrateEvent::ExecBlock { addr } => {
                handler.kind == EventKind::ExecBlock && handler.filter.matches_addr(*addr)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(name: &str) -> SubstrateEvent {
        SubstrateEvent::SyscallStart {
            name: name.to_string(),
            args: Vec::new(),
        }
    }

    #[test]
    fn test_filter_is_anchored() {
        let filter = EventFilter::syscall("read").unwrap();
        assert!(filter.matches_name("read"));
        assert!(!filter.matches_name("pread64"));
        assert!(!filter.matches_name("readv"));
    }

    #[test]
    fn test_alternation_filter() {
        let filter = EventFilter::syscall("write|send|sendto").unwrap();
        assert!(filter.matches_name("send"));
        assert!(filter.matches_name("write"));
        assert!(!filter.matches_name("sendmsg2"));
    }

    #[test]
    fn test_every_match_in_registration_order() {
        let mut table = DispatchTable::new();
        table.register(
            EventKind::SyscallStart,
            EventFilter::syscall(".*").unwrap(),
            HandlerAction::RecordSyscallStart,
        );
        table.register(
            EventKind::SyscallStart,
            EventFilter::syscall("read").unwrap(),
            HandlerAction::RouteReadStart,
        );

        let actions = table.actions_for(&start("read"));
        assert_eq!(
            actions,
            vec![HandlerAction::RecordSyscallStart, HandlerAction::RouteReadStart]
        );

        let actions = table.actions_for(&start("open"));
        assert_eq!(actions, vec![HandlerAction::RecordSyscallStart]);
    }

    #[test]
    fn test_block_filters() {
        let mut table = DispatchTable::new();
        table.register(EventKind::ExecBlock, EventFilter::AllBlocks, HandlerAction::RecordBlock);
        table.register(
            EventKind::ExecBlock,
            EventFilter::Addresses(HashSet::from([0x1000])),
            HandlerAction::RouteReadStart,
        );

        let matched = table.actions_for(&SubstrateEvent::ExecBlock { addr: 0x1000 });
        assert_eq!(matched.len(), 2);
        let matched = table.actions_for(&SubstrateEvent::ExecBlock { addr: 0x2000 });
        assert_eq!(matched, vec![HandlerAction::RecordBlock]);
    }

    #[test]
    fn test_bad_filter_pattern() {
        assert!(EventFilter::syscall("read(").is_err());
    }
}
