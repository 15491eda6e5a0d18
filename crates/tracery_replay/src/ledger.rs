//! Tracing ledgers.
//!
//! A ledger holds one dimension of the trace (blocks, syscalls, or
//! interactions) plus a replay cursor. The previously recorded entries are
//! supplied at construction; the ledger is in replay mode while the cursor is
//! below that initial length and in extend mode once it reaches it.

/// One trace dimension with its replay cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger<T> {
    entries: Vec<T>,
    cursor: usize,
    initial_len: usize,
}

impl<T> Ledger<T> {
    /// Create a ledger over a previously recorded trace slice
    #[must_use]
    pub fn new(recorded: Vec<T>) -> Self {
        let initial_len = recorded.len();
        Self {
            entries: recorded,
            cursor: 0,
            initial_len,
        }
    }

    /// Whether the cursor is still inside the recorded prefix
    #[must_use]
    pub fn in_replay(&self) -> bool {
        self.cursor < self.initial_len
    }

    /// Current cursor position
    #[must_use]
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Length of the recorded prefix captured at construction
    #[must_use]
    pub fn initial_len(&self) -> usize {
        self.initial_len
    }

    /// Total entries (recorded plus extended)
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ledger holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry at the cursor, if any
    #[must_use]
    pub fn current(&self) -> Option<&T> {
        self.entries.get(self.cursor)
    }

    /// Mutable entry at the cursor, if any
    pub fn current_mut(&mut self) -> Option<&mut T> {
        self.entries.get_mut(self.cursor)
    }

    /// Append a fresh entry (extend mode); the cursor does not move
    pub fn push(&mut self, entry: T) {
        self.entries.push(entry);
    }

    /// Advance the cursor by one
    pub fn advance(&mut self) {
        self.cursor += 1;
    }

    /// Last entry, if any
    #[must_use]
    pub fn last(&self) -> Option<&T> {
        self.entries.last()
    }

    /// All entries in order
    #[must_use]
    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    /// Consume the ledger, returning its entries
    #[must_use]
    pub fn into_entries(self) -> Vec<T> {
        self.entries
    }
}
