//! Transaction state machine.

use std::fmt;

/// Lifecycle state of a transaction.
///
/// `Open` is the only non-terminal state. A transaction moves to
/// `Committed` or `Aborted` exactly once and never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// The transaction holds an engine handle and accepts operations.
    Open,
    /// The transaction was committed, directly or by an ancestor's commit.
    Committed,
    /// The transaction was aborted, dropped, or finished by an ancestor's
    /// abort. A failed engine commit also ends here.
    Aborted,
}

impl TransactionState {
    /// Returns true for `Committed` and `Aborted`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }

    /// Returns true for `Open`.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!TransactionState::Open.is_terminal());
        assert!(TransactionState::Committed.is_terminal());
        assert!(TransactionState::Aborted.is_terminal());
        assert!(TransactionState::Open.is_open());
    }

    #[test]
    fn display() {
        assert_eq!(TransactionState::Committed.to_string(), "committed");
    }
}
