//! Error types for lmkv core.

use lmkv_engine::{EngineError, ErrorCode};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in lmkv core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The engine reported a failure.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// The environment has been closed.
    #[error("environment is closed")]
    EnvironmentClosed,

    /// The environment cannot be closed while transactions are open.
    #[error("environment has {open_transactions} open transaction(s)")]
    EnvironmentBusy {
        /// Number of transactions still open.
        open_transactions: usize,
    },

    /// The transaction was already committed or aborted.
    #[error("transaction is terminated")]
    TransactionTerminated,

    /// The transaction is not the innermost active transaction of its thread.
    #[error("transaction is not active")]
    TransactionNotActive,

    /// The transaction belongs to another thread.
    #[error("transaction belongs to another thread")]
    WrongThread,

    /// The operation needs an active transaction and there is none.
    #[error("no active transaction")]
    NoActiveTransaction,

    /// The database handle was dropped.
    #[error("database is closed")]
    DatabaseClosed,

    /// The cursor was closed, explicitly or by the end of its transaction.
    #[error("cursor is closed")]
    CursorClosed,

    /// Unrecognized configuration option.
    #[error("invalid option: {name}")]
    InvalidOption {
        /// The rejected option name.
        name: String,
    },

    /// A configuration option was given a value it cannot take.
    #[error("invalid value {value:?} for option {name}")]
    InvalidOptionValue {
        /// The option name.
        name: String,
        /// The rejected value.
        value: String,
    },

    /// Waiting for the writer slot was interrupted.
    #[error("interrupted while waiting for the writer slot")]
    Interrupted,

    /// Handles from two different environments were combined.
    #[error("handle belongs to a different environment")]
    EnvironmentMismatch,
}

impl CoreError {
    /// Creates an invalid option error.
    pub fn invalid_option(name: impl Into<String>) -> Self {
        Self::InvalidOption { name: name.into() }
    }

    /// Creates an invalid option value error.
    pub fn invalid_option_value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidOptionValue {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Returns the engine status code, if this is an engine error.
    #[must_use]
    pub fn engine_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Engine(err) => Some(err.code()),
            _ => None,
        }
    }

    /// Returns true if the engine reported `NotFound`.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.engine_code() == Some(ErrorCode::NotFound)
    }
}
