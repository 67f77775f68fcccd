//! Error types for engine operations.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine status codes.
///
/// A missing key is not an error code: lookups report it as `None`.
/// `NotFound` is only returned where absence is a failure, such as opening
/// a table that does not exist without `create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Key/data pair already exists.
    KeyExist,
    /// Requested item was not found.
    NotFound,
    /// Located page or file contents were corrupted.
    Corrupted,
    /// Data file was written by an incompatible format version.
    VersionMismatch,
    /// File is not a valid data file.
    Invalid,
    /// Environment map size reached.
    MapFull,
    /// Environment table limit reached.
    DbsFull,
    /// Environment reader limit reached.
    ReadersFull,
    /// Map size was changed by another user; adopt it and retry.
    MapResized,
    /// Table was opened with flags incompatible with its stored flags.
    Incompatible,
    /// Transaction handle is invalid or must be reset.
    BadTxn,
    /// Key or value has an unsupported size.
    BadValSize,
    /// Table handle was closed or is unknown to this transaction.
    BadDbi,
    /// Invalid argument or combination of options.
    InvalidArgument,
    /// Write attempted through a read-only transaction or environment.
    Access,
    /// Resource is locked or busy.
    Busy,
    /// Wait for a resource was interrupted.
    Interrupted,
    /// Operating system I/O failure.
    Io,
}

impl ErrorCode {
    /// Returns the human readable description of the code.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::KeyExist => "key/data pair already exists",
            Self::NotFound => "no matching key/data pair found",
            Self::Corrupted => "located page was wrong type",
            Self::VersionMismatch => "database environment version mismatch",
            Self::Invalid => "file is not an lmkv data file",
            Self::MapFull => "environment mapsize limit reached",
            Self::DbsFull => "environment maxdbs limit reached",
            Self::ReadersFull => "environment maxreaders limit reached",
            Self::MapResized => "database contents grew beyond environment mapsize",
            Self::Incompatible => "operation and database incompatible",
            Self::BadTxn => "transaction must abort, has a child, or is invalid",
            Self::BadValSize => "unsupported size of key/DB name/data, or wrong DUPFIXED size",
            Self::BadDbi => "the specified DBI handle was closed/changed unexpectedly",
            Self::InvalidArgument => "invalid argument",
            Self::Access => "permission denied",
            Self::Busy => "resource busy",
            Self::Interrupted => "interrupted",
            Self::Io => "input/output error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// An engine failure: a status code plus context.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct EngineError {
    code: ErrorCode,
    message: String,
    #[source]
    source: Option<io::Error>,
}

impl EngineError {
    /// Creates an error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Returns the status code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Returns the context message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Creates a `KeyExist` error.
    pub fn key_exist(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::KeyExist, message)
    }

    /// Creates a `NotFound` error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// Creates a `BadTxn` error.
    pub fn bad_txn(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadTxn, message)
    }

    /// Creates a `BadDbi` error.
    pub fn bad_dbi(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadDbi, message)
    }

    /// Creates an `InvalidArgument` error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    /// Creates an `Access` error.
    pub fn access(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Access, message)
    }

    /// Creates a `Corrupted` error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Corrupted, message)
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::NotFound => ErrorCode::NotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::Access,
            io::ErrorKind::WouldBlock => ErrorCode::Busy,
            io::ErrorKind::Interrupted => ErrorCode::Interrupted,
            io::ErrorKind::InvalidInput => ErrorCode::InvalidArgument,
            _ => ErrorCode::Io,
        };
        Self {
            code,
            message: err.to_string(),
            source: Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_message() {
        let err = EngineError::new(ErrorCode::DbsFull, "opening table 'b'");
        assert_eq!(
            err.to_string(),
            "environment maxdbs limit reached: opening table 'b'"
        );
    }

    #[test]
    fn io_kinds_map_to_codes() {
        let err: EngineError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.code(), ErrorCode::NotFound);

        let err: EngineError = io::Error::new(io::ErrorKind::WouldBlock, "locked").into();
        assert_eq!(err.code(), ErrorCode::Busy);

        let err: EngineError = io::Error::new(io::ErrorKind::Other, "disk").into();
        assert_eq!(err.code(), ErrorCode::Io);
    }
}
