//! Error types and Result alias.
//!
//! Failures carry a numeric result code in the style of SQLite's C API plus
//! an optional human-readable message. The code is part of the public
//! contract: callers dispatch on it (for example to tell a corrupt changeset
//! from a failed stream read).

use std::fmt;

/// Result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Generic error
    Error,
    /// Internal logic error
    Internal,
    /// Operation aborted by a conflict callback
    Abort,
    /// Connection is busy (open statements or locks outstanding)
    Busy,
    /// Disk I/O error
    IoErr,
    /// Read from a changeset input stream failed
    IoRead,
    /// Write to a changeset output stream failed
    IoWrite,
    /// Changeset or patchset data is malformed
    Corrupt,
    /// Row or table not found
    NotFound,
    /// Table schemas do not match
    Schema,
    /// Constraint violation
    Constraint,
    /// Datatype or column-count mismatch
    Mismatch,
    /// API misuse (bad call sequence or illegal argument)
    Misuse,
    /// Column index out of range
    Range,
}

/// Error with result code and optional message.
#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: Option<String>,
}

impl Error {
    /// Create an error with just a result code.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: None,
        }
    }

    /// Create an error with a code and message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// Wrap an I/O failure from a changeset stream, tagging the operation
    /// that hit it.
    pub fn io(code: ErrorCode, func: &str, err: std::io::Error) -> Self {
        Self::with_message(code, format!("{}: {}", func, err))
    }
}

/// Get the error string for a result code.
pub fn errstr(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::Error => "logic error",
        ErrorCode::Internal => "internal error",
        ErrorCode::Abort => "operation aborted",
        ErrorCode::Busy => "connection is busy",
        ErrorCode::IoErr => "disk I/O error",
        ErrorCode::IoRead => "changeset stream read error",
        ErrorCode::IoWrite => "changeset stream write error",
        ErrorCode::Corrupt => "changeset is malformed",
        ErrorCode::NotFound => "not found",
        ErrorCode::Schema => "table schemas do not match",
        ErrorCode::Constraint => "constraint failed",
        ErrorCode::Mismatch => "datatype mismatch",
        ErrorCode::Misuse => "bad parameter or other API misuse",
        ErrorCode::Range => "column index out of range",
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message {
            Some(ref msg) => write!(f, "{}: {}", errstr(self.code), msg),
            None => write!(f, "{}", errstr(self.code)),
        }
    }
}

impl std::error::Error for Error {}

/// Result type alias for changetrack operations.
pub type Result<T> = std::result::Result<T, Error>;
