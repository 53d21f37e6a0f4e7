//! Error types for the guardrail engine.
//!
//! Two layers live here: `GuardError` covers startup plumbing (config files,
//! opening the database) and `ClassifiedError` is the closed, caller-facing
//! taxonomy every guarded query failure is mapped into.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Error type for engine setup and internal plumbing.
#[derive(Error, Debug)]
pub enum GuardError {
    /// Database connection errors (file missing, unreachable, etc.)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Configuration errors (invalid config file, inconsistent limits, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal application errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GuardError {
    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection(_) => "Connection Error",
            Self::Config(_) => "Configuration Error",
            Self::Internal(_) => "Internal Error",
        }
    }
}

/// Result type alias using GuardError.
pub type Result<T> = std::result::Result<T, GuardError>;

/// The closed set of failure kinds a caller can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input had no recognizable statement.
    EmptyOrUnparseable,
    /// More than one statement segment was detected.
    MultipleStatements,
    /// Leading verb not whitelisted, or a denylisted token was found.
    DisallowedOperation,
    /// No connection became available within the acquire timeout.
    PoolExhausted,
    /// The statement did not complete within the statement timeout.
    Timeout,
    /// The database rejected an otherwise-accepted statement.
    ExecutionFailed,
}

impl ErrorKind {
    /// Fixed, non-leaking text shown to the caller for this kind.
    pub fn safe_message(&self) -> &'static str {
        match self {
            Self::EmptyOrUnparseable => "The request did not contain a recognizable SQL query.",
            Self::MultipleStatements => "Only a single SQL statement can be run at a time.",
            Self::DisallowedOperation => "Only read-only SELECT queries are allowed.",
            Self::PoolExhausted => "The database is busy. Please try again shortly.",
            Self::Timeout => "The query took too long and was stopped.",
            Self::ExecutionFailed => "The database could not run this query.",
        }
    }

    /// Stable machine-readable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyOrUnparseable => "empty_or_unparseable",
            Self::MultipleStatements => "multiple_statements",
            Self::DisallowedOperation => "disallowed_operation",
            Self::PoolExhausted => "pool_exhausted",
            Self::Timeout => "timeout",
            Self::ExecutionFailed => "execution_failed",
        }
    }

    /// Returns true for kinds decided before any database round-trip.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EmptyOrUnparseable | Self::MultipleStatements | Self::DisallowedOperation
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A guarded-query failure as seen by the caller.
///
/// Only ever carries the kind and its fixed message. Driver text, SQL
/// fragments and internal categories are logged, never stored here.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{message}")]
pub struct ClassifiedError {
    kind: ErrorKind,
    message: &'static str,
}

impl ClassifiedError {
    /// Creates a classified error carrying the kind's safe message.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: kind.safe_message(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &'static str {
        self.message
    }
}

impl From<ErrorKind> for ClassifiedError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}
