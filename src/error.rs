//! Error types for sqlbatch.
//!
//! Defines the main error enum used throughout the pipeline. Statement-level
//! errors never unwind a batch: the coordinator converts them into
//! [`StatementOutcome::Failure`](crate::batch::StatementOutcome) entries.

use std::time::Duration;

use thiserror::Error;

use crate::batch::ErrorKind;

/// Main error type for sqlbatch operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// Could not establish a connection (host unreachable, auth failed, etc.)
    #[error("Connection error: {0}")]
    Connection(String),

    /// The session died while a batch was using it.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The database rejected the statement text.
    #[error("Syntax error: {0}")]
    Syntax(String),

    /// The statement violated a constraint (unique, foreign key, check, ...).
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Any other database-reported execution error.
    #[error("Query error: {0}")]
    Query(String),

    /// The statement exceeded its time budget.
    #[error("Statement timed out after {} ms", .0.as_millis())]
    Timeout(Duration),

    /// The batch was cancelled by the caller.
    #[error("Cancelled")]
    Cancelled,

    /// A result handle was used after its cursor was released.
    #[error("Result handle released: {0}")]
    Released(String),

    /// Configuration errors (invalid config file, bad connection string, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BatchError {
    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a connection-lost error with the given message.
    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::ConnectionLost(msg.into())
    }

    /// Creates a syntax error with the given message.
    pub fn syntax(msg: impl Into<String>) -> Self {
        Self::Syntax(msg.into())
    }

    /// Creates a constraint violation with the given message.
    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::Constraint(msg.into())
    }

    /// Creates a query error with the given message.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Creates a released-handle error with the given message.
    pub fn released(msg: impl Into<String>) -> Self {
        Self::Released(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Maps the error onto the kind recorded in a statement outcome.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) | Self::ConnectionLost(_) => ErrorKind::ConnectionLost,
            Self::Syntax(_) => ErrorKind::StatementSyntaxError,
            Self::Constraint(_) => ErrorKind::ConstraintViolation,
            Self::Query(_) => ErrorKind::Execution,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Released(_) | Self::Config(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if the session can no longer be used.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::ConnectionLost
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection(_) => "Connection Error",
            Self::ConnectionLost(_) => "Connection Lost",
            Self::Syntax(_) => "Syntax Error",
            Self::Constraint(_) => "Constraint Violation",
            Self::Query(_) => "Query Error",
            Self::Timeout(_) => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::Released(_) => "Released Handle",
            Self::Config(_) => "Configuration Error",
            Self::Internal(_) => "Internal Error",
        }
    }
}

/// Result type alias using BatchError.
pub type Result<T> = std::result::Result<T, BatchError>;
