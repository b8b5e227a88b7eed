//! Per-statement outcomes.

use super::paginator::ResultHandle;
use super::serialize_millis;
use crate::sql::StatementKind;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Why a statement failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    StatementSyntaxError,
    ConstraintViolation,
    Timeout,
    Cancelled,
    ConnectionLost,
    /// Any other error the database reported.
    Execution,
    /// A failure inside the pipeline itself.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::StatementSyntaxError => "syntax error",
            ErrorKind::ConstraintViolation => "constraint violation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ConnectionLost => "connection lost",
            ErrorKind::Execution => "execution error",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(label)
    }
}

/// The result of one statement in a batch.
///
/// `index` is the statement's position in the batch.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatementOutcome {
    Success {
        index: usize,
        kind: StatementKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        rows_affected: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<ResultHandle>,
        #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
        elapsed: Duration,
    },
    Failure {
        index: usize,
        kind: StatementKind,
        error_kind: ErrorKind,
        message: String,
        #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
        elapsed: Duration,
    },
    Cancelled {
        index: usize,
        #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
        elapsed: Duration,
    },
}

impl StatementOutcome {
    pub fn index(&self) -> usize {
        match self {
            Self::Success { index, .. }
            | Self::Failure { index, .. }
            | Self::Cancelled { index, .. } => *index,
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            Self::Success { elapsed, .. }
            | Self::Failure { elapsed, .. }
            | Self::Cancelled { elapsed, .. } => *elapsed,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns the failure kind, if the statement failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Failure { error_kind, .. } => Some(*error_kind),
            _ => None,
        }
    }

    /// Returns the result handle of a row-producing statement.
    pub fn result(&self) -> Option<&ResultHandle> {
        match self {
            Self::Success { result, .. } => result.as_ref(),
            _ => None,
        }
    }

    /// Returns true if the statement ran longer than `threshold`.
    pub fn is_slow(&self, threshold: Duration) -> bool {
        !self.is_cancelled() && self.elapsed() > threshold
    }
}
