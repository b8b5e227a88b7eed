//! Batch identity and the execution request handed to the coordinator.

use crate::sql::{Splitter, StatementSpan};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default per-statement timeout.
pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Unique identifier for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct BatchId(u64);

impl BatchId {
    /// Generates a new unique batch ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the inner u64 value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One batch execution request.
///
/// The caller keeps a clone of the cancellation token (see
/// [`ExecutionToken::cancel_handle`]) and may cancel at any point; the
/// coordinator only ever reads it.
#[derive(Debug, Clone)]
pub struct ExecutionToken {
    pub batch_id: BatchId,
    pub statements: Vec<StatementSpan>,
    pub cancel: CancellationToken,
    /// `None` disables the per-statement timeout.
    pub statement_timeout: Option<Duration>,
}

impl ExecutionToken {
    /// Creates a token for already-split statements with the default timeout.
    pub fn new(statements: Vec<StatementSpan>) -> Self {
        Self {
            batch_id: BatchId::new(),
            statements,
            cancel: CancellationToken::new(),
            statement_timeout: Some(DEFAULT_STATEMENT_TIMEOUT),
        }
    }

    /// Splits `sql` and creates a token for the resulting statements.
    pub fn from_sql(sql: &str, splitter: &Splitter) -> Self {
        Self::new(splitter.split(sql))
    }

    /// Sets the per-statement timeout. A zero duration disables it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Uses an externally owned cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns a handle the caller can use to cancel the batch.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns the number of statements in the batch.
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    /// Returns true if the batch has no statements.
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}
