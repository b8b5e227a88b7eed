//! Database abstraction layer.
//!
//! The pipeline talks to a database through the [`Session`] trait: one live
//! session executes one statement at a time and hands back a [`DriverResult`].
//! Row-producing statements return a [`RowCursor`] so rows are pulled on
//! demand instead of being materialized up front.

mod buffered;
mod mock;
mod postgres;
mod types;

pub use buffered::BufferedCursor;
pub use mock::{MockBehavior, MockDatabase, MockSession};
pub use postgres::PostgresSession;
pub use types::{ColumnInfo, Row, Value};

use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::sql::StatementKind;
use async_trait::async_trait;

/// What the driver reports after running one statement.
pub enum DriverResult {
    /// The statement produced a row set, readable through the cursor.
    Rows {
        columns: Vec<ColumnInfo>,
        cursor: Box<dyn RowCursor>,
    },
    /// The statement reported an affected-row count.
    Affected(u64),
}

impl std::fmt::Debug for DriverResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rows { columns, .. } => f
                .debug_struct("Rows")
                .field("columns", columns)
                .finish_non_exhaustive(),
            Self::Affected(n) => f.debug_tuple("Affected").field(n).finish(),
        }
    }
}

/// A forward-reading cursor over one statement's rows.
///
/// Cursors hold server-side state on the session that produced them and must
/// be closed before that session runs another statement.
#[async_trait]
pub trait RowCursor: Send {
    /// Reads up to `max` rows (`max >= 1`). An empty vector means the cursor is exhausted.
    async fn fetch(&mut self, max: usize) -> Result<Vec<Row>>;

    /// Advances past up to `n` rows without returning them. Returns how many were skipped.
    async fn skip(&mut self, n: usize) -> Result<usize> {
        let mut skipped = 0;
        while skipped < n {
            let chunk = self.fetch((n - skipped).min(SKIP_CHUNK)).await?;
            if chunk.is_empty() {
                break;
            }
            skipped += chunk.len();
        }
        Ok(skipped)
    }

    /// Repositions the cursor before the first row.
    async fn rewind(&mut self) -> Result<()>;

    /// Returns true if the driver stopped reading before the end of the result.
    fn is_truncated(&self) -> bool {
        false
    }

    /// Releases the cursor's server-side resources.
    async fn close(&mut self) -> Result<()>;
}

/// Rows read per round trip when skipping on a cursor that cannot move.
const SKIP_CHUNK: usize = 256;

/// One exclusive database session.
///
/// All operations are async and return Results with BatchError.
#[async_trait]
pub trait Session: Send {
    /// Executes a single statement.
    ///
    /// `kind` lets the driver choose how to read the result; it never changes
    /// what the statement does.
    async fn execute(&mut self, sql: &str, kind: StatementKind) -> Result<DriverResult>;

    /// Returns true if [`Session::abort_current`] can interrupt a running statement.
    fn supports_abort(&self) -> bool {
        false
    }

    /// Asks the server to stop the statement currently running on this session.
    async fn abort_current(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once when a batch using this session is cancelled.
    async fn cancel(&mut self) -> Result<()> {
        self.abort_current().await
    }

    /// Checks that the session is still usable.
    async fn ping(&mut self) -> Result<()>;

    /// Closes the session.
    async fn close(&mut self) -> Result<()>;
}

/// Opens a session for the given connection configuration.
pub async fn connect(config: &ConnectionConfig) -> Result<Box<dyn Session>> {
    let session = PostgresSession::connect(config).await?;
    Ok(Box::new(session))
}
