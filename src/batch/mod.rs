//! Batch execution pipeline.
//!
//! A batch is the list of statements split from one block of SQL text. The
//! [`Coordinator`] runs them one at a time on a single [`Session`], racing
//! each statement against its timeout and the batch cancellation token.
//! Row-producing statements yield a [`ResultHandle`] that is paged on demand
//! and released before the next statement starts. The [`aggregate`]d
//! [`BatchReport`] summarizes the outcomes.
//!
//! [`Session`]: crate::db::Session

mod aggregator;
mod coordinator;
mod outcome;
mod paginator;
mod race;
mod token;

pub use aggregator::{aggregate, BatchReport};
pub use coordinator::{BatchRun, Coordinator, ExecutionPolicy};
pub use outcome::{ErrorKind, StatementOutcome};
pub use paginator::{HandleOptions, Page, PageStats, ResultHandle, DEFAULT_MAX_PAGE_SIZE};
pub use race::{race, Race};
pub use token::{BatchId, ExecutionToken, DEFAULT_STATEMENT_TIMEOUT};

use serde::Serializer;
use std::time::Duration;

fn serialize_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}
