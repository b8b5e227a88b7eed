//! Batch report assembly.

use super::outcome::StatementOutcome;
use super::serialize_millis;
use super::token::BatchId;
use serde::Serialize;
use std::time::Duration;

/// The final report for one batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub outcomes: Vec<StatementOutcome>,
    pub success_count: usize,
    pub failure_count: usize,
    pub cancelled_count: usize,
    /// Sum of the statements' elapsed times.
    #[serde(rename = "total_elapsed_ms", serialize_with = "serialize_millis")]
    pub total_elapsed: Duration,
}

impl BatchReport {
    pub fn total_elapsed_ms(&self) -> u64 {
        self.total_elapsed.as_millis() as u64
    }

    /// Returns true if the batch stopped on a cancellation.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled_count > 0
    }

    /// Returns true if every statement succeeded.
    pub fn is_success(&self) -> bool {
        self.failure_count == 0 && self.cancelled_count == 0
    }

    /// One-line summary, e.g. "3 succeeded, 1 failed, 1 cancelled".
    pub fn summary(&self) -> String {
        format!(
            "{} succeeded, {} failed, {} cancelled",
            self.success_count, self.failure_count, self.cancelled_count
        )
    }
}

/// Collects outcomes into a report. Cancelled entries count as neither
/// success nor failure.
pub fn aggregate(batch_id: BatchId, outcomes: Vec<StatementOutcome>) -> BatchReport {
    let mut success_count = 0;
    let mut failure_count = 0;
    let mut cancelled_count = 0;
    let mut total_elapsed = Duration::ZERO;

    for outcome in &outcomes {
        match outcome {
            StatementOutcome::Success { .. } => success_count += 1,
            StatementOutcome::Failure { .. } => failure_count += 1,
            StatementOutcome::Cancelled { .. } => cancelled_count += 1,
        }
        total_elapsed += outcome.elapsed();
    }

    BatchReport {
        batch_id,
        outcomes,
        success_count,
        failure_count,
        cancelled_count,
        total_elapsed,
    }
}
