//! Sequential batch execution.
//!
//! The coordinator drives one batch over one session. Statements run strictly
//! in order. Before each statement the previous statement's result handle is
//! released, since a session cannot run a new statement while a cursor from
//! the last one is still open.
//!
//! Error policy:
//! - statement errors and timeouts are recorded and the batch continues
//! - a lost connection marks every remaining statement without running it
//! - cancellation stops the batch with a single trailing `Cancelled` entry

use super::aggregator::{aggregate, BatchReport};
use super::outcome::{ErrorKind, StatementOutcome};
use super::paginator::{HandleOptions, ResultHandle, DEFAULT_MAX_PAGE_SIZE};
use super::race::{race, Race};
use super::token::ExecutionToken;
use crate::config::ExecutionConfig;
use crate::db::{DriverResult, Session};
use crate::error::BatchError;
use crate::sql::{classify, StatementKind};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Settings that shape how results are read and reported.
#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    /// Rows loaded into each result's preview.
    pub page_size: usize,
    /// Upper bound on rows per page request.
    pub max_page_size: usize,
    /// Statements slower than this are logged as slow.
    pub slow_statement: Duration,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            slow_statement: Duration::from_millis(1000),
        }
    }
}

impl From<&ExecutionConfig> for ExecutionPolicy {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            page_size: config.page_size,
            max_page_size: config.max_page_size,
            slow_statement: config.slow_statement(),
        }
    }
}

/// Runs batches according to an [`ExecutionPolicy`].
#[derive(Debug, Clone, Default)]
pub struct Coordinator {
    policy: ExecutionPolicy,
}

impl Coordinator {
    pub fn new(policy: ExecutionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    /// Starts a batch whose outcomes are produced one at a time.
    ///
    /// The session is borrowed exclusively until the run is dropped.
    pub fn start<'s>(
        &self,
        token: ExecutionToken,
        session: &'s mut dyn Session,
    ) -> BatchRun<'s> {
        info!(
            batch = %token.batch_id,
            statements = token.statements.len(),
            "Starting batch"
        );
        BatchRun {
            token,
            session,
            policy: self.policy.clone(),
            next: 0,
            outcomes: Vec::new(),
            live: None,
            state: RunState::Running,
        }
    }

    /// Runs every statement and returns the report.
    pub async fn execute(
        &self,
        token: ExecutionToken,
        session: &mut dyn Session,
    ) -> BatchReport {
        self.start(token, session).finish().await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RunState {
    Running,
    Cancelled,
    ConnectionLost(String),
}

/// An in-progress batch.
pub struct BatchRun<'s> {
    token: ExecutionToken,
    session: &'s mut dyn Session,
    policy: ExecutionPolicy,
    next: usize,
    outcomes: Vec<StatementOutcome>,
    /// The latest result handle, still holding a cursor on the session.
    live: Option<ResultHandle>,
    state: RunState,
}

impl BatchRun<'_> {
    pub fn token(&self) -> &ExecutionToken {
        &self.token
    }

    /// Outcomes recorded so far.
    pub fn outcomes(&self) -> &[StatementOutcome] {
        &self.outcomes
    }

    /// Returns true once no further outcomes will be produced.
    pub fn is_finished(&self) -> bool {
        self.state == RunState::Cancelled || self.next >= self.token.statements.len()
    }

    /// The most recent result handle, while its cursor is still open.
    pub fn live_result(&self) -> Option<&ResultHandle> {
        self.live.as_ref()
    }

    /// Runs the next statement and returns its outcome.
    ///
    /// Returns `None` once every statement has an outcome or the batch was
    /// cancelled. Any result handle from the previous call is released first.
    pub async fn next_outcome(&mut self) -> Option<StatementOutcome> {
        self.release_live().await;

        if self.is_finished() {
            return None;
        }
        let index = self.next;
        let kind = classify(&self.token.statements[index]);

        if let RunState::ConnectionLost(message) = &self.state {
            let outcome = StatementOutcome::Failure {
                index,
                kind,
                error_kind: ErrorKind::ConnectionLost,
                message: message.clone(),
                elapsed: Duration::ZERO,
            };
            self.next += 1;
            return Some(self.record(outcome));
        }

        if self.token.cancel.is_cancelled() {
            info!(
                batch = %self.token.batch_id,
                statement = index + 1,
                "Batch cancelled before statement"
            );
            self.state = RunState::Cancelled;
            let outcome = StatementOutcome::Cancelled {
                index,
                elapsed: Duration::ZERO,
            };
            return Some(self.record(outcome));
        }

        let outcome = self.run_statement(index, kind).await;
        self.next += 1;
        Some(self.record(outcome))
    }

    /// Runs any remaining statements, releases every result and builds the report.
    pub async fn finish(mut self) -> BatchReport {
        while self.next_outcome().await.is_some() {}
        self.release_live().await;

        for handle in self.outcomes.iter().filter_map(StatementOutcome::result) {
            handle.release().await;
        }

        let report = aggregate(self.token.batch_id, std::mem::take(&mut self.outcomes));
        info!(
            batch = %self.token.batch_id,
            elapsed_ms = report.total_elapsed_ms(),
            "Batch finished: {}",
            report.summary()
        );
        report
    }

    async fn run_statement(&mut self, index: usize, kind: StatementKind) -> StatementOutcome {
        let sql = self.token.statements[index].text.clone();
        let timeout = self.token.statement_timeout;
        // Sessions that cannot interrupt a statement are cancelled between statements only.
        let cancel = self
            .session
            .supports_abort()
            .then(|| self.token.cancel.clone());

        debug!(
            batch = %self.token.batch_id,
            statement = index + 1,
            %kind,
            "Executing statement"
        );

        let started = Instant::now();
        let result = race(self.session.execute(&sql, kind), timeout, cancel.as_ref()).await;

        match result {
            Race::Completed(Ok(DriverResult::Affected(rows))) => StatementOutcome::Success {
                index,
                kind,
                rows_affected: Some(rows),
                result: None,
                elapsed: started.elapsed(),
            },
            Race::Completed(Ok(DriverResult::Rows { columns, cursor })) => {
                let handle = ResultHandle::new(
                    index,
                    columns,
                    cursor,
                    HandleOptions {
                        max_page_size: self.policy.max_page_size,
                        fetch_timeout: timeout,
                        cancel: Some(self.token.cancel.child_token()),
                    },
                );
                self.live = Some(handle.clone());

                match handle.load_preview(self.policy.page_size).await {
                    Ok(_) => StatementOutcome::Success {
                        index,
                        kind,
                        rows_affected: None,
                        result: Some(handle),
                        elapsed: started.elapsed(),
                    },
                    Err(e) => {
                        self.release_live().await;
                        self.failure(index, kind, e, started.elapsed())
                    }
                }
            }
            Race::Completed(Err(e)) => self.failure(index, kind, e, started.elapsed()),
            Race::TimedOut => self.on_timeout(index, kind, started).await,
            Race::Cancelled => {
                info!(
                    batch = %self.token.batch_id,
                    statement = index + 1,
                    "Batch cancelled during statement"
                );
                if let Err(e) = self.session.cancel().await {
                    warn!("Failed to cancel running statement: {}", e);
                }
                self.state = RunState::Cancelled;
                StatementOutcome::Cancelled {
                    index,
                    elapsed: started.elapsed(),
                }
            }
        }
    }

    async fn on_timeout(
        &mut self,
        index: usize,
        kind: StatementKind,
        started: Instant,
    ) -> StatementOutcome {
        let limit = self.token.statement_timeout.unwrap_or_default();
        warn!(
            batch = %self.token.batch_id,
            statement = index + 1,
            timeout_ms = limit.as_millis() as u64,
            "Statement timed out"
        );

        if self.session.supports_abort() {
            if let Err(e) = self.session.abort_current().await {
                warn!("Failed to abort timed out statement: {}", e);
            }
        }

        let error = match self.recover_session(limit).await {
            Ok(()) => BatchError::Timeout(limit),
            Err(e) => e,
        };
        self.failure(index, kind, error, started.elapsed())
    }

    /// Checks the session after an abort.
    ///
    /// The first round trip after an abort usually reports the aborted
    /// statement's own error, so one non-fatal failure is discarded before the
    /// session is judged.
    async fn recover_session(&mut self, limit: Duration) -> Result<(), BatchError> {
        let mut drained = false;
        loop {
            match race(self.session.ping(), Some(limit), None).await {
                Race::Completed(Ok(())) => return Ok(()),
                Race::Completed(Err(e)) if !drained && !e.is_fatal() => {
                    debug!("Discarding reply of aborted statement: {}", e);
                    drained = true;
                }
                Race::Completed(Err(e)) => {
                    return Err(BatchError::connection_lost(format!(
                        "session unusable after timeout: {e}"
                    )));
                }
                Race::TimedOut | Race::Cancelled => {
                    return Err(BatchError::connection_lost(
                        "session unresponsive after timeout",
                    ));
                }
            }
        }
    }

    fn failure(
        &mut self,
        index: usize,
        kind: StatementKind,
        error: BatchError,
        elapsed: Duration,
    ) -> StatementOutcome {
        if error == BatchError::Cancelled {
            self.state = RunState::Cancelled;
            return StatementOutcome::Cancelled { index, elapsed };
        }

        if error.is_fatal() {
            warn!(
                batch = %self.token.batch_id,
                statement = index + 1,
                "Connection lost, skipping remaining statements: {}",
                error
            );
            self.state = RunState::ConnectionLost(error.to_string());
        } else {
            debug!(
                batch = %self.token.batch_id,
                statement = index + 1,
                "Statement failed: {}",
                error
            );
        }

        StatementOutcome::Failure {
            index,
            kind,
            error_kind: error.kind(),
            message: error.to_string(),
            elapsed,
        }
    }

    fn record(&mut self, outcome: StatementOutcome) -> StatementOutcome {
        if outcome.is_slow(self.policy.slow_statement) {
            warn!(
                batch = %self.token.batch_id,
                statement = outcome.index() + 1,
                elapsed_ms = outcome.elapsed_ms(),
                "Slow statement"
            );
        }
        self.outcomes.push(outcome.clone());
        outcome
    }

    async fn release_live(&mut self) {
        if let Some(handle) = self.live.take() {
            handle.release().await;
        }
    }
}

impl Drop for BatchRun<'_> {
    fn drop(&mut self) {
        let Some(handle) = self.live.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { handle.release().await });
        }
    }
}
