//! Cancellation integration tests.

use sqlbatch::batch::{Coordinator, ExecutionPolicy, ExecutionToken, StatementOutcome};
use sqlbatch::db::{MockBehavior, MockDatabase};
use sqlbatch::error::BatchError;
use sqlbatch::sql::Splitter;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn token(sql: &str) -> ExecutionToken {
    ExecutionToken::from_sql(sql, &Splitter::new())
}

#[tokio::test]
async fn test_cancel_before_second_statement() {
    let db = MockDatabase::new();
    let mut session = db.session();
    let coordinator = Coordinator::default();
    let token = token("SELECT 1; SELECT 2; SELECT 3");
    let cancel = token.cancel_handle();
    let mut run = coordinator.start(token, &mut session);

    assert!(run.next_outcome().await.unwrap().is_success());
    cancel.cancel();
    let report = run.finish().await;

    assert_eq!(report.outcomes.len(), 2);
    assert!(report.outcomes[0].is_success());
    assert!(matches!(
        report.outcomes[1],
        StatementOutcome::Cancelled { index: 1, .. }
    ));
    assert_eq!(report.success_count, 1);
    assert_eq!(report.failure_count, 0);
    assert_eq!(report.cancelled_count, 1);
    assert_eq!(db.executed(), vec!["SELECT 1"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_statement_aborts() {
    let db = MockDatabase::new().on("pg_sleep", MockBehavior::Hang);
    let mut session = db.session();
    let cancel = CancellationToken::new();
    let token = token("SELECT 1; SELECT pg_sleep(60); SELECT 3").with_cancel(cancel.clone());

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });

    let report = Coordinator::default().execute(token, &mut session).await;

    assert_eq!(report.outcomes.len(), 2);
    assert!(report.outcomes[1].is_cancelled());
    assert!(report.outcomes[1].elapsed() >= Duration::from_millis(200));
    assert_eq!(db.cancels(), 1);
    assert_eq!(db.executed().len(), 2);
    assert_eq!(report.summary(), "1 succeeded, 0 failed, 1 cancelled");
}

#[tokio::test(start_paused = true)]
async fn test_cooperative_cancel_waits_for_statement() {
    let db = MockDatabase::new()
        .on("pg_sleep", MockBehavior::Delay(Duration::from_secs(2)))
        .non_abortable();
    let mut session = db.session();
    let cancel = CancellationToken::new();
    let token = token("SELECT pg_sleep(2); SELECT 2").with_cancel(cancel.clone());

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let report = Coordinator::default().execute(token, &mut session).await;

    // The running statement finishes; the next one never starts.
    assert_eq!(report.outcomes.len(), 2);
    assert!(report.outcomes[0].is_success());
    assert!(report.outcomes[0].elapsed() >= Duration::from_secs(2));
    assert!(report.outcomes[1].is_cancelled());
    assert_eq!(db.executed().len(), 1);
    assert_eq!(db.aborts(), 0);
}

#[tokio::test]
async fn test_cancel_interrupts_page_fetch() {
    let db = MockDatabase::new().with_numbers("numbers", 50);
    let mut session = db.session();
    let coordinator = Coordinator::new(ExecutionPolicy {
        page_size: 5,
        ..ExecutionPolicy::default()
    });
    let token = token("SELECT * FROM numbers; SELECT 2");
    let cancel = token.cancel_handle();
    let mut run = coordinator.start(token, &mut session);

    let handle = run.next_outcome().await.unwrap().result().unwrap().clone();
    cancel.cancel();

    // Outside the preview, so the fetch needs the cursor.
    let result = handle.fetch_page(5, 10).await;
    assert_eq!(result, Err(BatchError::Cancelled));
    assert!(handle.is_released());
    assert_eq!(db.open_cursors(), 0);

    assert!(run.next_outcome().await.unwrap().is_cancelled());
    run.finish().await;
    assert_eq!(db.open_cursors(), 0);
}

#[tokio::test]
async fn test_independent_batches_do_not_share_cancellation() {
    let db = MockDatabase::new();
    let mut first_session = db.session();
    let mut second_session = db.session();
    let coordinator = Coordinator::default();

    let first = token("SELECT 1; SELECT 2");
    let second = token("SELECT 3; SELECT 4");
    first.cancel_handle().cancel();

    let first_report = coordinator.execute(first, &mut first_session).await;
    let second_report = coordinator.execute(second, &mut second_session).await;

    assert!(first_report.was_cancelled());
    assert_eq!(second_report.success_count, 2);
}
