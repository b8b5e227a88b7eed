//! Result paging integration tests.
//!
//! Pages through live result handles while a batch is running and checks
//! that cursors never stay open once a batch ends.

use pretty_assertions::assert_eq;
use sqlbatch::batch::{Coordinator, ExecutionPolicy, ExecutionToken};
use sqlbatch::db::{MockBehavior, MockDatabase, Row, Value};
use sqlbatch::error::BatchError;
use sqlbatch::sql::Splitter;
use std::time::Duration;

fn token(sql: &str) -> ExecutionToken {
    ExecutionToken::from_sql(sql, &Splitter::new())
}

fn numbers(range: std::ops::RangeInclusive<i64>) -> Vec<Row> {
    range.map(|n| vec![Value::Int(n)]).collect()
}

#[tokio::test]
async fn test_disjoint_pages_cover_full_result() {
    let db = MockDatabase::new().with_numbers("numbers", 250);
    let mut session = db.session();
    let policy = ExecutionPolicy {
        page_size: 10,
        ..ExecutionPolicy::default()
    };
    let coordinator = Coordinator::new(policy);
    let mut run = coordinator.start(token("SELECT * FROM numbers"), &mut session);

    let outcome = run.next_outcome().await.unwrap();
    let handle = outcome.result().unwrap().clone();

    let mut collected = Vec::new();
    let mut offset = 0;
    loop {
        let page = handle.fetch_page(offset, 60).await.unwrap();
        assert_eq!(page.offset, offset);
        offset += page.len();
        collected.extend(page.rows);
        if !page.has_more {
            break;
        }
    }

    let full = handle.fetch_page(0, 250).await.unwrap();
    assert_eq!(collected, full.rows);
    assert_eq!(collected, numbers(1..=250));
    assert!(!full.has_more);
    assert_eq!(handle.total_rows(), Some(250));

    run.finish().await;
    assert_eq!(db.open_cursors(), 0);
}

#[tokio::test]
async fn test_fetch_never_exceeds_limit() {
    let db = MockDatabase::new().with_numbers("numbers", 5000);
    let mut session = db.session();
    let policy = ExecutionPolicy {
        page_size: 25,
        max_page_size: 100,
        ..ExecutionPolicy::default()
    };
    let coordinator = Coordinator::new(policy);
    let mut run = coordinator.start(token("SELECT * FROM numbers"), &mut session);

    let outcome = run.next_outcome().await.unwrap();
    let handle = outcome.result().unwrap().clone();
    assert_eq!(handle.preview().unwrap().len(), 25);

    let page = handle.fetch_page(4000, 10_000).await.unwrap();
    assert_eq!(page.len(), 100);
    assert_eq!(page.rows[0], vec![Value::Int(4001)]);
    assert!(db.max_fetch() <= 100);

    let stats = handle.stats();
    assert!(stats.rows_read < 4200);
    assert_eq!(stats.rows_returned, 125);

    run.finish().await;
}

#[tokio::test]
async fn test_page_numbers_walk_the_result() {
    let db = MockDatabase::new().with_numbers("numbers", 45);
    let mut session = db.session();
    let policy = ExecutionPolicy {
        page_size: 10,
        ..ExecutionPolicy::default()
    };
    let coordinator = Coordinator::new(policy);
    let mut run = coordinator.start(token("SELECT * FROM numbers"), &mut session);

    let outcome = run.next_outcome().await.unwrap();
    let handle = outcome.result().unwrap().clone();

    let second = handle.fetch_page_number(2, 20).await.unwrap();
    assert_eq!(second.rows, numbers(21..=40));
    assert!(second.has_more);

    let third = handle.fetch_page_number(3, 20).await.unwrap();
    assert_eq!(third.rows, numbers(41..=45));
    assert!(!third.has_more);

    // Going back rewinds the cursor.
    let first = handle.fetch_page_number(1, 20).await.unwrap();
    assert_eq!(first.rows, numbers(1..=20));

    run.finish().await;
}

#[tokio::test]
async fn test_released_handle_serves_preview_only() {
    let db = MockDatabase::new().with_numbers("numbers", 300);
    let mut session = db.session();
    let policy = ExecutionPolicy {
        page_size: 50,
        ..ExecutionPolicy::default()
    };

    let report = Coordinator::new(policy)
        .execute(token("SELECT * FROM numbers; SELECT 1"), &mut session)
        .await;
    let handle = report.outcomes[0].result().unwrap();
    assert!(handle.is_released());

    let page = handle.fetch_page(10, 20).await.unwrap();
    assert_eq!(page.rows, numbers(11..=30));

    let beyond = handle.fetch_page(60, 20).await;
    assert!(matches!(beyond, Err(BatchError::Released(_))));
}

#[tokio::test]
async fn test_no_cursor_leaks_on_any_path() {
    let db = MockDatabase::new()
        .with_numbers("numbers", 500)
        .on("boom", MockBehavior::Fail(BatchError::query("division by zero")));
    let mut session = db.session();
    let coordinator = Coordinator::default();

    // Success path.
    coordinator
        .execute(token("SELECT * FROM numbers; SELECT * FROM numbers"), &mut session)
        .await;
    assert_eq!(db.open_cursors(), 0);

    // Failure after a query.
    coordinator
        .execute(token("SELECT * FROM numbers; SELECT 'boom'"), &mut session)
        .await;
    assert_eq!(db.open_cursors(), 0);

    // Failure as the final statement with an earlier live handle.
    let mut run = coordinator.start(token("SELECT * FROM numbers; SELECT 'boom'"), &mut session);
    let first = run.next_outcome().await.unwrap();
    first.result().unwrap().fetch_page(100, 10).await.unwrap();
    run.finish().await;
    assert_eq!(db.open_cursors(), 0);

    // Cancellation with a live handle.
    let token = token("SELECT * FROM numbers; SELECT 2");
    let cancel = token.cancel_handle();
    let mut run = coordinator.start(token, &mut session);
    run.next_outcome().await.unwrap();
    assert_eq!(db.open_cursors(), 1);
    cancel.cancel();
    assert!(run.next_outcome().await.unwrap().is_cancelled());
    run.finish().await;
    assert_eq!(db.open_cursors(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_no_cursor_leak_on_timeout() {
    let db = MockDatabase::new()
        .with_numbers("numbers", 10)
        .on("pg_sleep", MockBehavior::Hang);
    let mut session = db.session();
    let token = token("SELECT * FROM numbers; SELECT pg_sleep(5); SELECT * FROM numbers")
        .with_timeout(Duration::from_millis(100));

    let report = Coordinator::default().execute(token, &mut session).await;
    assert_eq!(report.success_count, 2);
    assert_eq!(report.failure_count, 1);
    assert_eq!(db.open_cursors(), 0);
}

#[tokio::test]
async fn test_dropped_run_releases_live_handle() {
    let db = MockDatabase::new().with_numbers("numbers", 500);
    let mut session = db.session();
    let coordinator = Coordinator::default();

    let handle = {
        let mut run = coordinator.start(token("SELECT * FROM numbers"), &mut session);
        let outcome = run.next_outcome().await.unwrap();
        outcome.result().unwrap().clone()
    };

    // Release happens on a spawned task.
    for _ in 0..10 {
        if handle.is_released() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(handle.is_released());
    assert_eq!(db.open_cursors(), 0);
}
