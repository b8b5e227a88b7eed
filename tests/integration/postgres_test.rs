//! PostgreSQL batch integration tests.
//!
//! These tests require a running PostgreSQL database and are skipped unless
//! DATABASE_URL is set.

use sqlbatch::batch::{Coordinator, ErrorKind, ExecutionPolicy, ExecutionToken};
use sqlbatch::config::ConnectionConfig;
use sqlbatch::db::{PostgresSession, Session, Value};
use sqlbatch::sql::Splitter;
use std::time::Duration;

/// Helper to get test database URL from environment.
fn get_test_database_url() -> Option<String> {
    std::env::var("DATABASE_URL").ok()
}

/// Helper to create a test session.
async fn get_test_session() -> Option<PostgresSession> {
    let url = get_test_database_url()?;
    let config = ConnectionConfig::from_connection_string(&url).ok()?;
    PostgresSession::connect(&config).await.ok()
}

fn token(sql: &str) -> ExecutionToken {
    ExecutionToken::from_sql(sql, &Splitter::new())
}

/// Scenario: Mixed batch on a real server
/// Given a batch with a valid, an invalid and a valid statement
/// When the batch runs
/// Then two statements succeed and the syntax error is reported in place
#[tokio::test]
async fn test_mixed_batch() {
    let Some(mut session) = get_test_session().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let report = Coordinator::default()
        .execute(token("SELECT 1 AS one; SELEC 2; SELECT 3 AS three"), &mut session)
        .await;

    assert_eq!(report.success_count, 2);
    assert_eq!(report.failure_count, 1);
    assert_eq!(
        report.outcomes[1].error_kind(),
        Some(ErrorKind::StatementSyntaxError)
    );

    session.close().await.unwrap();
}

/// Scenario: Paging a server-side cursor
/// Given a query over generate_series
/// When two disjoint pages are fetched
/// Then their union equals one full fetch
#[tokio::test]
async fn test_cursor_pages() {
    let Some(mut session) = get_test_session().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let coordinator = Coordinator::new(ExecutionPolicy {
        page_size: 5,
        ..ExecutionPolicy::default()
    });
    let mut run = coordinator.start(
        token("SELECT n::bigint FROM generate_series(1, 40) AS n"),
        &mut session,
    );
    let handle = run.next_outcome().await.unwrap().result().unwrap().clone();

    let first = handle.fetch_page(0, 20).await.unwrap();
    let second = handle.fetch_page(20, 20).await.unwrap();
    let full = handle.fetch_page(0, 40).await.unwrap();

    let mut union = first.rows;
    union.extend(second.rows);
    assert_eq!(union, full.rows);
    assert_eq!(full.rows[39], vec![Value::Int(40)]);
    assert!(!second.has_more);

    run.finish().await;
    assert!(handle.is_released());
    session.close().await.unwrap();
}

/// Scenario: Statement timeout
/// Given a statement that sleeps longer than the timeout
/// When the batch runs
/// Then the statement fails with Timeout and the next statement still runs
#[tokio::test]
async fn test_timeout_aborts_statement() {
    let Some(mut session) = get_test_session().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let token = token(
        "SELECT generate_series(1, 500); SELECT pg_sleep(5); SELECT 2 AS two; SELECT 3",
    )
    .with_timeout(Duration::from_millis(300));
    let report = Coordinator::default().execute(token, &mut session).await;

    let kinds: Vec<_> = report.outcomes.iter().map(|o| o.error_kind()).collect();
    assert_eq!(kinds, vec![None, Some(ErrorKind::Timeout), None, None]);
    let two = report.outcomes[2].result().unwrap().preview().unwrap();
    assert_eq!(two.rows, vec![vec![Value::Int(2)]]);

    session.close().await.unwrap();
}

/// Scenario: Mutations inside a transaction
/// Given a temporary table
/// When rows are inserted and updated
/// Then affected-row counts are reported
#[tokio::test]
async fn test_mutation_counts() {
    let Some(mut session) = get_test_session().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let report = Coordinator::default()
        .execute(
            token(
                "CREATE TEMP TABLE sqlbatch_t (id int PRIMARY KEY);
                 INSERT INTO sqlbatch_t VALUES (1), (2), (3);
                 INSERT INTO sqlbatch_t VALUES (1);
                 UPDATE sqlbatch_t SET id = id + 10;
                 DROP TABLE sqlbatch_t;",
            ),
            &mut session,
        )
        .await;

    let affected: Vec<Option<u64>> = report
        .outcomes
        .iter()
        .map(|o| match o {
            sqlbatch::batch::StatementOutcome::Success { rows_affected, .. } => *rows_affected,
            _ => None,
        })
        .collect();
    assert_eq!(affected, vec![Some(0), Some(3), None, Some(3), Some(0)]);
    assert_eq!(
        report.outcomes[2].error_kind(),
        Some(ErrorKind::ConstraintViolation)
    );

    session.close().await.unwrap();
}

/// Scenario: Queries a hold cursor cannot carry
/// Given row-locking, data-modifying and SELECT INTO queries
/// When the batch runs
/// Then each statement succeeds and its rows are still returned
#[tokio::test]
async fn test_queries_read_without_cursor() {
    let Some(mut session) = get_test_session().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let report = Coordinator::default()
        .execute(
            token(
                "CREATE TEMP TABLE sqlbatch_locks (id int);
                 SELECT * FROM sqlbatch_locks FOR UPDATE;
                 WITH ins AS (INSERT INTO sqlbatch_locks VALUES (7) RETURNING id) SELECT * FROM ins;
                 SELECT id INTO TEMP sqlbatch_copy FROM sqlbatch_locks;
                 SELECT * FROM sqlbatch_copy FOR SHARE;",
            ),
            &mut session,
        )
        .await;

    assert_eq!(report.success_count, 5, "{}", report.summary());
    let returned = report.outcomes[2].result().unwrap().preview().unwrap();
    assert_eq!(returned.rows, vec![vec![Value::Int(7)]]);
    let copied = report.outcomes[4].result().unwrap().preview().unwrap();
    assert_eq!(copied.rows, vec![vec![Value::Int(7)]]);

    session.close().await.unwrap();
}
