//! Batch execution integration tests.
//!
//! Runs whole batches through the coordinator against the mock database.

use pretty_assertions::assert_eq;
use sqlbatch::batch::{
    Coordinator, ErrorKind, ExecutionPolicy, ExecutionToken, StatementOutcome,
};
use sqlbatch::db::{MockBehavior, MockDatabase};
use sqlbatch::error::BatchError;
use sqlbatch::sql::{Splitter, StatementKind};
use std::time::Duration;

fn token(sql: &str) -> ExecutionToken {
    ExecutionToken::from_sql(sql, &Splitter::new())
}

#[tokio::test]
async fn test_failure_does_not_stop_batch() {
    let db = MockDatabase::new().with_numbers("numbers", 3);
    let mut session = db.session();

    let report = Coordinator::default()
        .execute(
            token("SELECT * FROM numbers; SELEC broken; SELECT 2;"),
            &mut session,
        )
        .await;

    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.success_count, 2);
    assert_eq!(report.failure_count, 1);
    let indexes: Vec<usize> = report.outcomes.iter().map(|o| o.index()).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
    assert_eq!(
        report.outcomes[1].error_kind(),
        Some(ErrorKind::StatementSyntaxError)
    );
    assert_eq!(report.summary(), "2 succeeded, 1 failed, 0 cancelled");
}

#[tokio::test]
async fn test_statements_run_in_order() {
    let db = MockDatabase::new();
    let mut session = db.session();

    let report = Coordinator::default()
        .execute(
            token(
                "CREATE TABLE accounts (id int, owner text);\n\
                 INSERT INTO accounts VALUES (1, 'a');\n\
                 SELECT * FROM accounts;",
            ),
            &mut session,
        )
        .await;

    assert_eq!(report.success_count, 3);
    assert_eq!(
        db.executed(),
        vec![
            "CREATE TABLE accounts (id int, owner text)",
            "INSERT INTO accounts VALUES (1, 'a')",
            "SELECT * FROM accounts",
        ]
    );

    let handle = report.outcomes[2].result().unwrap();
    let names: Vec<&str> = handle.columns().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["id", "owner"]);
}

#[tokio::test]
async fn test_outcome_shapes_follow_kind() {
    let db = MockDatabase::new().with_numbers("numbers", 4);
    let mut session = db.session();

    let report = Coordinator::default()
        .execute(
            token("UPDATE numbers SET n = n + 1; SELECT * FROM numbers; DROP TABLE numbers"),
            &mut session,
        )
        .await;

    match &report.outcomes[0] {
        StatementOutcome::Success {
            kind,
            rows_affected,
            result,
            ..
        } => {
            assert_eq!(*kind, StatementKind::Mutation);
            assert_eq!(*rows_affected, Some(4));
            assert!(result.is_none());
        }
        other => panic!("Expected success, got {:?}", other),
    }

    match &report.outcomes[1] {
        StatementOutcome::Success {
            kind,
            rows_affected,
            result,
            ..
        } => {
            assert_eq!(*kind, StatementKind::Query);
            assert_eq!(*rows_affected, None);
            assert_eq!(result.as_ref().unwrap().total_rows(), Some(4));
        }
        other => panic!("Expected success, got {:?}", other),
    }

    match &report.outcomes[2] {
        StatementOutcome::Success { kind, .. } => assert_eq!(*kind, StatementKind::SchemaChange),
        other => panic!("Expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn test_constraint_violation_kind() {
    let db = MockDatabase::new().with_numbers("numbers", 1).on(
        "VALUES (1)",
        MockBehavior::Fail(BatchError::constraint(
            "duplicate key value violates unique constraint",
        )),
    );
    let mut session = db.session();

    let report = Coordinator::default()
        .execute(
            token("INSERT INTO numbers VALUES (1); INSERT INTO numbers VALUES (2)"),
            &mut session,
        )
        .await;

    assert_eq!(
        report.outcomes[0].error_kind(),
        Some(ErrorKind::ConstraintViolation)
    );
    assert!(report.outcomes[1].is_success());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_per_statement() {
    let db = MockDatabase::new()
        .on("pg_sleep(10)", MockBehavior::Hang)
        .on("pg_sleep(0.01)", MockBehavior::Delay(Duration::from_millis(10)));
    let mut session = db.session();
    let token = token("SELECT pg_sleep(10); SELECT pg_sleep(0.01); SELECT 3")
        .with_timeout(Duration::from_millis(500));

    let report = Coordinator::default().execute(token, &mut session).await;

    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.outcomes[0].error_kind(), Some(ErrorKind::Timeout));
    assert!(report.outcomes[0].elapsed() >= Duration::from_millis(500));
    assert!(report.outcomes[1].is_success());
    assert!(report.outcomes[2].is_success());
    assert_eq!(db.aborts(), 1);
    assert!(db.is_alive());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_keeps_healthy_session() {
    let db = MockDatabase::new()
        .with_numbers("numbers", 500)
        .on("pg_sleep", MockBehavior::Hang);
    let mut session = db.session();
    let token = token("SELECT * FROM numbers; SELECT pg_sleep(5); SELECT 2; SELECT 3")
        .with_timeout(Duration::from_millis(300));

    let report = Coordinator::default().execute(token, &mut session).await;

    let kinds: Vec<_> = report.outcomes.iter().map(|o| o.error_kind()).collect();
    assert_eq!(kinds, vec![None, Some(ErrorKind::Timeout), None, None]);
    assert_eq!(report.summary(), "3 succeeded, 1 failed, 0 cancelled");
    assert_eq!(db.executed().len(), 4);
    assert_eq!(db.open_cursors(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_disabled() {
    let db = MockDatabase::new().on("pg_sleep", MockBehavior::Delay(Duration::from_secs(120)));
    let mut session = db.session();
    let token = token("SELECT pg_sleep(120)").with_timeout(Duration::ZERO);

    let report = Coordinator::default().execute(token, &mut session).await;
    assert_eq!(report.success_count, 1);
}

#[tokio::test]
async fn test_connection_lost_marks_remaining() {
    let db = MockDatabase::new().on("crash", MockBehavior::DropConnection);
    let mut session = db.session();

    let report = Coordinator::default()
        .execute(
            token("SELECT 1; SELECT 'crash'; SELECT 3; DELETE FROM t"),
            &mut session,
        )
        .await;

    assert_eq!(report.outcomes.len(), 4);
    assert!(report.outcomes[0].is_success());
    for outcome in &report.outcomes[1..] {
        assert_eq!(outcome.error_kind(), Some(ErrorKind::ConnectionLost));
    }
    assert_eq!(report.failure_count, 3);
    // Only the statements up to the crash reached the session.
    assert_eq!(db.executed().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_statement_flag() {
    let db = MockDatabase::new().on("pg_sleep", MockBehavior::Delay(Duration::from_secs(2)));
    let mut session = db.session();
    let policy = ExecutionPolicy {
        slow_statement: Duration::from_secs(1),
        ..ExecutionPolicy::default()
    };
    let threshold = policy.slow_statement;

    let report = Coordinator::new(policy)
        .execute(token("SELECT pg_sleep(2); SELECT 1"), &mut session)
        .await;

    assert_eq!(report.success_count, 2);
    assert!(report.outcomes[0].is_slow(threshold));
    assert!(!report.outcomes[1].is_slow(threshold));
}

#[tokio::test]
async fn test_incremental_outcomes() {
    let db = MockDatabase::new();
    let mut session = db.session();
    let coordinator = Coordinator::default();
    let mut run = coordinator.start(token("SELECT 1; SELECT 2"), &mut session);

    let first = run.next_outcome().await.unwrap();
    assert_eq!(first.index(), 0);
    assert_eq!(db.executed().len(), 1);
    assert!(!run.is_finished());

    let second = run.next_outcome().await.unwrap();
    assert_eq!(second.index(), 1);
    assert!(run.is_finished());
    assert!(run.next_outcome().await.is_none());

    let report = run.finish().await;
    assert_eq!(report.outcomes.len(), 2);
}

#[tokio::test]
async fn test_report_json() {
    let db = MockDatabase::new().with_numbers("numbers", 2);
    let mut session = db.session();

    let report = Coordinator::default()
        .execute(token("SELECT * FROM numbers; SELEC x"), &mut session)
        .await;
    let json = serde_json::to_value(&report).unwrap();

    assert_eq!(json["success_count"], 1);
    assert_eq!(json["failure_count"], 1);
    assert_eq!(json["outcomes"][0]["status"], "success");
    assert_eq!(json["outcomes"][0]["result"]["rows"], serde_json::json!([[1], [2]]));
    assert_eq!(json["outcomes"][1]["status"], "failure");
    assert_eq!(json["outcomes"][1]["error_kind"], "StatementSyntaxError");
}
