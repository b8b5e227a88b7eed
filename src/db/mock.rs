//! Mock database for testing.
//!
//! Provides an in-memory database with scripted latency and failures, and
//! counters that let tests check cursor hygiene (open cursors, largest
//! single fetch, aborts).

use super::{ColumnInfo, DriverResult, Row, RowCursor, Session, Value};
use crate::error::{BatchError, Result};
use crate::sql::{leading_keyword, StatementKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Scripted behavior for statements containing a marker string.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Waits before running the statement normally.
    Delay(Duration),
    /// Never completes.
    Hang,
    /// Fails with the given error.
    Fail(BatchError),
    /// Kills the session; this and every later call fails.
    DropConnection,
}

#[derive(Debug, Clone)]
struct MockTable {
    columns: Vec<ColumnInfo>,
    rows: Arc<Vec<Row>>,
}

#[derive(Debug)]
struct MockState {
    tables: Mutex<HashMap<String, MockTable>>,
    behaviors: Mutex<Vec<(String, MockBehavior)>>,
    executed: Mutex<Vec<String>>,
    open_cursors: AtomicUsize,
    max_fetch: AtomicUsize,
    aborts: AtomicUsize,
    cancels: AtomicUsize,
    alive: AtomicBool,
    abortable: AtomicBool,
    abort_kills_session: AtomicBool,
    /// A statement was started and has not returned.
    in_flight: AtomicBool,
    /// The next call reports the error of an aborted statement.
    abort_pending: AtomicBool,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            tables: Mutex::default(),
            behaviors: Mutex::default(),
            executed: Mutex::default(),
            open_cursors: AtomicUsize::new(0),
            max_fetch: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            alive: AtomicBool::new(true),
            abortable: AtomicBool::new(true),
            abort_kills_session: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            abort_pending: AtomicBool::new(false),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An in-memory database shared by the sessions it hands out.
#[derive(Debug, Clone, Default)]
pub struct MockDatabase {
    state: Arc<MockState>,
}

impl MockDatabase {
    /// Creates an empty mock database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table with the given columns (`(name, type)`) and rows.
    pub fn with_table(self, name: &str, columns: &[(&str, &str)], rows: Vec<Row>) -> Self {
        let columns = columns
            .iter()
            .map(|(name, data_type)| ColumnInfo::new(*name, *data_type))
            .collect();
        lock(&self.state.tables).insert(
            name.to_lowercase(),
            MockTable {
                columns,
                rows: Arc::new(rows),
            },
        );
        self
    }

    /// Adds a single-column table `name(n int)` holding `1..=count`.
    pub fn with_numbers(self, name: &str, count: i64) -> Self {
        let rows = (1..=count).map(|n| vec![Value::Int(n)]).collect();
        self.with_table(name, &[("n", "int8")], rows)
    }

    /// Applies `behavior` to every statement whose text contains `marker`.
    pub fn on(self, marker: &str, behavior: MockBehavior) -> Self {
        lock(&self.state.behaviors).push((marker.to_string(), behavior));
        self
    }

    /// Makes sessions report that in-flight statements cannot be aborted.
    pub fn non_abortable(self) -> Self {
        self.state.abortable.store(false, Ordering::SeqCst);
        self
    }

    /// Makes an abort leave the session unusable.
    pub fn abort_kills_session(self) -> Self {
        self.state.abort_kills_session.store(true, Ordering::SeqCst);
        self
    }

    /// Opens a session on this database.
    pub fn session(&self) -> MockSession {
        MockSession {
            state: Arc::clone(&self.state),
        }
    }

    /// Number of cursors opened and not yet closed.
    pub fn open_cursors(&self) -> usize {
        self.state.open_cursors.load(Ordering::SeqCst)
    }

    /// Largest row count requested by a single fetch.
    pub fn max_fetch(&self) -> usize {
        self.state.max_fetch.load(Ordering::SeqCst)
    }

    /// Number of abort requests received.
    pub fn aborts(&self) -> usize {
        self.state.aborts.load(Ordering::SeqCst)
    }

    /// Number of batch cancellations received.
    pub fn cancels(&self) -> usize {
        self.state.cancels.load(Ordering::SeqCst)
    }

    /// Statements submitted for execution, in order.
    pub fn executed(&self) -> Vec<String> {
        lock(&self.state.executed).clone()
    }

    /// Returns true while the mock connection is up.
    pub fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }
}

/// A session on a [`MockDatabase`].
#[derive(Debug)]
pub struct MockSession {
    state: Arc<MockState>,
}

impl MockSession {
    fn ensure_alive(&self) -> Result<()> {
        if self.state.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BatchError::connection_lost(
                "server closed the connection unexpectedly",
            ))
        }
    }

    /// Reports the aborted statement's error once, like a real driver
    /// draining its reply on the next round trip.
    fn take_abort_error(&self) -> Result<()> {
        if self.state.abort_pending.swap(false, Ordering::SeqCst) {
            return Err(BatchError::query("canceling statement due to user request"));
        }
        Ok(())
    }

    fn behavior_for(&self, sql: &str) -> Option<MockBehavior> {
        lock(&self.state.behaviors)
            .iter()
            .find(|(marker, _)| sql.contains(marker.as_str()))
            .map(|(_, behavior)| behavior.clone())
    }

    fn table(&self, name: &str) -> Result<MockTable> {
        lock(&self.state.tables)
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| BatchError::query(format!("relation \"{name}\" does not exist")))
    }

    fn run(&self, sql: &str, kind: StatementKind) -> Result<DriverResult> {
        match kind {
            StatementKind::Query => self.run_query(sql),
            StatementKind::Mutation => self.run_mutation(sql),
            StatementKind::SchemaChange => self.run_schema_change(sql),
            StatementKind::Unknown => {
                let keyword = leading_keyword(sql).unwrap_or_default();
                match keyword.as_str() {
                    "BEGIN" | "COMMIT" | "ROLLBACK" | "SET" | "VACUUM" | "ANALYZE" => {
                        Ok(DriverResult::Affected(0))
                    }
                    _ => {
                        let near = sql.split_whitespace().next().unwrap_or(sql);
                        Err(BatchError::syntax(format!(
                            "syntax error at or near \"{near}\""
                        )))
                    }
                }
            }
        }
    }

    fn run_query(&self, sql: &str) -> Result<DriverResult> {
        let (columns, rows) = match word_after(sql, "FROM") {
            Some(name) => {
                let table = self.table(&name)?;
                (table.columns, table.rows)
            }
            None => {
                let expr = sql
                    .split_once(char::is_whitespace)
                    .map(|(_, rest)| rest.trim())
                    .unwrap_or_default();
                let value = expr
                    .parse::<i64>()
                    .map(Value::Int)
                    .unwrap_or_else(|_| Value::String(expr.to_string()));
                (
                    vec![ColumnInfo::new("?column?", "text")],
                    Arc::new(vec![vec![value]]),
                )
            }
        };

        self.state.open_cursors.fetch_add(1, Ordering::SeqCst);
        Ok(DriverResult::Rows {
            columns,
            cursor: Box::new(MockCursor {
                rows,
                position: 0,
                closed: false,
                state: Arc::clone(&self.state),
            }),
        })
    }

    fn run_mutation(&self, sql: &str) -> Result<DriverResult> {
        let keyword = leading_keyword(sql).unwrap_or_default();
        let target = match keyword.as_str() {
            "INSERT" => word_after(sql, "INTO"),
            "DELETE" => word_after(sql, "FROM"),
            _ => word_after(sql, &keyword),
        };
        let Some(name) = target else {
            return Err(BatchError::syntax("syntax error at end of input"));
        };
        let table = self.table(&name)?;
        let affected = if keyword == "INSERT" {
            1
        } else {
            table.rows.len() as u64
        };
        Ok(DriverResult::Affected(affected))
    }

    fn run_schema_change(&self, sql: &str) -> Result<DriverResult> {
        let keyword = leading_keyword(sql).unwrap_or_default();
        let name = word_after(sql, "TABLE")
            .ok_or_else(|| BatchError::syntax("syntax error at end of input"))?;
        let mut tables = lock(&self.state.tables);

        match keyword.as_str() {
            "CREATE" => {
                let key = name.to_lowercase();
                if tables.contains_key(&key) {
                    return Err(BatchError::query(format!(
                        "relation \"{name}\" already exists"
                    )));
                }
                tables.insert(
                    key,
                    MockTable {
                        columns: parse_column_defs(sql),
                        rows: Arc::new(Vec::new()),
                    },
                );
            }
            "DROP" => {
                if tables.remove(&name.to_lowercase()).is_none() {
                    return Err(BatchError::query(format!(
                        "table \"{name}\" does not exist"
                    )));
                }
            }
            _ => {
                if !tables.contains_key(&name.to_lowercase()) {
                    return Err(BatchError::query(format!(
                        "relation \"{name}\" does not exist"
                    )));
                }
            }
        }
        Ok(DriverResult::Affected(0))
    }
}

#[async_trait]
impl Session for MockSession {
    async fn execute(&mut self, sql: &str, kind: StatementKind) -> Result<DriverResult> {
        self.ensure_alive()?;
        self.take_abort_error()?;
        lock(&self.state.executed).push(sql.to_string());
        self.state.in_flight.store(true, Ordering::SeqCst);

        let result = self.run_with_behavior(sql, kind).await;
        self.state.in_flight.store(false, Ordering::SeqCst);
        result
    }

    fn supports_abort(&self) -> bool {
        self.state.abortable.load(Ordering::SeqCst)
    }

    async fn abort_current(&mut self) -> Result<()> {
        self.state.aborts.fetch_add(1, Ordering::SeqCst);
        if self.state.in_flight.swap(false, Ordering::SeqCst) {
            self.state.abort_pending.store(true, Ordering::SeqCst);
        }
        if self.state.abort_kills_session.load(Ordering::SeqCst) {
            self.state.alive.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn cancel(&mut self) -> Result<()> {
        self.state.cancels.fetch_add(1, Ordering::SeqCst);
        self.abort_current().await
    }

    async fn ping(&mut self) -> Result<()> {
        self.ensure_alive()?;
        self.take_abort_error()
    }

    async fn close(&mut self) -> Result<()> {
        self.state.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl MockSession {
    async fn run_with_behavior(&self, sql: &str, kind: StatementKind) -> Result<DriverResult> {
        match self.behavior_for(sql) {
            Some(MockBehavior::Delay(delay)) => tokio::time::sleep(delay).await,
            Some(MockBehavior::Hang) => std::future::pending::<()>().await,
            Some(MockBehavior::Fail(error)) => return Err(error),
            Some(MockBehavior::DropConnection) => {
                self.state.alive.store(false, Ordering::SeqCst);
                return Err(BatchError::connection_lost(
                    "server closed the connection unexpectedly",
                ));
            }
            None => {}
        }

        self.run(sql, kind)
    }
}

/// Cursor over a mock table. Dropping it without `close` counts as a leak.
struct MockCursor {
    rows: Arc<Vec<Row>>,
    position: usize,
    closed: bool,
    state: Arc<MockState>,
}

impl MockCursor {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(BatchError::released("cursor is closed"));
        }
        if !self.state.alive.load(Ordering::SeqCst) {
            return Err(BatchError::connection_lost("connection closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl RowCursor for MockCursor {
    async fn fetch(&mut self, max: usize) -> Result<Vec<Row>> {
        self.ensure_open()?;
        self.state.max_fetch.fetch_max(max, Ordering::SeqCst);
        let end = self.position.saturating_add(max).min(self.rows.len());
        let page = self.rows[self.position..end].to_vec();
        self.position = end;
        Ok(page)
    }

    async fn skip(&mut self, n: usize) -> Result<usize> {
        self.ensure_open()?;
        let end = self.position.saturating_add(n).min(self.rows.len());
        let skipped = end - self.position;
        self.position = end;
        Ok(skipped)
    }

    async fn rewind(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.position = 0;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.state.open_cursors.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Returns the identifier following `keyword` (case-insensitive), unquoted.
fn word_after(sql: &str, keyword: &str) -> Option<String> {
    let mut words = sql.split_whitespace();
    words.find(|word| word.eq_ignore_ascii_case(keyword))?;
    let word = words.next()?;
    let name: String = word
        .trim_matches('"')
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '.')
        .collect();
    (!name.is_empty()).then_some(name)
}

/// Extracts `(name type, ...)` column definitions from a CREATE TABLE statement.
fn parse_column_defs(sql: &str) -> Vec<ColumnInfo> {
    let Some((_, rest)) = sql.split_once('(') else {
        return Vec::new();
    };
    let body = rest.rsplit_once(')').map(|(body, _)| body).unwrap_or(rest);
    body.split(',')
        .filter_map(|def| {
            let mut parts = def.split_whitespace();
            let name = parts.next()?;
            let data_type = parts.next().unwrap_or("text");
            Some(ColumnInfo::new(name, data_type))
        })
        .collect()
}
