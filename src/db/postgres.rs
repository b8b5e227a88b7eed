//! PostgreSQL session implementation.
//!
//! Provides `PostgresSession`, which implements the `Session` trait over a
//! single pooled sqlx connection. Row-producing statements are read through
//! server-side `SCROLL` cursors so only the requested page crosses the wire.
//! A second pooled connection is used to cancel the running statement with
//! `pg_cancel_backend`.

use crate::config::ConnectionConfig;
use crate::db::{BufferedCursor, ColumnInfo, DriverResult, Row, RowCursor, Session, Value};
use crate::error::{BatchError, Result};
use crate::sql::{keywords, StatementKind};
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column as _, Connection as _, Executor as _, Postgres, Row as _, Statement as _, TypeInfo as _};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Maximum rows read eagerly for statements that cannot be declared as a cursor.
const MAX_BUFFERED_ROWS: usize = 1000;

/// Maximum number of connection retry attempts.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay between retry attempts (doubles each retry).
const RETRY_BASE_DELAY_MS: u64 = 500;

/// SQLSTATE `query_canceled`, the reply of a statement stopped by `pg_cancel_backend`.
const QUERY_CANCELED: &str = "57014";

type SharedConnection = Arc<Mutex<PoolConnection<Postgres>>>;

/// A PostgreSQL session bound to one backend process.
pub struct PostgresSession {
    pool: PgPool,
    conn: SharedConnection,
    backend_pid: i32,
    cursor_seq: u64,
}

impl std::fmt::Debug for PostgresSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresSession")
            .field("backend_pid", &self.backend_pid)
            .field("cursor_seq", &self.cursor_seq)
            .finish_non_exhaustive()
    }
}

impl PostgresSession {
    /// Connects with retries on transient failures.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let conn_str = config.to_connection_string()?;

        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);
        let mut attempt = 1;

        let pool = loop {
            debug!("Connection attempt {} of {}", attempt, MAX_RETRY_ATTEMPTS);

            // One connection runs the batch, the other is kept free for cancel requests.
            let result = PgPoolOptions::new()
                .max_connections(2)
                .acquire_timeout(Duration::from_secs(10))
                .connect(&conn_str)
                .await;

            match result {
                Ok(pool) => break pool,
                Err(e) if attempt < MAX_RETRY_ATTEMPTS && is_transient_error(&e) => {
                    warn!(
                        "Connection attempt {} failed (transient error), retrying in {:?}",
                        attempt, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(map_connection_error(&e, config)),
            }
        };

        Self::from_pool(pool).await
    }

    /// Creates a session on a connection checked out from an existing pool.
    ///
    /// The pool needs room for a second connection to support aborts.
    pub async fn from_pool(pool: PgPool) -> Result<Self> {
        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| BatchError::connection(e.to_string()))?;
        let backend_pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *conn)
            .await
            .map_err(map_driver_error)?;

        debug!(backend_pid, "Session established");

        Ok(Self {
            pool,
            conn: Arc::new(Mutex::new(conn)),
            backend_pid,
            cursor_seq: 0,
        })
    }

    /// Declares a hold cursor for a SELECT-like statement.
    async fn open_cursor(&mut self, sql: &str) -> Result<DriverResult> {
        self.cursor_seq += 1;
        let name = format!("sqlbatch_cursor_{}", self.cursor_seq);

        let mut guard = self.conn.lock().await;
        let conn: &mut PgConnection = &mut guard;

        let columns = describe_columns(conn, sql).await?;
        let declare = format!("DECLARE {name} SCROLL CURSOR WITH HOLD FOR {sql}");
        sqlx::query(&declare)
            .persistent(false)
            .execute(&mut *conn)
            .await
            .map_err(map_driver_error)?;

        debug!(cursor = %name, "Declared cursor");

        Ok(DriverResult::Rows {
            columns,
            cursor: Box::new(PgCursor {
                conn: Arc::clone(&self.conn),
                name,
                closed: false,
            }),
        })
    }

    /// Reads a bounded result eagerly (EXPLAIN and other non-cursor queries).
    async fn fetch_buffered(&mut self, sql: &str) -> Result<DriverResult> {
        let mut guard = self.conn.lock().await;
        let conn: &mut PgConnection = &mut guard;

        let columns = describe_columns(conn, sql).await?;
        let mut rows = Vec::new();
        let mut truncated = false;
        {
            let mut stream = sqlx::query(sql).persistent(false).fetch(&mut *conn);
            while let Some(row) = stream.try_next().await.map_err(map_driver_error)? {
                if rows.len() >= MAX_BUFFERED_ROWS {
                    warn!(
                        "Statement returned more than {} rows, truncating",
                        MAX_BUFFERED_ROWS
                    );
                    truncated = true;
                    break;
                }
                rows.push(convert_row(&row));
            }
        }

        let mut cursor = BufferedCursor::new(rows);
        if truncated {
            cursor = cursor.mark_truncated();
        }
        Ok(DriverResult::Rows {
            columns,
            cursor: Box::new(cursor),
        })
    }
}

#[async_trait]
impl Session for PostgresSession {
    async fn execute(&mut self, sql: &str, kind: StatementKind) -> Result<DriverResult> {
        if kind == StatementKind::Query {
            return if is_cursorable(sql) {
                self.open_cursor(sql).await
            } else {
                self.fetch_buffered(sql).await
            };
        }

        let mut guard = self.conn.lock().await;
        let conn: &mut PgConnection = &mut guard;
        let result = sqlx::query(sql)
            .persistent(false)
            .execute(conn)
            .await
            .map_err(map_driver_error)?;
        Ok(DriverResult::Affected(result.rows_affected()))
    }

    fn supports_abort(&self) -> bool {
        true
    }

    async fn abort_current(&mut self) -> Result<()> {
        let cancelled: bool = sqlx::query_scalar("SELECT pg_cancel_backend($1)")
            .bind(self.backend_pid)
            .fetch_one(&self.pool)
            .await
            .map_err(map_driver_error)?;

        if !cancelled {
            warn!(backend_pid = self.backend_pid, "Cancel request was not delivered");
        }
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        settle(&mut guard).await
    }

    async fn close(&mut self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn: &mut PgConnection = &mut guard;
        settle(conn).await?;
        sqlx::query("CLOSE ALL")
            .execute(conn)
            .await
            .map_err(map_driver_error)?;
        Ok(())
    }
}

/// A server-side cursor on the session's connection.
struct PgCursor {
    conn: SharedConnection,
    name: String,
    closed: bool,
}

impl PgCursor {
    async fn run(&self, command: String) -> Result<u64> {
        let mut guard = self.conn.lock().await;
        let conn: &mut PgConnection = &mut guard;
        let result = sqlx::query(&command)
            .persistent(false)
            .execute(conn)
            .await
            .map_err(map_driver_error)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RowCursor for PgCursor {
    async fn fetch(&mut self, max: usize) -> Result<Vec<Row>> {
        let command = format!("FETCH FORWARD {max} FROM {}", self.name);
        let mut guard = self.conn.lock().await;
        let conn: &mut PgConnection = &mut guard;
        let rows = sqlx::query(&command)
            .persistent(false)
            .fetch_all(conn)
            .await
            .map_err(map_driver_error)?;
        Ok(rows.iter().map(convert_row).collect())
    }

    async fn skip(&mut self, n: usize) -> Result<usize> {
        // MOVE takes a bigint count.
        let n = n.min(i64::MAX as usize);
        let moved = self
            .run(format!("MOVE FORWARD {n} IN {}", self.name))
            .await?;
        Ok(moved as usize)
    }

    async fn rewind(&mut self) -> Result<()> {
        self.run(format!("MOVE ABSOLUTE 0 IN {}", self.name)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.run(format!("CLOSE {}", self.name)).await?;
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for PgCursor {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        warn!(cursor = %self.name, "Cursor dropped without close");
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let conn = Arc::clone(&self.conn);
        let command = format!("CLOSE {}", self.name);
        runtime.spawn(async move {
            let mut guard = conn.lock().await;
            let conn: &mut PgConnection = &mut guard;
            let _ = sqlx::query(&command).execute(conn).await;
        });
    }
}

/// Waits until the connection is idle.
///
/// After an abort the pending reply is the cancelled statement's error, which
/// is discarded once.
async fn settle(conn: &mut PgConnection) -> Result<()> {
    match conn.ping().await {
        Err(e) if is_query_canceled(&e) => {
            debug!("Discarded reply of cancelled statement");
            conn.ping().await.map_err(map_driver_error)
        }
        result => result.map_err(map_driver_error),
    }
}

fn is_query_canceled(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .and_then(|db_error| db_error.code())
        .is_some_and(|code| code == QUERY_CANCELED)
}

/// Returns true if the statement can be the body of `DECLARE ... CURSOR WITH HOLD FOR`.
///
/// The server rejects row-locking clauses, `SELECT ... INTO` and
/// data-modifying CTEs inside a hold cursor; those are read eagerly.
fn is_cursorable(sql: &str) -> bool {
    let words = keywords(sql);
    let modifies = |word: &String| matches!(word.as_str(), "INSERT" | "UPDATE" | "DELETE" | "MERGE");

    match words.first().map(String::as_str) {
        Some("SELECT") => {}
        Some("WITH") if !words.iter().any(modifies) => {}
        _ => return false,
    }

    let locks_rows = words.windows(2).any(|pair| {
        pair[0] == "FOR" && matches!(pair[1].as_str(), "UPDATE" | "SHARE" | "NO" | "KEY")
    });
    !locks_rows && !words.iter().any(|word| word == "INTO")
}

/// Prepares the statement to read its result columns without running it.
async fn describe_columns(conn: &mut PgConnection, sql: &str) -> Result<Vec<ColumnInfo>> {
    let statement = (&mut *conn).prepare(sql).await.map_err(map_driver_error)?;
    Ok(statement
        .columns()
        .iter()
        .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
        .collect())
}

/// Converts a sqlx PgRow to our Row type.
fn convert_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| convert_value(row, i, col.type_info().name()))
        .collect()
}

/// Decodes one column by its Postgres type name, falling back to text.
fn convert_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    match type_name.to_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => row.try_get::<Option<bool>, _>(index).ok().flatten().into(),
        "INT2" | "SMALLINT" => row
            .try_get::<Option<i16>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),
        "INT4" | "INT" | "INTEGER" => row.try_get::<Option<i32>, _>(index).ok().flatten().into(),
        "INT8" | "BIGINT" => row.try_get::<Option<i64>, _>(index).ok().flatten().into(),
        "FLOAT4" | "REAL" => row
            .try_get::<Option<f32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Float(v as f64))
            .unwrap_or(Value::Null),
        "FLOAT8" | "DOUBLE PRECISION" => {
            row.try_get::<Option<f64>, _>(index).ok().flatten().into()
        }
        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),
        _ => row.try_get::<Option<String>, _>(index).ok().flatten().into(),
    }
}

/// Maps a driver error onto the pipeline's error kinds using the SQLSTATE class.
fn map_driver_error(error: sqlx::Error) -> BatchError {
    match &error {
        sqlx::Error::Database(db_error) => {
            let message = format_query_error(&error);
            match db_error.code().as_deref() {
                Some(code) if code.starts_with("42") => BatchError::syntax(message),
                Some(code) if code.starts_with("23") => BatchError::constraint(message),
                // Class 08 is connection exceptions; 57P0x is server shutdown.
                Some(code) if code.starts_with("08") || code.starts_with("57P0") => {
                    BatchError::connection_lost(message)
                }
                _ => BatchError::query(message),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => BatchError::connection_lost(error.to_string()),
        _ => BatchError::query(error.to_string()),
    }
}

/// Determines if a connect error is transient and worth retrying.
fn is_transient_error(error: &sqlx::Error) -> bool {
    let error_str = error.to_string().to_lowercase();

    [
        "connection refused",
        "timed out",
        "timeout",
        "temporarily unavailable",
        "connection reset",
        "broken pipe",
    ]
    .iter()
    .any(|needle| error_str.contains(needle))
}

/// Maps sqlx connection errors to user-friendly messages.
fn map_connection_error(error: &sqlx::Error, config: &ConnectionConfig) -> BatchError {
    let host = config.host.as_deref().unwrap_or("localhost");
    let port = config.port;
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") || error_str.contains("could not connect") {
        BatchError::connection(format!(
            "Cannot connect to {host}:{port}. Check that the server is running."
        ))
    } else if error_str.contains("authentication failed") {
        let user = config.user.as_deref().unwrap_or("unknown");
        BatchError::connection(format!(
            "Authentication failed for user '{user}'. Check your credentials."
        ))
    } else if error_str.contains("does not exist") && error_str.contains("database") {
        let database = config.database.as_deref().unwrap_or("unknown");
        BatchError::connection(format!("Database '{database}' does not exist."))
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        BatchError::connection(format!("Connection to {host}:{port} timed out."))
    } else {
        BatchError::connection(error.to_string())
    }
}

/// Formats a database error with the detail and hint lines Postgres provides.
fn format_query_error(error: &sqlx::Error) -> String {
    let Some(db_error) = error.as_database_error() else {
        return error.to_string();
    };

    let mut result = format!("ERROR: {}", db_error.message());
    if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        let fields = [
            ("DETAIL", pg_error.detail()),
            ("HINT", pg_error.hint()),
            ("TABLE", pg_error.table()),
            ("COLUMN", pg_error.column()),
            ("CONSTRAINT", pg_error.constraint()),
        ];
        for (label, value) in fields {
            if let Some(value) = value {
                result.push_str(&format!("\n  {label}: {value}"));
            }
        }
    }
    result
}
