//! sqlbatch - run a block of SQL statements as one batch.

use sqlbatch::batch::{
    BatchReport, Coordinator, ExecutionPolicy, ExecutionToken, StatementOutcome,
};
use sqlbatch::cli::{Cli, OutputFormat};
use sqlbatch::config::Config;
use sqlbatch::db::{self, MockDatabase, Session, Value};
use sqlbatch::error::{BatchError, Result};
use sqlbatch::logging;
use sqlbatch::sql::{classify, StatementSpan};
use tracing::{error, info, warn};

/// Rows in the in-memory `numbers` table used with --mock-db.
const MOCK_NUMBERS: i64 = 1000;

/// Longest statement text echoed in text output.
const MAX_ECHO_LEN: usize = 60;

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    if cli.log_file {
        logging::init_file_logging();
    } else {
        logging::init_stderr_logging();
    }

    match run(cli).await {
        Ok(report) if report.is_success() => {}
        Ok(_) => std::process::exit(1),
        Err(e) => {
            error!("{}: {}", e.category(), e);
            std::process::exit(2);
        }
    }
}

async fn run(cli: Cli) -> Result<BatchReport> {
    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());
    let config = Config::load_from_file(&config_path)?;

    let mut execution = config.execution.clone();
    if let Some(ms) = cli.timeout_ms {
        execution.statement_timeout_ms = ms;
    }
    if let Some(rows) = cli.page_size {
        execution.page_size = rows;
        execution.max_page_size = execution.max_page_size.max(rows);
    }
    if let Some(delimiter) = cli.delimiter {
        execution.delimiter = delimiter;
    }
    execution.validate()?;
    let format = cli.parse_output_format().map_err(BatchError::config)?;

    let sql = cli.read_sql()?;
    let token = ExecutionToken::from_sql(&sql, &execution.splitter())
        .with_timeout(execution.statement_timeout());
    if token.is_empty() {
        warn!("No statements found in input");
    }
    check_statements(&token.statements, cli.read_only)?;

    let mut session: Box<dyn Session> = if cli.mock_db {
        info!("Using mock database");
        Box::new(
            MockDatabase::new()
                .with_numbers("numbers", MOCK_NUMBERS)
                .session(),
        )
    } else {
        let connection = cli.resolve_connection(&config)?.ok_or_else(|| {
            BatchError::config(
                "No database connection configured. Use --help for usage information.",
            )
        })?;
        info!("Connection: {}", connection.display_string());
        db::connect(&connection).await?
    };

    let cancel = token.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling batch");
            cancel.cancel();
        }
    });

    let statements = token.statements.clone();
    let coordinator = Coordinator::new(ExecutionPolicy::from(&execution));
    let mut batch = coordinator.start(token, session.as_mut());

    while let Some(outcome) = batch.next_outcome().await {
        if format == OutputFormat::Text {
            print_outcome(&outcome, &statements);
        }
    }
    let report = batch.finish().await;

    if let Err(e) = session.close().await {
        warn!("Failed to close session: {}", e);
    }

    match format {
        OutputFormat::Text => println!("{}", report.summary()),
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&report)
                .map_err(|e| BatchError::internal(format!("Failed to encode report: {e}")))?;
            println!("{json}");
        }
    }

    Ok(report)
}

/// Applies the read-only policy and warns about schema changes.
fn check_statements(statements: &[StatementSpan], read_only: bool) -> Result<()> {
    for (index, span) in statements.iter().enumerate() {
        let kind = classify(span);
        if read_only && kind.requires_confirmation() {
            return Err(BatchError::config(format!(
                "Statement {} (line {}) is not read-only: {}",
                index + 1,
                span.source_line,
                abbreviate(&span.text)
            )));
        }
        if kind.requires_warning() {
            warn!(
                statement = index + 1,
                line = span.source_line,
                "Batch contains a schema change: {}",
                abbreviate(&span.text)
            );
        }
    }
    Ok(())
}

/// Resolves the final connection configuration from CLI args, config file, and environment.
fn print_outcome(outcome: &StatementOutcome, statements: &[StatementSpan]) {
    let index = outcome.index();
    let text = statements
        .get(index)
        .map(|span| abbreviate(&span.text))
        .unwrap_or_default();

    match outcome {
        StatementOutcome::Success {
            rows_affected,
            result,
            elapsed,
            ..
        } => {
            let detail = match (rows_affected, result) {
                (Some(rows), _) => format!("{rows} rows affected"),
                (None, Some(handle)) => match handle.total_rows() {
                    Some(total) => format!("{total} rows"),
                    None => format!("{}+ rows", handle.preview().map_or(0, |p| p.len())),
                },
                (None, None) => "ok".to_string(),
            };
            println!(
                "[{}] OK ({} ms) {} -- {}",
                index + 1,
                elapsed.as_millis(),
                text,
                detail
            );

            if let Some(handle) = result {
                let names: Vec<&str> =
                    handle.columns().iter().map(|c| c.name.as_str()).collect();
                println!("    {}", names.join("\t"));
                for row in handle.preview().map(|p| p.rows.as_slice()).unwrap_or_default() {
                    println!("    {}", format_row(row));
                }
                for warning in handle.stats().warnings() {
                    println!("    warning: {warning}");
                }
            }
        }
        StatementOutcome::Failure {
            error_kind,
            message,
            elapsed,
            ..
        } => {
            println!(
                "[{}] FAILED ({} ms) {} -- {}: {}",
                index + 1,
                elapsed.as_millis(),
                text,
                error_kind,
                message
            );
        }
        StatementOutcome::Cancelled { elapsed, .. } => {
            println!(
                "[{}] CANCELLED ({} ms) {}",
                index + 1,
                elapsed.as_millis(),
                text
            );
        }
    }
}

fn format_row(row: &[Value]) -> String {
    row.iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join("\t")
}

fn abbreviate(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= MAX_ECHO_LEN {
        flat
    } else {
        let head: String = flat.chars().take(MAX_ECHO_LEN - 3).collect();
        format!("{head}...")
    }
}
