//! Statement classification by leading keyword.
//!
//! Uses the sqlparser tokenizer so that leading comments and parentheses
//! are skipped the same way a database would. Statements the tokenizer
//! rejects (unterminated literals, stray characters) fall back to a plain
//! scan of the first word.

use serde::Serialize;
use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::fmt;

use super::StatementSpan;

/// Result-shape category of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatementKind {
    /// Produces a row set (SELECT, WITH, EXPLAIN).
    Query,
    /// Produces an affected-row count (INSERT, UPDATE, DELETE).
    Mutation,
    /// Succeeds or fails with no result (CREATE, ALTER, DROP, TRUNCATE).
    SchemaChange,
    /// Anything else.
    Unknown,
}

impl StatementKind {
    /// Returns true if the statement is expected to produce rows.
    pub fn expects_rows(&self) -> bool {
        matches!(self, Self::Query)
    }

    /// Returns true if the statement may modify data or schema.
    ///
    /// Unknown statements are treated as modifying.
    pub fn requires_confirmation(&self) -> bool {
        !matches!(self, Self::Query)
    }

    /// Returns true if the statement should carry a warning before it runs.
    pub fn requires_warning(&self) -> bool {
        matches!(self, Self::SchemaChange)
    }

    fn from_keyword(keyword: &str) -> Self {
        match keyword {
            "SELECT" | "WITH" | "EXPLAIN" => Self::Query,
            "INSERT" | "UPDATE" | "DELETE" => Self::Mutation,
            "CREATE" | "ALTER" | "DROP" | "TRUNCATE" => Self::SchemaChange,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query => write!(f, "Query"),
            Self::Mutation => write!(f, "Mutation"),
            Self::SchemaChange => write!(f, "Schema change"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Classifies a statement span.
pub fn classify(span: &StatementSpan) -> StatementKind {
    classify_sql(&span.text)
}

/// Classifies raw statement text.
pub fn classify_sql(sql: &str) -> StatementKind {
    leading_keyword(sql)
        .map(|keyword| StatementKind::from_keyword(&keyword))
        .unwrap_or(StatementKind::Unknown)
}

/// Returns the first keyword of a statement, uppercased.
///
/// Leading whitespace, comments and opening parentheses are skipped.
/// Quoted identifiers are not keywords and yield `None`.
pub fn leading_keyword(sql: &str) -> Option<String> {
    let dialect = GenericDialect {};
    match Tokenizer::new(&dialect, sql).tokenize() {
        Ok(tokens) => tokens
            .into_iter()
            .find(|token| !matches!(token, Token::Whitespace(_) | Token::LParen))
            .and_then(|token| match token {
                Token::Word(word) if word.quote_style.is_none() => Some(word.value.to_uppercase()),
                _ => None,
            }),
        Err(_) => scan_leading_word(sql),
    }
}

/// Returns every unquoted word of a statement, uppercased, in order.
///
/// Words inside string literals, quoted identifiers and comments are left
/// out. Text the tokenizer rejects is split on whitespace instead.
pub fn keywords(sql: &str) -> Vec<String> {
    let dialect = GenericDialect {};
    match Tokenizer::new(&dialect, sql).tokenize() {
        Ok(tokens) => tokens
            .into_iter()
            .filter_map(|token| match token {
                Token::Word(word) if word.quote_style.is_none() => Some(word.value.to_uppercase()),
                _ => None,
            })
            .collect(),
        Err(_) => sql
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|word| word.starts_with(|c: char| c.is_alphabetic()))
            .map(str::to_uppercase)
            .collect(),
    }
}

/// Fallback for text the tokenizer rejects.
fn scan_leading_word(sql: &str) -> Option<String> {
    let rest = sql.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
    let word: String = rest
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();

    if word.is_empty() || !word.starts_with(|c: char| c.is_alphabetic()) {
        None
    } else {
        Some(word.to_uppercase())
    }
}
