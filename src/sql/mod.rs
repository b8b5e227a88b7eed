//! SQL text handling: statement splitting and classification.
//!
//! Neither module validates SQL. They only find statement boundaries and
//! the leading keyword, leaving correctness to the database.

mod classifier;
mod splitter;

pub use classifier::{classify, classify_sql, keywords, leading_keyword, StatementKind};
pub use splitter::{split, Splitter, StatementSpan, DEFAULT_DELIMITER};
