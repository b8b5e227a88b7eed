//! sqlbatch - a multi-statement SQL execution pipeline.
//!
//! SQL text is split into statements ([`sql`]), classified, and run in order
//! on one database session ([`batch`], [`db`]) with per-statement timeouts,
//! batch cancellation, and paged access to row results.

pub mod batch;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod sql;
