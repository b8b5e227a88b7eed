//! Integration tests for sqlbatch.
//!
//! Most tests run against the in-memory mock database. The PostgreSQL tests
//! require a running server and are skipped unless DATABASE_URL is set.

pub mod batch_test;
pub mod cancellation_test;
pub mod pagination_test;
pub mod postgres_test;
