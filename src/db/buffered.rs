//! In-memory cursor for drivers that have to read a result eagerly.

use super::{Row, RowCursor};
use crate::error::{BatchError, Result};
use async_trait::async_trait;

/// A cursor over rows already held in memory.
#[derive(Debug, Default)]
pub struct BufferedCursor {
    rows: Vec<Row>,
    position: usize,
    closed: bool,
    truncated: bool,
}

impl BufferedCursor {
    /// Creates a cursor over the given rows.
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows,
            position: 0,
            closed: false,
            truncated: false,
        }
    }

    /// Marks the rows as a prefix of a larger result the driver stopped reading.
    pub fn mark_truncated(mut self) -> Self {
        self.truncated = true;
        self
    }

    /// Returns true once the cursor has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(BatchError::released("cursor is closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RowCursor for BufferedCursor {
    async fn fetch(&mut self, max: usize) -> Result<Vec<Row>> {
        self.ensure_open()?;
        let end = self.position.saturating_add(max).min(self.rows.len());
        let page = self.rows[self.position..end].to_vec();
        self.position = end;
        Ok(page)
    }

    async fn rewind(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.position = 0;
        Ok(())
    }

    fn is_truncated(&self) -> bool {
        self.truncated
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.rows = Vec::new();
        Ok(())
    }
}
