//! Paged access to one statement's result set.
//!
//! A [`ResultHandle`] wraps the driver cursor of a row-producing statement.
//! Pages are read on demand, so at most one page plus a single lookahead row
//! is pulled from the driver per request. Moving backwards rewinds the
//! cursor; moving forwards skips without returning rows.
//!
//! The first page is kept as a preview. Once the handle is released, reads
//! that fall inside the preview are still answered from it.

use super::race::{race, Race};
use super::serialize_millis;
use crate::db::{ColumnInfo, Row, RowCursor};
use crate::error::{BatchError, Result};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default upper bound on rows per page.
pub const DEFAULT_MAX_PAGE_SIZE: usize = 1500;

/// A single fetch slower than this is reported by [`PageStats::warnings`].
const SLOW_FETCH: Duration = Duration::from_secs(1);

/// Reading more rows than this from one result is reported.
const LARGE_SCAN_ROWS: u64 = 10_000;

/// Reading this many times more rows than were returned is reported.
const POOR_FILTER_RATIO: u64 = 10;

/// One page of rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Page {
    /// Offset of the first row in the page.
    pub offset: usize,
    pub rows: Vec<Row>,
    /// True if at least one row follows this page.
    pub has_more: bool,
}

impl Page {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Cumulative read counters for a result handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PageStats {
    /// Rows pulled from the driver, including skipped and lookahead rows.
    pub rows_read: u64,
    /// Rows handed back to callers.
    pub rows_returned: u64,
    /// Number of driver round trips made by page requests.
    pub fetches: u64,
    /// Time spent waiting on the driver.
    #[serde(serialize_with = "serialize_millis", rename = "fetch_time_ms")]
    pub fetch_time: Duration,
    /// Slowest single page request.
    #[serde(serialize_with = "serialize_millis", rename = "slowest_fetch_ms")]
    pub slowest_fetch: Duration,
}

impl PageStats {
    /// Returns human-readable warnings about how the result was read.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.slowest_fetch > SLOW_FETCH {
            warnings.push(format!(
                "Slow page fetch: {} ms",
                self.slowest_fetch.as_millis()
            ));
        }
        if self.rows_read > LARGE_SCAN_ROWS {
            warnings.push(format!("Large scan: {} rows read", self.rows_read));
        }
        if self.rows_returned > 0 && self.rows_read > self.rows_returned * POOR_FILTER_RATIO {
            warnings.push(format!(
                "Read {} rows to return {}; consider narrowing the query",
                self.rows_read, self.rows_returned
            ));
        }

        warnings
    }
}

/// Limits applied to a result handle.
#[derive(Debug, Clone)]
pub struct HandleOptions {
    /// Page requests are clamped to this many rows.
    pub max_page_size: usize,
    /// Time limit for a single page request.
    pub fetch_timeout: Option<Duration>,
    /// Cancelling this token aborts in-flight fetches and releases the handle.
    pub cancel: Option<CancellationToken>,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            fetch_timeout: None,
            cancel: None,
        }
    }
}

struct CursorState {
    cursor: Option<Box<dyn RowCursor>>,
    /// Rows consumed from the cursor since its start, lookahead included.
    position: usize,
    /// The row at `position - 1`, read to learn whether more rows exist.
    lookahead: Option<Row>,
}

struct Counters {
    rows_read: AtomicU64,
    rows_returned: AtomicU64,
    fetches: AtomicU64,
    fetch_nanos: AtomicU64,
    slowest_nanos: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            rows_read: AtomicU64::new(0),
            rows_returned: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            fetch_nanos: AtomicU64::new(0),
            slowest_nanos: AtomicU64::new(0),
        }
    }

    fn read(&self, rows: usize) {
        self.rows_read.fetch_add(rows as u64, Ordering::Relaxed);
        self.fetches.fetch_add(1, Ordering::Relaxed);
    }
}

struct Inner {
    statement_index: usize,
    columns: Vec<ColumnInfo>,
    options: HandleOptions,
    state: Mutex<CursorState>,
    preview: OnceLock<Page>,
    total_rows: OnceLock<usize>,
    truncated: AtomicBool,
    released: AtomicBool,
    counters: Counters,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let Some(mut cursor) = self.state.get_mut().cursor.take() else {
            return;
        };
        warn!(
            statement = self.statement_index,
            "Result handle dropped without release, closing cursor"
        );
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = cursor.close().await {
                    warn!("Failed to close leaked cursor: {}", e);
                }
            });
        }
    }
}

/// A shared handle to one statement's result set.
///
/// Clones refer to the same cursor. The cursor is closed by [`release`],
/// which the coordinator calls before the session runs another statement.
///
/// [`release`]: ResultHandle::release
#[derive(Clone)]
pub struct ResultHandle {
    inner: Arc<Inner>,
}

impl ResultHandle {
    /// Wraps a driver cursor.
    pub fn new(
        statement_index: usize,
        columns: Vec<ColumnInfo>,
        cursor: Box<dyn RowCursor>,
        options: HandleOptions,
    ) -> Self {
        let options = HandleOptions {
            max_page_size: options.max_page_size.max(1),
            ..options
        };
        Self {
            inner: Arc::new(Inner {
                statement_index,
                columns,
                options,
                state: Mutex::new(CursorState {
                    cursor: Some(cursor),
                    position: 0,
                    lookahead: None,
                }),
                preview: OnceLock::new(),
                total_rows: OnceLock::new(),
                truncated: AtomicBool::new(false),
                released: AtomicBool::new(false),
                counters: Counters::new(),
            }),
        }
    }

    pub fn statement_index(&self) -> usize {
        self.inner.statement_index
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.inner.columns
    }

    pub fn max_page_size(&self) -> usize {
        self.inner.options.max_page_size
    }

    /// Returns the first page, once it has been loaded.
    pub fn preview(&self) -> Option<&Page> {
        self.inner.preview.get()
    }

    /// Returns the row count once a read has reached the end of the result.
    pub fn total_rows(&self) -> Option<usize> {
        self.inner.total_rows.get().copied()
    }

    pub fn total_rows_known(&self) -> bool {
        self.total_rows().is_some()
    }

    /// Returns true if the driver cut the result short.
    ///
    /// A truncated result never reports `total_rows`.
    pub fn is_truncated(&self) -> bool {
        self.inner.truncated.load(Ordering::Relaxed)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PageStats {
        let c = &self.inner.counters;
        PageStats {
            rows_read: c.rows_read.load(Ordering::Relaxed),
            rows_returned: c.rows_returned.load(Ordering::Relaxed),
            fetches: c.fetches.load(Ordering::Relaxed),
            fetch_time: Duration::from_nanos(c.fetch_nanos.load(Ordering::Relaxed)),
            slowest_fetch: Duration::from_nanos(c.slowest_nanos.load(Ordering::Relaxed)),
        }
    }

    /// Loads the first `page_size` rows as the preview.
    ///
    /// The statement has already completed at this point, so the read is
    /// bounded by the fetch timeout only and ignores cancellation.
    pub async fn load_preview(&self, page_size: usize) -> Result<&Page> {
        if self.inner.preview.get().is_none() {
            let page = self.fetch(0, page_size, None).await?;
            let _ = self.inner.preview.set(page);
        }
        self.inner
            .preview
            .get()
            .ok_or_else(|| BatchError::internal("preview not loaded"))
    }

    /// Fetches up to `limit` rows starting at `offset`.
    ///
    /// `limit` is clamped to `1..=max_page_size`. An offset past the end
    /// yields an empty page with `has_more == false`.
    pub async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Page> {
        self.fetch(offset, limit, self.inner.options.cancel.as_ref()).await
    }

    async fn fetch(
        &self,
        offset: usize,
        limit: usize,
        cancel: Option<&CancellationToken>,
    ) -> Result<Page> {
        let limit = limit.clamp(1, self.inner.options.max_page_size);

        if let Some(page) = self.from_preview(offset, limit) {
            self.inner
                .counters
                .rows_returned
                .fetch_add(page.rows.len() as u64, Ordering::Relaxed);
            return Ok(page);
        }
        if self.is_released() {
            return Err(BatchError::released(format!(
                "rows {}..{} of statement {} are no longer available",
                offset,
                offset.saturating_add(limit),
                self.inner.statement_index + 1
            )));
        }

        let started = Instant::now();
        let outcome = {
            let mut state = self.inner.state.lock().await;
            race(
                self.read_page(&mut state, offset, limit),
                self.inner.options.fetch_timeout,
                cancel,
            )
            .await
        };
        self.record_fetch_time(started.elapsed());

        match outcome {
            Race::Completed(result) => {
                let page = result?;
                self.inner
                    .counters
                    .rows_returned
                    .fetch_add(page.rows.len() as u64, Ordering::Relaxed);
                debug!(
                    statement = self.inner.statement_index,
                    offset,
                    rows = page.rows.len(),
                    has_more = page.has_more,
                    "Fetched page"
                );
                Ok(page)
            }
            Race::TimedOut => {
                let timeout = self.inner.options.fetch_timeout.unwrap_or_default();
                warn!(
                    statement = self.inner.statement_index,
                    "Page fetch timed out, releasing result"
                );
                self.release().await;
                Err(BatchError::Timeout(timeout))
            }
            Race::Cancelled => {
                self.release().await;
                Err(BatchError::Cancelled)
            }
        }
    }

    /// Fetches a 1-based page number of `page_size` rows.
    pub async fn fetch_page_number(&self, page: usize, page_size: usize) -> Result<Page> {
        if page == 0 {
            return Err(BatchError::internal("page numbers start at 1"));
        }
        let size = page_size.clamp(1, self.inner.options.max_page_size);
        let offset = (page - 1)
            .checked_mul(size)
            .ok_or_else(|| BatchError::internal(format!("page {page} is out of range")))?;
        self.fetch_page(offset, size).await
    }

    /// Closes the underlying cursor. Safe to call more than once.
    pub async fn release(&self) {
        let cursor = {
            let mut state = self.inner.state.lock().await;
            state.lookahead = None;
            state.cursor.take()
        };
        self.inner.released.store(true, Ordering::SeqCst);

        if let Some(mut cursor) = cursor {
            if let Err(e) = cursor.close().await {
                warn!(
                    statement = self.inner.statement_index,
                    "Failed to close cursor: {}", e
                );
            } else {
                debug!(statement = self.inner.statement_index, "Released result");
            }
        }
    }

    fn from_preview(&self, offset: usize, limit: usize) -> Option<Page> {
        let preview = self.inner.preview.get()?;
        let preview_end = preview.offset + preview.rows.len();
        let end = offset.saturating_add(limit);

        if offset < preview.offset || (end > preview_end && preview.has_more) {
            return None;
        }

        let start = offset.min(preview_end) - preview.offset;
        let stop = end.min(preview_end) - preview.offset;
        Some(Page {
            offset,
            rows: preview.rows[start..stop].to_vec(),
            has_more: end < preview_end || preview.has_more,
        })
    }

    async fn read_page(
        &self,
        state: &mut CursorState,
        offset: usize,
        limit: usize,
    ) -> Result<Page> {
        let counters = &self.inner.counters;
        let CursorState {
            cursor,
            position,
            lookahead,
        } = state;
        let cursor = cursor
            .as_mut()
            .ok_or_else(|| BatchError::released("cursor is closed"))?;

        // Index of the next row a caller would receive.
        let mut next = *position - usize::from(lookahead.is_some());
        if offset < next {
            cursor.rewind().await?;
            *position = 0;
            *lookahead = None;
            next = 0;
        }

        let mut to_skip = offset - next;
        if to_skip > 0 && lookahead.take().is_some() {
            to_skip -= 1;
        }
        if to_skip > 0 {
            let skipped = cursor.skip(to_skip).await?;
            counters.read(skipped);
            *position += skipped;
            if skipped < to_skip {
                self.mark_end(&**cursor, *position);
                return Ok(Page {
                    offset,
                    rows: Vec::new(),
                    has_more: false,
                });
            }
        }

        let mut rows: Vec<Row> = lookahead.take().into_iter().collect();
        while rows.len() < limit {
            let batch = cursor.fetch(limit - rows.len()).await?;
            counters.read(batch.len());
            if batch.is_empty() {
                break;
            }
            *position += batch.len();
            rows.extend(batch);
        }

        let has_more = if rows.len() == limit {
            let mut peek = cursor.fetch(1).await?;
            counters.read(peek.len());
            *position += peek.len();
            *lookahead = peek.pop();
            lookahead.is_some()
        } else {
            false
        };
        if !has_more {
            self.mark_end(&**cursor, *position);
        }

        Ok(Page {
            offset,
            rows,
            has_more,
        })
    }

    fn mark_end(&self, cursor: &dyn RowCursor, rows: usize) {
        if cursor.is_truncated() {
            if !self.inner.truncated.swap(true, Ordering::Relaxed) {
                warn!(
                    statement = self.inner.statement_index,
                    rows, "Result was truncated by the driver"
                );
            }
        } else {
            let _ = self.inner.total_rows.set(rows);
        }
    }

    fn record_fetch_time(&self, elapsed: Duration) {
        let nanos = elapsed.as_nanos() as u64;
        let c = &self.inner.counters;
        c.fetch_nanos.fetch_add(nanos, Ordering::Relaxed);
        c.slowest_nanos.fetch_max(nanos, Ordering::Relaxed);
    }
}

impl fmt::Debug for ResultHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultHandle")
            .field("statement_index", &self.inner.statement_index)
            .field("columns", &self.inner.columns)
            .field("released", &self.is_released())
            .field("total_rows", &self.total_rows())
            .finish_non_exhaustive()
    }
}

impl Serialize for ResultHandle {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let preview = self.preview();
        let mut s = serializer.serialize_struct("ResultHandle", 6)?;
        s.serialize_field("columns", &self.inner.columns)?;
        s.serialize_field("rows", &preview.map(|p| p.rows.as_slice()).unwrap_or_default())?;
        s.serialize_field("has_more", &preview.is_some_and(|p| p.has_more))?;
        s.serialize_field("total_rows", &self.total_rows())?;
        s.serialize_field("truncated", &self.is_truncated())?;
        s.serialize_field("stats", &self.stats())?;
        s.end()
    }
}
