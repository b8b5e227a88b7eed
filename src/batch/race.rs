//! Wait-any over a unit of work, a deadline and a cancellation token.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How a raced future ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Race<T> {
    /// The work finished first.
    Completed(T),
    /// The deadline passed first.
    TimedOut,
    /// The token was cancelled first.
    Cancelled,
}

impl<T> Race<T> {
    /// Returns the completed value, if any.
    pub fn completed(self) -> Option<T> {
        match self {
            Race::Completed(value) => Some(value),
            Race::TimedOut | Race::Cancelled => None,
        }
    }
}

/// Drives `work` until it completes, `limit` elapses, or `cancel` fires.
///
/// Cancellation wins ties, then completion, then the deadline. A `None` limit
/// or token never fires. The work future is dropped when it loses.
pub async fn race<F>(
    work: F,
    limit: Option<Duration>,
    cancel: Option<&CancellationToken>,
) -> Race<F::Output>
where
    F: Future,
{
    let cancelled = async {
        match cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending::<()>().await,
        }
    };
    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;

        _ = cancelled => Race::Cancelled,
        value = work => Race::Completed(value),
        _ = deadline => Race::TimedOut,
    }
}
