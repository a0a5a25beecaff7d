//! Stage timeout enforcement
//!
//! External collaborators may hang indefinitely; each stage runs under a
//! deadline so a stuck call cannot hold a worker forever.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Timeout-related errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeoutError {
    /// Stage exceeded its execution deadline
    #[error("stage timed out after {limit:?}")]
    StageTimeout { limit: Duration },
}

/// Run `fut` under `limit`, or unbounded when `limit` is `None`
pub async fn run_with_timeout<F, T>(limit: Option<Duration>, fut: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TimeoutError::StageTimeout { limit }),
        None => Ok(fut.await),
    }
}
