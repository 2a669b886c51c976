//! Async timeout helpers
//!
//! Thin wrappers over [`tokio::time::timeout`] that fold elapse into
//! [`ProtocolError::Timeout`] so callers can keep using `?`.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Default bound for connect and establishment waits
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on flushing the write half when a transport closes
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Await a fallible future, failing with `Timeout` after `duration`
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

/// Await an infallible future, failing with `Timeout` after `duration`
pub async fn with_timeout<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| ProtocolError::Timeout)
}
