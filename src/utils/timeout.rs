//! Async timeout helpers and the default durations used across the engine.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default budget for a single connect attempt or send.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between heartbeats on an otherwise quiet connection.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// A connection with no inbound traffic for this long is considered dead.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace period for open connections when a server shuts down.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Wait on a future for at most `duration`.
///
/// Returns `None` when the deadline passes.
pub async fn with_timeout<F, T>(fut: F, duration: Duration) -> Option<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, fut).await.ok()
}

/// Wait on a fallible future for at most `duration`, mapping the deadline
/// to [`ProtocolError::Timeout`].
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_maps_to_error() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, ProtocolError>(())
        };
        let result = with_timeout_error(slow, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn test_fast_future_passes_through() {
        let value = with_timeout(async { 7 }, Duration::from_secs(1)).await;
        assert_eq!(value, Some(7));
    }
}
