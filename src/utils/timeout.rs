//! Timeout constants and async helpers.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default time allowed for establishing a connection.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between consumer ticks draining the dispatch queue.
pub const TICK_INTERVAL: Duration = Duration::from_millis(20);

/// Interval between latency probes.
pub const PING_INTERVAL: Duration = Duration::from_secs(1);

/// Age after which an unanswered latency probe counts as lost.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for a throughput test to collect its acknowledgements.
pub const THROUGHPUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Run `future`, failing with [`ProtocolError::Timeout`] after `duration`.
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn elapsed_future_maps_to_timeout() {
        let result: Result<()> = with_timeout_error(
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            },
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn inner_result_is_passed_through() {
        let result = with_timeout_error(async { Ok(7) }, Duration::from_secs(1)).await;
        assert_eq!(result.unwrap(), 7);
    }
}
