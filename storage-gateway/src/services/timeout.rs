use std::future::Future;
use std::time::Duration;

/// Errors that can express "the upstream did not answer in time".
pub trait UpstreamTimeout {
    fn upstream_timeout(upstream: &'static str, limit: Duration) -> Self;
}

/// Runs `fut` with an upper bound of `limit`.
pub async fn within<T, E, F>(limit: Duration, upstream: &'static str, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: UpstreamTimeout,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            metrics::counter!("upstream_timeouts_total", "upstream" => upstream).increment(1);
            tracing::warn!(
                upstream = upstream,
                limit_ms = limit.as_millis() as u64,
                "Upstream call timed out"
            );
            Err(E::upstream_timeout(upstream, limit))
        }
    }
}

impl UpstreamTimeout for super::ServiceError {
    fn upstream_timeout(upstream: &'static str, limit: Duration) -> Self {
        super::ServiceError::Timeout(format!("{} did not respond within {:?}", upstream, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ServiceError;

    #[tokio::test]
    async fn test_fast_call_passes_through() {
        let result: Result<u32, ServiceError> =
            within(Duration::from_millis(100), "database", async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let result: Result<u32, ServiceError> =
            within(Duration::from_millis(10), "database", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(7)
            })
            .await;
        assert!(matches!(result, Err(ServiceError::Timeout(_))));
    }
}
