use std::time::Duration;

use async_trait::async_trait;

use super::{RetryDecision, RetryPolicy};
use crate::config::PoolExhaustedRetryConfig;
use crate::error::RequestError;

/// Bounded fixed-wait retries while the connection pool is exhausted.
///
/// Innermost policy for its error class: callers route only pool exhaustion
/// here, so any other error is logged as misuse and surfaced as-is.
#[derive(Debug, Clone)]
pub struct ConnectionPoolExhaustedRetry {
    retry_count: u32,
    max_retries: u32,
    wait: Duration,
}

impl Default for ConnectionPoolExhaustedRetry {
    fn default() -> Self {
        Self::new(&PoolExhaustedRetryConfig::default())
    }
}

impl ConnectionPoolExhaustedRetry {
    #[must_use]
    pub fn new(config: &PoolExhaustedRetryConfig) -> Self {
        Self {
            retry_count: 0,
            max_retries: config.max_retries,
            wait: config.wait,
        }
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

#[async_trait]
impl RetryPolicy for ConnectionPoolExhaustedRetry {
    async fn should_retry(&mut self, error: RequestError) -> RetryDecision {
        if !error.is_pool_exhausted() {
            tracing::error!(
                error = %error,
                "connection pool retry invoked for an error that is not pool exhaustion"
            );
            return RetryDecision::NoRetry(error);
        }

        self.retry_count += 1;
        if self.retry_count > self.max_retries {
            tracing::debug!(
                retries = self.max_retries,
                "connection pool still exhausted, giving up"
            );
            return RetryDecision::NoRetry(error);
        }

        tracing::debug!(
            retry = self.retry_count,
            backoff_ms = self.wait.as_millis(),
            "connection pool exhausted, retrying"
        );
        RetryDecision::RetryAfter(self.wait)
    }
}
