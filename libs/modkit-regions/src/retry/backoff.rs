//! Turns retry decisions into delayed re-invocations.
//!
//! The loop imposes no ceiling of its own; termination is up to the policy.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use super::{RetryDecision, RetryPolicy};
use crate::error::RequestError;
use crate::request::ServiceRequest;

/// Argument handed to each invocation of the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryAttempt {
    /// 0 for the first attempt
    pub attempt: u32,
    /// Delay the policy asked for before this attempt
    pub backoff: Duration,
}

impl RetryAttempt {
    fn next(self, backoff: Duration) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            backoff,
        }
    }
}

/// Run `operation` until it succeeds or `policy` gives up.
///
/// # Errors
/// Returns the error from the policy's final [`RetryDecision::NoRetry`].
pub async fn execute_with_retry<P, F, Fut, T>(policy: &mut P, mut operation: F) -> Result<T, RequestError>
where
    P: RetryPolicy + ?Sized,
    F: FnMut(RetryAttempt) -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
{
    let mut attempt = RetryAttempt::default();
    loop {
        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        match policy.should_retry(error).await {
            RetryDecision::NoRetry(error) => return Err(error),
            RetryDecision::RetryAfter(delay) => {
                attempt = attempt.next(delay);
                log_retry(attempt, delay);
                sleep_for(delay).await;
            }
        }
    }
}

/// Like [`execute_with_retry`], but runs `alternate` while waiting out any
/// backoff longer than `min_backoff_for_alternate`.
///
/// The alternate's failure is logged and otherwise ignored; the primary is
/// re-invoked once the full backoff has passed, counting the time the
/// alternate took.
///
/// # Errors
/// Returns the error from the policy's final [`RetryDecision::NoRetry`].
pub async fn execute_with_retry_and_alternate<P, F, Fut, A, AFut, T>(
    policy: &mut P,
    mut operation: F,
    mut alternate: A,
    min_backoff_for_alternate: Duration,
) -> Result<T, RequestError>
where
    P: RetryPolicy + ?Sized,
    F: FnMut(RetryAttempt) -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
    A: FnMut(RetryAttempt) -> AFut,
    AFut: Future<Output = Result<(), RequestError>>,
{
    let mut attempt = RetryAttempt::default();
    loop {
        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        match policy.should_retry(error).await {
            RetryDecision::NoRetry(error) => return Err(error),
            RetryDecision::RetryAfter(delay) => {
                attempt = attempt.next(delay);
                log_retry(attempt, delay);
                if delay > min_backoff_for_alternate {
                    let started = Instant::now();
                    if let Err(err) = alternate(attempt).await {
                        tracing::debug!(error = %err, "alternate operation failed during backoff");
                    }
                    sleep_for(delay.saturating_sub(started.elapsed())).await;
                } else {
                    sleep_for(delay).await;
                }
            }
        }
    }
}

/// Request-path variant: lets the policy tag and route the request before
/// every attempt, then hands the routed request to `operation`.
///
/// # Errors
/// Returns the error from the policy's final [`RetryDecision::NoRetry`].
pub async fn execute_request<P, F, Fut, T>(
    policy: &mut P,
    request: &mut ServiceRequest,
    mut operation: F,
) -> Result<T, RequestError>
where
    P: RetryPolicy + ?Sized,
    F: FnMut(ServiceRequest, RetryAttempt) -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
{
    let mut attempt = RetryAttempt::default();
    loop {
        policy.on_before_send_request(request);
        let error = match operation(request.clone(), attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        match policy.should_retry(error).await {
            RetryDecision::NoRetry(error) => return Err(error),
            RetryDecision::RetryAfter(delay) => {
                attempt = attempt.next(delay);
                log_retry(attempt, delay);
                sleep_for(delay).await;
            }
        }
    }
}

fn log_retry(attempt: RetryAttempt, delay: Duration) {
    tracing::debug!(
        retry = attempt.attempt,
        backoff_ms = delay.as_millis(),
        "retrying operation"
    );
}

async fn sleep_for(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
