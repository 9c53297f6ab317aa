use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use url::Url;

use super::{ConnectionPoolExhaustedRetry, RetryDecision, RetryPolicy};
use crate::GlobalEndpointManager;
use crate::error::{RequestError, SubStatusCode};
use crate::request::{OperationKind, ServiceRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RetryRoute {
    location_index: usize,
    use_preferred_locations: bool,
}

/// Cross-region failover: reacts to the routed region refusing or failing the
/// request by marking it unavailable, refreshing the topology and routing the
/// next attempt elsewhere.
///
/// | failure | action |
/// |---|---|
/// | `403` write forbidden | mark write-unavailable, refresh, fail over |
/// | `403` account not found (reads) | mark read-unavailable, refresh, fail over |
/// | transport error (reads) | mark read-unavailable, refresh, fail over |
/// | `503` | next preferred location, once per endpoint |
/// | pool exhaustion | [`ConnectionPoolExhaustedRetry`] |
#[derive(Debug)]
pub struct EndpointFailoverRetryPolicy {
    manager: GlobalEndpointManager,
    pool: ConnectionPoolExhaustedRetry,
    enable_endpoint_discovery: bool,
    max_failover_retries: u32,
    failover_retry_interval: Duration,

    failover_retry_count: u32,
    service_unavailable_retry_count: usize,
    kind: OperationKind,
    can_use_multiple_write_locations: bool,
    route: Option<RetryRoute>,
    location_endpoint: Option<Url>,
}

impl EndpointFailoverRetryPolicy {
    #[must_use]
    pub fn new(manager: GlobalEndpointManager) -> Self {
        let config = manager.config();
        let pool = ConnectionPoolExhaustedRetry::new(&config.pool_exhausted);
        let enable_endpoint_discovery = config.enable_endpoint_discovery;
        let max_failover_retries = config.failover.max_retries;
        let failover_retry_interval = config.failover.retry_interval;
        Self {
            manager,
            pool,
            enable_endpoint_discovery,
            max_failover_retries,
            failover_retry_interval,
            failover_retry_count: 0,
            service_unavailable_retry_count: 0,
            kind: OperationKind::Read,
            can_use_multiple_write_locations: false,
            route: None,
            location_endpoint: None,
        }
    }

    #[must_use]
    pub fn failover_retry_count(&self) -> u32 {
        self.failover_retry_count
    }

    /// Endpoint the last attempt was routed to.
    #[must_use]
    pub fn location_endpoint(&self) -> Option<&Url> {
        self.location_endpoint.as_ref()
    }

    async fn retry_on_endpoint_failure(
        &mut self,
        kind: OperationKind,
        error: RequestError,
    ) -> RetryDecision {
        if !self.enable_endpoint_discovery || self.failover_retry_count >= self.max_failover_retries {
            tracing::debug!(
                retries = self.failover_retry_count,
                error = %error,
                "endpoint failover not possible, giving up"
            );
            return RetryDecision::NoRetry(error);
        }
        self.failover_retry_count += 1;

        if let Some(endpoint) = &self.location_endpoint {
            match kind {
                OperationKind::Read => self.manager.mark_endpoint_unavailable_for_read(endpoint),
                OperationKind::Write => self.manager.mark_endpoint_unavailable_for_write(endpoint),
            }
        }
        if let Err(refresh_error) = self.manager.refresh_location_now().await {
            tracing::debug!(error = %refresh_error, "topology refresh after failover failed");
        }

        let backoff = if self.failover_retry_count > 1 {
            self.failover_retry_interval
        } else {
            Duration::ZERO
        };
        tracing::debug!(
            retry = self.failover_retry_count,
            operation = ?kind,
            backoff_ms = backoff.as_millis(),
            "failing over to next endpoint"
        );
        self.route = Some(RetryRoute {
            location_index: 0,
            use_preferred_locations: true,
        });
        RetryDecision::RetryAfter(backoff)
    }

    fn retry_on_service_unavailable(&mut self, error: RequestError) -> RetryDecision {
        if !self.enable_endpoint_discovery {
            return RetryDecision::NoRetry(error);
        }
        if self.kind == OperationKind::Write && !self.can_use_multiple_write_locations {
            tracing::debug!("service unavailable on the only write region, giving up");
            return RetryDecision::NoRetry(error);
        }

        let endpoints = match self.kind {
            OperationKind::Read => self.manager.read_endpoints().len(),
            OperationKind::Write => self.manager.write_endpoints().len(),
        };
        self.service_unavailable_retry_count += 1;
        if self.service_unavailable_retry_count > endpoints {
            tracing::debug!(endpoints, "service unavailable in every region, giving up");
            return RetryDecision::NoRetry(error);
        }

        tracing::debug!(
            retry = self.service_unavailable_retry_count,
            "service unavailable, trying next preferred location"
        );
        self.route = Some(RetryRoute {
            location_index: self.service_unavailable_retry_count,
            use_preferred_locations: true,
        });
        RetryDecision::retry_now()
    }
}

#[async_trait]
impl RetryPolicy for EndpointFailoverRetryPolicy {
    async fn should_retry(&mut self, error: RequestError) -> RetryDecision {
        if error.is_pool_exhausted() {
            return self.pool.should_retry(error).await;
        }
        if error.is_status_with(StatusCode::FORBIDDEN, SubStatusCode::WRITE_FORBIDDEN) {
            return self
                .retry_on_endpoint_failure(OperationKind::Write, error)
                .await;
        }
        let is_read = self.kind == OperationKind::Read;
        if is_read
            && (error.is_transport()
                || error.is_status_with(
                    StatusCode::FORBIDDEN,
                    SubStatusCode::DATABASE_ACCOUNT_NOT_FOUND,
                ))
        {
            return self
                .retry_on_endpoint_failure(OperationKind::Read, error)
                .await;
        }
        if error.status() == Some(StatusCode::SERVICE_UNAVAILABLE) {
            return self.retry_on_service_unavailable(error);
        }
        RetryDecision::NoRetry(error)
    }

    fn on_before_send_request(&mut self, request: &mut ServiceRequest) {
        self.kind = request.kind();
        self.can_use_multiple_write_locations =
            self.manager.can_use_multiple_write_locations_for(request);

        if let Some(route) = self.route {
            request.route_to_location_index(route.location_index, route.use_preferred_locations);
        }
        let endpoint = self.manager.resolve_service_endpoint(request);
        request.resolved_endpoint = Some(endpoint.clone());
        self.location_endpoint = Some(endpoint);
    }
}
