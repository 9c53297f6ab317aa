//! Retry policies and the loop that drives them.
//!
//! Each policy understands one failure signature and hands everything else to
//! the successor it owns. A request path builds one chain per logical
//! operation (see [`RetryPolicyChain`]) and runs it through
//! [`execute_request`], which also routes the request before each attempt, or
//! [`execute_with_retry`] when the caller routes on its own.

mod backoff;
mod endpoint_failover;
mod partition_moved;
mod pool_exhausted;
mod stale_collection;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::GlobalEndpointManager;
use crate::error::RequestError;
use crate::request::ServiceRequest;
use crate::routing::{CollectionCache, PartitionRoutingCache};

pub use backoff::{RetryAttempt, execute_request, execute_with_retry, execute_with_retry_and_alternate};
pub use endpoint_failover::EndpointFailoverRetryPolicy;
pub use partition_moved::PartitionMovedRetryPolicy;
pub use pool_exhausted::ConnectionPoolExhaustedRetry;
pub use stale_collection::StaleCollectionCacheRetryPolicy;

/// What to do with a failed attempt.
#[derive(Debug)]
pub enum RetryDecision {
    /// Surface this error (the original or a substitute)
    NoRetry(RequestError),
    /// Try again after the delay
    RetryAfter(Duration),
}

impl RetryDecision {
    /// Retry without waiting.
    #[must_use]
    pub const fn retry_now() -> Self {
        Self::RetryAfter(Duration::ZERO)
    }

    #[must_use]
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::RetryAfter(_))
    }
}

/// One node of a retry chain.
///
/// A policy instance belongs to one logical operation; its counters and
/// flags are not shared across operations.
#[async_trait]
pub trait RetryPolicy: Send {
    /// Decide on a failed attempt.
    async fn should_retry(&mut self, error: RequestError) -> RetryDecision;

    /// Tag the request before every attempt, including the first.
    fn on_before_send_request(&mut self, request: &mut ServiceRequest) {
        let _ = request;
    }
}

/// Terminal node: never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryPolicy;

#[async_trait]
impl RetryPolicy for NoRetryPolicy {
    async fn should_retry(&mut self, error: RequestError) -> RetryDecision {
        RetryDecision::NoRetry(error)
    }
}

/// Builds the standard per-operation chain:
/// stale collection cache, then partition moved, then endpoint failover
/// (which owns the connection pool policy).
#[derive(Clone)]
pub struct RetryPolicyChain {
    manager: GlobalEndpointManager,
    collections: Arc<dyn CollectionCache>,
    partitions: Arc<dyn PartitionRoutingCache>,
}

impl std::fmt::Debug for RetryPolicyChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicyChain")
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl RetryPolicyChain {
    #[must_use]
    pub fn new(
        manager: GlobalEndpointManager,
        collections: Arc<dyn CollectionCache>,
        partitions: Arc<dyn PartitionRoutingCache>,
    ) -> Self {
        Self {
            manager,
            collections,
            partitions,
        }
    }

    /// Fresh chain for one logical operation on `collection_link`.
    #[must_use]
    pub fn for_operation(&self, collection_link: &str) -> Box<dyn RetryPolicy> {
        let failover = EndpointFailoverRetryPolicy::new(self.manager.clone());
        let moved = PartitionMovedRetryPolicy::new(
            Arc::clone(&self.collections),
            Arc::clone(&self.partitions),
            collection_link,
            Box::new(failover),
        );
        Box::new(StaleCollectionCacheRetryPolicy::new(
            Arc::clone(&self.collections),
            collection_link,
            Box::new(moved),
        ))
    }
}
