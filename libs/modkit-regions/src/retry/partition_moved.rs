use std::sync::Arc;

use async_trait::async_trait;

use super::{RetryDecision, RetryPolicy};
use crate::error::{RequestError, SubStatusCode};
use crate::request::ServiceRequest;
use crate::routing::{CollectionCache, PartitionRoutingCache};

/// Retries once after refreshing the partition routing map of a collection
/// whose key range moved (`410 Gone`, sub-status
/// [`SubStatusCode::PARTITION_KEY_RANGE_GONE`]).
pub struct PartitionMovedRetryPolicy {
    collections: Arc<dyn CollectionCache>,
    partitions: Arc<dyn PartitionRoutingCache>,
    collection_link: String,
    next: Box<dyn RetryPolicy>,
    request: Option<ServiceRequest>,
    retried: bool,
    force_refresh_next: bool,
}

impl std::fmt::Debug for PartitionMovedRetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionMovedRetryPolicy")
            .field("collection_link", &self.collection_link)
            .field("retried", &self.retried)
            .finish_non_exhaustive()
    }
}

impl PartitionMovedRetryPolicy {
    #[must_use]
    pub fn new(
        collections: Arc<dyn CollectionCache>,
        partitions: Arc<dyn PartitionRoutingCache>,
        collection_link: impl Into<String>,
        next: Box<dyn RetryPolicy>,
    ) -> Self {
        Self {
            collections,
            partitions,
            collection_link: collection_link.into(),
            next,
            request: None,
            retried: false,
            force_refresh_next: false,
        }
    }
}

#[async_trait]
impl RetryPolicy for PartitionMovedRetryPolicy {
    async fn should_retry(&mut self, error: RequestError) -> RetryDecision {
        if !error.is_gone_with(SubStatusCode::PARTITION_KEY_RANGE_GONE) {
            return self.next.should_retry(error).await;
        }
        if self.retried {
            tracing::debug!("partition moved again after routing map refresh, giving up");
            return RetryDecision::NoRetry(error);
        }

        self.retried = true;
        if let Err(refresh_error) = refresh_routing_map(
            &*self.collections,
            &*self.partitions,
            &self.collection_link,
            self.request.as_ref(),
        )
        .await
        {
            tracing::debug!(error = %refresh_error, "partition routing map refresh failed");
            return RetryDecision::NoRetry(refresh_error);
        }

        self.force_refresh_next = true;
        RetryDecision::retry_now()
    }

    fn on_before_send_request(&mut self, request: &mut ServiceRequest) {
        if self.force_refresh_next {
            request.force_partition_map_refresh = true;
            self.force_refresh_next = false;
        } else if self.retried {
            request.force_partition_map_refresh = false;
        }
        self.request = Some(request.clone());
        self.next.on_before_send_request(request);
    }
}

/// Resolve the collection, then look its routing map up with the cached map as
/// the previous-map hint to force a refresh.
async fn refresh_routing_map(
    collections: &dyn CollectionCache,
    partitions: &dyn PartitionRoutingCache,
    collection_link: &str,
    request: Option<&ServiceRequest>,
) -> Result<(), RequestError> {
    let collection = collections
        .resolve_collection(collection_link, request)
        .await?;
    let cached = partitions
        .try_lookup(&collection.resource_id, None, request)
        .await?;
    let Some(previous) = cached else {
        // nothing cached: the next lookup loads the map from scratch
        return Ok(());
    };

    let refreshed = partitions
        .try_lookup(&collection.resource_id, Some(Arc::clone(&previous)), request)
        .await?;
    let changed = refreshed.is_some_and(|map| map.version != previous.version);
    tracing::debug!(
        collection = %collection.link,
        changed,
        "partition routing map refreshed"
    );
    Ok(())
}
