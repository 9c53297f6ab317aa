use std::sync::Arc;

use async_trait::async_trait;

use super::{RetryDecision, RetryPolicy};
use crate::error::{RequestError, SubStatusCode};
use crate::request::ServiceRequest;
use crate::routing::CollectionCache;

/// Retries once after refreshing a stale collection name cache entry
/// (`410 Gone`, sub-status [`SubStatusCode::NAME_CACHE_IS_STALE`]).
///
/// The collection link is fixed at construction; the last request seen in
/// [`on_before_send_request`](RetryPolicy::on_before_send_request) is only
/// passed to the cache as a hint.
pub struct StaleCollectionCacheRetryPolicy {
    collections: Arc<dyn CollectionCache>,
    collection_link: String,
    next: Box<dyn RetryPolicy>,
    request: Option<ServiceRequest>,
    retried: bool,
    force_refresh_next: bool,
}

impl std::fmt::Debug for StaleCollectionCacheRetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaleCollectionCacheRetryPolicy")
            .field("collection_link", &self.collection_link)
            .field("retried", &self.retried)
            .finish_non_exhaustive()
    }
}

impl StaleCollectionCacheRetryPolicy {
    #[must_use]
    pub fn new(
        collections: Arc<dyn CollectionCache>,
        collection_link: impl Into<String>,
        next: Box<dyn RetryPolicy>,
    ) -> Self {
        Self {
            collections,
            collection_link: collection_link.into(),
            next,
            request: None,
            retried: false,
            force_refresh_next: false,
        }
    }
}

#[async_trait]
impl RetryPolicy for StaleCollectionCacheRetryPolicy {
    async fn should_retry(&mut self, error: RequestError) -> RetryDecision {
        if !error.is_gone_with(SubStatusCode::NAME_CACHE_IS_STALE) {
            return self.next.should_retry(error).await;
        }
        if self.retried {
            tracing::debug!("collection cache still stale after refresh, giving up");
            return RetryDecision::NoRetry(error);
        }

        self.retried = true;
        let link = self.collection_link.as_str();
        tracing::debug!(collection = %link, "collection cache is stale, refreshing");
        if let Err(refresh_error) = self
            .collections
            .refresh_collection(link, self.request.as_ref())
            .await
        {
            tracing::debug!(
                collection = %link,
                error = %refresh_error,
                "collection cache refresh failed"
            );
            return RetryDecision::NoRetry(refresh_error);
        }

        self.force_refresh_next = true;
        RetryDecision::retry_now()
    }

    fn on_before_send_request(&mut self, request: &mut ServiceRequest) {
        if self.force_refresh_next {
            request.force_name_cache_refresh = true;
            self.force_refresh_next = false;
        } else if self.retried {
            request.force_name_cache_refresh = false;
        }
        self.request = Some(request.clone());
        self.next.on_before_send_request(request);
    }
}
