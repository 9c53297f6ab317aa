//! Routing caches the retry policies refresh. Implementations live with the
//! request pipeline; only the contracts are defined here.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RequestError;
use crate::request::ServiceRequest;

/// Resolved identity of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionProperties {
    /// Service-assigned resource id, stable across renames
    pub resource_id: String,
    /// Name-based link, e.g. `dbs/db1/colls/orders`
    pub link: String,
}

/// Partition key range to physical partition map of one collection.
///
/// Treated as opaque by the retry policies; `version` lets callers tell a
/// refreshed map from the one they passed as a hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRoutingMap {
    pub collection_rid: String,
    pub version: String,
}

/// Collection name to id cache.
///
/// `request` is the last request sent for the operation, when there is one;
/// implementations may use it as a hint (routing, session, force flags).
#[async_trait]
pub trait CollectionCache: Send + Sync {
    /// Drop and reload the entry for `collection_link`.
    ///
    /// # Errors
    /// Returns the error of the reload request.
    async fn refresh_collection(
        &self,
        collection_link: &str,
        request: Option<&ServiceRequest>,
    ) -> Result<(), RequestError>;

    /// Resolve the collection behind `collection_link`, loading it if needed.
    ///
    /// # Errors
    /// Returns the error of the lookup request.
    async fn resolve_collection(
        &self,
        collection_link: &str,
        request: Option<&ServiceRequest>,
    ) -> Result<CollectionProperties, RequestError>;
}

/// Partition routing map cache.
#[async_trait]
pub trait PartitionRoutingCache: Send + Sync {
    /// Look up the routing map for `collection_rid`.
    ///
    /// Passing the currently cached map as `previous` forces a refresh when
    /// the cache still holds that map.
    ///
    /// # Errors
    /// Returns the error of the lookup request.
    async fn try_lookup(
        &self,
        collection_rid: &str,
        previous: Option<Arc<PartitionRoutingMap>>,
        request: Option<&ServiceRequest>,
    ) -> Result<Option<Arc<PartitionRoutingMap>>, RequestError>;
}
