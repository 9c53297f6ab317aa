//! Request descriptor consumed by endpoint resolution and the retry policies.

use url::Url;

/// Operation performed by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum OperationType {
    Read,
    ReadFeed,
    Query,
    Head,
    Create,
    Upsert,
    Replace,
    Patch,
    Delete,
    Execute,
    Batch,
}

impl OperationType {
    /// Whether the operation mutates state and must go to a write region.
    #[must_use]
    pub fn is_write(self) -> bool {
        !matches!(self, Self::Read | Self::ReadFeed | Self::Query | Self::Head)
    }

    #[must_use]
    pub fn kind(self) -> OperationKind {
        if self.is_write() {
            OperationKind::Write
        } else {
            OperationKind::Read
        }
    }
}

/// Read or write, for endpoint resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    Write,
}

/// Resource targeted by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ResourceType {
    Document,
    StoredProcedure,
    Trigger,
    UserDefinedFunction,
    Conflict,
    Collection,
    Database,
    PartitionKeyRange,
    DatabaseAccount,
    Offer,
    User,
    Permission,
}

/// A request as seen by the routing core.
///
/// Retry policies rewrite the routing fields in
/// [`on_before_send_request`](crate::retry::RetryPolicy::on_before_send_request)
/// before every attempt; the transport reads `resolved_endpoint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    pub operation: OperationType,
    pub resource_type: ResourceType,
    /// Name-based link of the target collection, e.g. `dbs/db1/colls/orders`
    pub collection_link: Option<String>,
    /// Explicit region for this request; wins over the configured order when available
    pub preferred_location: Option<String>,
    /// Position in the effective endpoint list to route to
    pub location_index_to_route: Option<usize>,
    /// `false` routes by service-reported order instead of preferred regions
    pub use_preferred_locations: bool,
    /// Fixed endpoint, bypassing resolution
    pub endpoint_override: Option<Url>,
    /// Endpoint the next attempt goes to
    pub resolved_endpoint: Option<Url>,
    /// Ask the collection cache to bypass its entry on this attempt
    pub force_name_cache_refresh: bool,
    /// Ask the partition routing cache to bypass its entry on this attempt
    pub force_partition_map_refresh: bool,
}

impl ServiceRequest {
    #[must_use]
    pub fn new(operation: OperationType, resource_type: ResourceType) -> Self {
        Self {
            operation,
            resource_type,
            collection_link: None,
            preferred_location: None,
            location_index_to_route: None,
            use_preferred_locations: true,
            endpoint_override: None,
            resolved_endpoint: None,
            force_name_cache_refresh: false,
            force_partition_map_refresh: false,
        }
    }

    /// Document read.
    #[must_use]
    pub fn read_document() -> Self {
        Self::new(OperationType::Read, ResourceType::Document)
    }

    /// Document create.
    #[must_use]
    pub fn create_document() -> Self {
        Self::new(OperationType::Create, ResourceType::Document)
    }

    #[must_use]
    pub fn with_collection_link(mut self, link: impl Into<String>) -> Self {
        self.collection_link = Some(link.into());
        self
    }

    #[must_use]
    pub fn with_preferred_location(mut self, region: impl Into<String>) -> Self {
        self.preferred_location = Some(region.into());
        self
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        self.operation.is_write()
    }

    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    /// Route to the `index`-th endpoint of the effective (or service) order.
    pub fn route_to_location_index(&mut self, index: usize, use_preferred_locations: bool) {
        self.location_index_to_route = Some(index);
        self.use_preferred_locations = use_preferred_locations;
        self.endpoint_override = None;
    }

    /// Pin the request to a specific endpoint.
    pub fn route_to_endpoint(&mut self, endpoint: Url) {
        self.endpoint_override = Some(endpoint);
    }

    /// Drop any routing decision of a previous attempt.
    pub fn clear_route(&mut self) {
        self.location_index_to_route = None;
        self.use_preferred_locations = true;
        self.endpoint_override = None;
        self.resolved_endpoint = None;
    }
}
