#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Multi-region endpoint management and retry coordination for `ModKit`
//!
//! This crate provides:
//! - A lock-free [`LocationCache`] that orders regional endpoints by preferred
//!   region and health
//! - A [`GlobalEndpointManager`] that keeps the account topology fresh on a
//!   background worker
//! - Retry policies for stale routing caches, moved partitions, exhausted
//!   connection pools and regional failover, chained per operation
//! - A retry loop that turns policy decisions into delayed re-invocations
//!
//! # Example
//!
//! ```ignore
//! use modkit_regions::{GlobalEndpointManager, RegionsConfig, ServiceRequest};
//! use modkit_regions::retry::{RetryPolicyChain, execute_request};
//!
//! let config = RegionsConfig::load("config/regions.yaml")?;
//! let manager = GlobalEndpointManager::connect_http(config).await?;
//!
//! let chain = RetryPolicyChain::new(manager.clone(), collections, partitions);
//! let mut policy = chain.for_operation("dbs/db1/colls/orders");
//! let mut request = ServiceRequest::read_document().with_collection_link("dbs/db1/colls/orders");
//!
//! let doc = execute_request(policy.as_mut(), &mut request, |routed, _attempt| {
//!     transport.send(routed)
//! })
//! .await?;
//! ```

mod config;
mod endpoint_manager;
mod error;
mod fetch;
mod location_cache;
mod request;
pub mod retry;
mod routing;
mod topology;

pub use config::{ENV_PREFIX, FailoverConfig, FetchConfig, PoolExhaustedRetryConfig, RegionsConfig};
pub use endpoint_manager::GlobalEndpointManager;
pub use error::{ConnectionPoolExhausted, FetchError, RegionsError, RequestError, SubStatusCode};
pub use fetch::{HttpTopologyFetcher, TopologyFetcher};
pub use location_cache::{LocationCache, RefreshDecision};
pub use request::{OperationKind, OperationType, ResourceType, ServiceRequest};
pub use routing::{CollectionCache, CollectionProperties, PartitionRoutingCache, PartitionRoutingMap};
pub use topology::{
    AccountTopology, AccountTopologyDocument, LocationDocument, RegionalEndpoint,
    regional_endpoint_url,
};
