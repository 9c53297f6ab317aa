//! Endpoint ordering and selection from the latest topology, preferred regions and
//! per-endpoint unavailability.
//!
//! The cache performs no I/O. Readers load an immutable snapshot
//! through `ArcSwap` and never block; writers (topology application, marking an
//! endpoint down, lazy expiry) rebuild the snapshot under a short lock that is
//! never held across an await point.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use url::Url;

use crate::config::RegionsConfig;
use crate::request::{OperationKind, OperationType, ResourceType, ServiceRequest};
use crate::topology::{AccountTopology, RegionalEndpoint};

/// Outcome of [`LocationCache::should_refresh_endpoints`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshDecision {
    /// A topology refresh is due
    pub should_refresh: bool,
    /// The refresh may run on the background worker; `false` means the caller
    /// has no usable topology and must fetch before routing
    pub can_refresh_in_background: bool,
}

impl RefreshDecision {
    const NOT_NEEDED: Self = Self {
        should_refresh: false,
        can_refresh_in_background: true,
    };
    const BACKGROUND: Self = Self {
        should_refresh: true,
        can_refresh_in_background: true,
    };
    const SYNCHRONOUS: Self = Self {
        should_refresh: true,
        can_refresh_in_background: false,
    };
}

/// Immutable view published to readers.
#[derive(Debug)]
struct LocationsSnapshot {
    topology: Option<Arc<AccountTopology>>,
    default_endpoint: Url,
    last_updated: Instant,
    read_endpoints: Arc<[Url]>,
    write_endpoints: Arc<[Url]>,
}

/// Regional endpoint cache.
#[derive(Debug)]
pub struct LocationCache {
    default_endpoint: Url,
    preferred_regions: Vec<String>,
    enable_endpoint_discovery: bool,
    use_multiple_write_locations: bool,
    refresh_interval: Duration,
    unavailable_duration: Duration,

    snapshot: ArcSwap<LocationsSnapshot>,
    unavailable_for_read: DashMap<Url, Instant>,
    unavailable_for_write: DashMap<Url, Instant>,
    update_lock: Mutex<()>,
    discovery_newly_enabled: AtomicBool,
}

impl LocationCache {
    /// Create an empty cache. Until a topology is applied everything resolves to
    /// the configured default endpoint.
    #[must_use]
    pub fn new(config: &RegionsConfig) -> Self {
        let default_endpoint = config.default_endpoint.clone();
        let single: Arc<[Url]> = Arc::from(vec![default_endpoint.clone()]);
        let snapshot = LocationsSnapshot {
            topology: None,
            default_endpoint: default_endpoint.clone(),
            last_updated: Instant::now(),
            read_endpoints: Arc::clone(&single),
            write_endpoints: single,
        };

        Self {
            default_endpoint,
            preferred_regions: config.preferred_regions.clone(),
            enable_endpoint_discovery: config.enable_endpoint_discovery,
            use_multiple_write_locations: config.use_multiple_write_locations,
            refresh_interval: config.refresh_interval,
            unavailable_duration: config.unavailable_duration,
            snapshot: ArcSwap::from_pointee(snapshot),
            unavailable_for_read: DashMap::new(),
            unavailable_for_write: DashMap::new(),
            update_lock: Mutex::new(()),
            discovery_newly_enabled: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn preferred_regions(&self) -> &[String] {
        &self.preferred_regions
    }

    /// Default endpoint of the current topology, or the configured one before the first refresh.
    #[must_use]
    pub fn default_endpoint(&self) -> Url {
        self.snapshot.load().default_endpoint.clone()
    }

    /// Latest applied topology.
    #[must_use]
    pub fn topology(&self) -> Option<Arc<AccountTopology>> {
        self.snapshot.load().topology.clone()
    }

    /// Effective read endpoints, most preferred first. Never empty.
    #[must_use]
    pub fn read_endpoints(&self) -> Arc<[Url]> {
        self.purge_expired();
        Arc::clone(&self.snapshot.load().read_endpoints)
    }

    /// Effective write endpoints, most preferred first. Never empty.
    #[must_use]
    pub fn write_endpoints(&self) -> Arc<[Url]> {
        self.purge_expired();
        Arc::clone(&self.snapshot.load().write_endpoints)
    }

    /// Readable region names in service-reported order.
    #[must_use]
    pub fn available_read_regions(&self) -> Vec<String> {
        self.region_names(|t| &t.readable)
    }

    /// Writable region names in service-reported order.
    #[must_use]
    pub fn available_write_regions(&self) -> Vec<String> {
        self.region_names(|t| &t.writable)
    }

    fn region_names(&self, select: impl Fn(&AccountTopology) -> &Vec<RegionalEndpoint>) -> Vec<String> {
        self.snapshot
            .load()
            .topology
            .as_deref()
            .map(|t| select(t).iter().map(|e| e.region().to_owned()).collect())
            .unwrap_or_default()
    }

    /// Replace the topology and recompute the effective lists.
    pub fn on_database_account_read(&self, topology: AccountTopology) {
        let _guard = self.update_lock.lock();
        let previous = self.snapshot.load();
        let was_disabled = previous
            .topology
            .as_deref()
            .is_some_and(|t| !t.endpoint_discovery_enabled);
        if was_disabled && topology.endpoint_discovery_enabled {
            self.discovery_newly_enabled.store(true, Ordering::Release);
        }

        tracing::debug!(
            readable = topology.readable.len(),
            writable = topology.writable.len(),
            multi_write = topology.multiple_write_locations_enabled,
            "applying account topology"
        );
        let next = self.build_snapshot(Some(Arc::new(topology)), Instant::now());
        self.snapshot.store(Arc::new(next));
    }

    pub fn mark_endpoint_unavailable_for_read(&self, endpoint: &Url) {
        self.mark_unavailable(endpoint, OperationKind::Read);
    }

    pub fn mark_endpoint_unavailable_for_write(&self, endpoint: &Url) {
        self.mark_unavailable(endpoint, OperationKind::Write);
    }

    fn mark_unavailable(&self, endpoint: &Url, kind: OperationKind) {
        let now = Instant::now();
        self.unavailable_map(kind).insert(endpoint.clone(), now);
        tracing::info!(
            endpoint = %endpoint,
            operation = ?kind,
            expires_in_secs = self.unavailable_duration.as_secs(),
            "endpoint marked unavailable"
        );
        self.recompute();
    }

    /// Whether `endpoint` is currently excluded for `kind`.
    #[must_use]
    pub fn is_endpoint_unavailable(&self, endpoint: &Url, kind: OperationKind) -> bool {
        self.is_unavailable_at(endpoint, kind, Instant::now())
    }

    /// Client opted in and the account allows writes in several regions.
    #[must_use]
    pub fn can_use_multiple_write_locations(&self) -> bool {
        self.multi_write_usable(self.snapshot.load().topology.as_deref())
    }

    /// [`can_use_multiple_write_locations`](Self::can_use_multiple_write_locations)
    /// and the request is a data-plane operation that multi-region writes apply to.
    #[must_use]
    pub fn can_use_multiple_write_locations_for(&self, request: &ServiceRequest) -> bool {
        self.can_use_multiple_write_locations() && supports_multiple_write_locations(request)
    }

    /// Pick the endpoint for `request`.
    #[must_use]
    pub fn resolve_service_endpoint(&self, request: &ServiceRequest) -> Url {
        if let Some(endpoint) = &request.endpoint_override {
            return endpoint.clone();
        }

        self.purge_expired();
        let snapshot = self.snapshot.load();
        let topology = match snapshot.topology.as_deref() {
            Some(t) if self.discovery_enabled(Some(t)) => t,
            _ => return snapshot.default_endpoint.clone(),
        };

        let kind = request.kind();
        let multi_write =
            self.multi_write_usable(Some(topology)) && supports_multiple_write_locations(request);

        if let Some(region) = request.preferred_location.as_deref()
            && (kind == OperationKind::Read || multi_write)
            && let Some(endpoint) = self.available_in_region(topology, kind, region)
        {
            return endpoint;
        }

        let index = request.location_index_to_route.unwrap_or(0);
        if (kind == OperationKind::Write && !multi_write) || !request.use_preferred_locations {
            let locations = match kind {
                OperationKind::Read => &topology.readable,
                OperationKind::Write => &topology.writable,
            };
            return if locations.is_empty() {
                snapshot.default_endpoint.clone()
            } else {
                locations[index % locations.len()].url().clone()
            };
        }

        let endpoints = match kind {
            OperationKind::Read => &snapshot.read_endpoints,
            OperationKind::Write => &snapshot.write_endpoints,
        };
        endpoints
            .get(index % endpoints.len().max(1))
            .cloned()
            .unwrap_or_else(|| snapshot.default_endpoint.clone())
    }

    /// Decide whether the topology should be fetched again, and whether that may
    /// happen in the background.
    #[must_use]
    pub fn should_refresh_endpoints(&self) -> RefreshDecision {
        if !self.enable_endpoint_discovery {
            return RefreshDecision::NOT_NEEDED;
        }

        self.purge_expired();
        let snapshot = self.snapshot.load();
        let Some(topology) = snapshot.topology.as_deref() else {
            return RefreshDecision::SYNCHRONOUS;
        };

        if self.discovery_newly_enabled.swap(false, Ordering::AcqRel) {
            tracing::debug!("endpoint discovery was enabled by the service, refreshing");
            return RefreshDecision::BACKGROUND;
        }

        let now = Instant::now();
        if now.saturating_duration_since(snapshot.last_updated) >= self.refresh_interval {
            return RefreshDecision::BACKGROUND;
        }

        if !self.discovery_enabled(Some(topology)) {
            return RefreshDecision::NOT_NEEDED;
        }

        if let Some(first_read) = snapshot.read_endpoints.first()
            && self.is_unavailable_at(first_read, OperationKind::Read, now)
        {
            return RefreshDecision::BACKGROUND;
        }

        let most_preferred = self.preferred_regions.first().map(String::as_str);
        if let Some(region) = most_preferred
            && self.preferred_not_leading(
                topology,
                OperationKind::Read,
                region,
                &snapshot.read_endpoints,
                now,
            )
        {
            return RefreshDecision::BACKGROUND;
        }

        if self.multi_write_usable(Some(topology)) {
            if let Some(region) = most_preferred
                && self.preferred_not_leading(
                    topology,
                    OperationKind::Write,
                    region,
                    &snapshot.write_endpoints,
                    now,
                )
            {
                return RefreshDecision::BACKGROUND;
            }
        } else if let Some(first_write) = topology.writable.first()
            && self.is_unavailable_at(first_write.url(), OperationKind::Write, now)
        {
            return RefreshDecision::BACKGROUND;
        }

        RefreshDecision::NOT_NEEDED
    }

    /// The most preferred region is unknown to the topology, unavailable, or
    /// not first in the effective list.
    fn preferred_not_leading(
        &self,
        topology: &AccountTopology,
        kind: OperationKind,
        region: &str,
        effective: &[Url],
        now: Instant,
    ) -> bool {
        let locations = match kind {
            OperationKind::Read => &topology.readable,
            OperationKind::Write => &topology.writable,
        };
        match locations.iter().find(|e| e.is_region(region)) {
            None => true,
            Some(endpoint) => {
                self.is_unavailable_at(endpoint.url(), kind, now)
                    || effective.first() != Some(endpoint.url())
            }
        }
    }

    fn available_in_region(
        &self,
        topology: &AccountTopology,
        kind: OperationKind,
        region: &str,
    ) -> Option<Url> {
        let locations = match kind {
            OperationKind::Read => &topology.readable,
            OperationKind::Write => &topology.writable,
        };
        locations
            .iter()
            .find(|e| e.is_region(region))
            .filter(|e| !self.is_endpoint_unavailable(e.url(), kind))
            .map(|e| e.url().clone())
    }

    fn discovery_enabled(&self, topology: Option<&AccountTopology>) -> bool {
        self.enable_endpoint_discovery && topology.is_none_or(|t| t.endpoint_discovery_enabled)
    }

    fn multi_write_usable(&self, topology: Option<&AccountTopology>) -> bool {
        self.use_multiple_write_locations
            && self.discovery_enabled(topology)
            && topology.is_some_and(|t| t.multiple_write_locations_enabled)
    }

    fn unavailable_map(&self, kind: OperationKind) -> &DashMap<Url, Instant> {
        match kind {
            OperationKind::Read => &self.unavailable_for_read,
            OperationKind::Write => &self.unavailable_for_write,
        }
    }

    fn is_unavailable_at(&self, endpoint: &Url, kind: OperationKind, now: Instant) -> bool {
        self.unavailable_map(kind).get(endpoint).is_some_and(|marked| {
            now.saturating_duration_since(*marked) < self.unavailable_duration
        })
    }

    /// Drop expired unavailability entries; rebuild the lists if any were dropped.
    fn purge_expired(&self) {
        if self.unavailable_for_read.is_empty() && self.unavailable_for_write.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut expired = false;
        for map in [&self.unavailable_for_read, &self.unavailable_for_write] {
            map.retain(|endpoint, marked| {
                let keep = now.saturating_duration_since(*marked) < self.unavailable_duration;
                if !keep {
                    tracing::debug!(endpoint = %endpoint, "endpoint unavailability expired");
                    expired = true;
                }
                keep
            });
        }
        if expired {
            self.recompute();
        }
    }

    /// Rebuild the derived lists for the current topology.
    fn recompute(&self) {
        let _guard = self.update_lock.lock();
        let current = self.snapshot.load();
        let next = self.build_snapshot(current.topology.clone(), current.last_updated);
        self.snapshot.store(Arc::new(next));
    }

    fn build_snapshot(
        &self,
        topology: Option<Arc<AccountTopology>>,
        last_updated: Instant,
    ) -> LocationsSnapshot {
        let now = Instant::now();
        let default_endpoint = topology
            .as_deref()
            .map_or(&self.default_endpoint, |t| &t.default_endpoint)
            .clone();

        let (read_endpoints, write_endpoints) = match topology.as_deref() {
            Some(t) if self.discovery_enabled(Some(t)) => {
                let multi_write = self.multi_write_usable(Some(t));
                let write = self.effective_endpoints(
                    &t.writable,
                    OperationKind::Write,
                    multi_write,
                    &default_endpoint,
                    now,
                );
                // Reads fall back to the primary write region before the global endpoint.
                let read_fallback = write.first().unwrap_or(&default_endpoint).clone();
                let read = self.effective_endpoints(
                    &t.readable,
                    OperationKind::Read,
                    true,
                    &read_fallback,
                    now,
                );
                (read, write)
            }
            _ => {
                let single: Arc<[Url]> = Arc::from(vec![default_endpoint.clone()]);
                (Arc::clone(&single), single)
            }
        };

        LocationsSnapshot {
            topology,
            default_endpoint,
            last_updated,
            read_endpoints,
            write_endpoints,
        }
    }

    /// Preferred regions known to the topology first, then the remaining regions in
    /// service order; duplicates and unavailable endpoints dropped; `fallback` if
    /// nothing is left.
    fn effective_endpoints(
        &self,
        locations: &[RegionalEndpoint],
        kind: OperationKind,
        honor_preferred: bool,
        fallback: &Url,
        now: Instant,
    ) -> Arc<[Url]> {
        let mut ordered: Vec<&RegionalEndpoint> = Vec::with_capacity(locations.len());
        if honor_preferred {
            for region in &self.preferred_regions {
                if let Some(endpoint) = locations.iter().find(|e| e.is_region(region)) {
                    ordered.push(endpoint);
                }
            }
        }
        ordered.extend(locations.iter());

        let mut endpoints: Vec<Url> = Vec::with_capacity(locations.len());
        for endpoint in ordered {
            let url = endpoint.url();
            if endpoints.contains(url) || self.is_unavailable_at(url, kind, now) {
                continue;
            }
            endpoints.push(url.clone());
        }
        if endpoints.is_empty() {
            endpoints.push(fallback.clone());
        }
        Arc::from(endpoints)
    }
}

fn supports_multiple_write_locations(request: &ServiceRequest) -> bool {
    match request.resource_type {
        ResourceType::Document => true,
        ResourceType::StoredProcedure => request.operation == OperationType::Execute,
        _ => false,
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn config(preferred: &[&str]) -> RegionsConfig {
        RegionsConfig::new(url("https://acct.example/"))
            .with_preferred_regions(preferred.iter().copied())
    }

    fn topology() -> AccountTopology {
        AccountTopology::single_endpoint(url("https://acct.example/"))
            .with_readable(vec![
                RegionalEndpoint::new("West US", url("https://acct-westus.example/")),
                RegionalEndpoint::new("East US", url("https://acct-eastus.example/")),
                RegionalEndpoint::new("North Europe", url("https://acct-northeurope.example/")),
            ])
            .with_writable(vec![
                RegionalEndpoint::new("West US", url("https://acct-westus.example/")),
                RegionalEndpoint::new("East US", url("https://acct-eastus.example/")),
            ])
    }

    fn as_strs(endpoints: &[Url]) -> Vec<&str> {
        endpoints.iter().map(Url::as_str).collect()
    }

    #[test]
    fn before_first_topology_everything_is_the_default_endpoint() {
        let cache = LocationCache::new(&config(&["East US"]));
        assert_eq!(as_strs(&cache.read_endpoints()), ["https://acct.example/"]);
        assert_eq!(as_strs(&cache.write_endpoints()), ["https://acct.example/"]);
        assert_eq!(
            cache.resolve_service_endpoint(&ServiceRequest::read_document()).as_str(),
            "https://acct.example/"
        );
        assert!(cache.topology().is_none());
    }

    #[test]
    fn preferred_regions_lead_and_remaining_regions_follow() {
        let cache = LocationCache::new(&config(&["north europe", "East US"]));
        cache.on_database_account_read(topology());

        assert_eq!(
            as_strs(&cache.read_endpoints()),
            [
                "https://acct-northeurope.example/",
                "https://acct-eastus.example/",
                "https://acct-westus.example/",
            ]
        );
    }

    #[test]
    fn no_preferred_regions_keeps_service_order() {
        let cache = LocationCache::new(&config(&[]));
        cache.on_database_account_read(topology());
        assert_eq!(
            as_strs(&cache.read_endpoints()),
            [
                "https://acct-westus.example/",
                "https://acct-eastus.example/",
                "https://acct-northeurope.example/",
            ]
        );
    }

    #[test]
    fn effective_lists_never_contain_duplicates() {
        let cache = LocationCache::new(&config(&["East US", "east us", "West US"]));
        let mut t = topology();
        t.readable
            .push(RegionalEndpoint::new("East US 2", url("https://acct-eastus.example/")));
        cache.on_database_account_read(t);

        let reads = cache.read_endpoints();
        let unique: HashSet<_> = reads.iter().collect();
        assert_eq!(unique.len(), reads.len());
    }

    #[test]
    fn discovery_disabled_degenerates_to_default() {
        let mut cfg = config(&["East US"]);
        cfg.enable_endpoint_discovery = false;
        let cache = LocationCache::new(&cfg);
        cache.on_database_account_read(topology().with_multiple_write_locations(true));

        assert_eq!(as_strs(&cache.read_endpoints()), ["https://acct.example/"]);
        assert_eq!(as_strs(&cache.write_endpoints()), ["https://acct.example/"]);
        assert_eq!(
            cache.resolve_service_endpoint(&ServiceRequest::create_document()).as_str(),
            "https://acct.example/"
        );
        assert_eq!(cache.should_refresh_endpoints(), RefreshDecision::NOT_NEEDED);
    }

    #[test]
    fn service_disabling_discovery_degenerates_to_default() {
        let cache = LocationCache::new(&config(&[]));
        cache.on_database_account_read(topology().with_endpoint_discovery(false));
        assert_eq!(as_strs(&cache.read_endpoints()), ["https://acct.example/"]);
    }

    #[test]
    fn all_unavailable_falls_back_to_default() {
        let cache = LocationCache::new(&config(&[]));
        cache.on_database_account_read(topology());
        for endpoint in topology().writable {
            cache.mark_endpoint_unavailable_for_write(endpoint.url());
        }
        for endpoint in topology().readable {
            cache.mark_endpoint_unavailable_for_read(endpoint.url());
        }

        assert_eq!(as_strs(&cache.write_endpoints()), ["https://acct.example/"]);
        assert_eq!(as_strs(&cache.read_endpoints()), ["https://acct.example/"]);
    }

    #[test]
    fn reads_fall_back_to_primary_write_region_when_no_readable_regions() {
        let cache = LocationCache::new(&config(&[]));
        cache.on_database_account_read(topology().with_readable(Vec::new()));
        assert_eq!(as_strs(&cache.read_endpoints()), ["https://acct-westus.example/"]);
    }

    #[test]
    fn single_write_resolves_to_first_service_write_region() {
        let cache = LocationCache::new(&config(&["East US"]));
        cache.on_database_account_read(topology());

        let write = ServiceRequest::create_document();
        assert_eq!(
            cache.resolve_service_endpoint(&write).as_str(),
            "https://acct-westus.example/"
        );
        // reads still honour preferred regions
        assert_eq!(
            cache.resolve_service_endpoint(&ServiceRequest::read_document()).as_str(),
            "https://acct-eastus.example/"
        );
    }

    #[test]
    fn explicit_request_location_wins_when_available() {
        let cache = LocationCache::new(&config(&["West US"]));
        cache.on_database_account_read(topology());

        let request = ServiceRequest::read_document().with_preferred_location("NORTH EUROPE");
        assert_eq!(
            cache.resolve_service_endpoint(&request).as_str(),
            "https://acct-northeurope.example/"
        );

        cache.mark_endpoint_unavailable_for_read(&url("https://acct-northeurope.example/"));
        assert_eq!(
            cache.resolve_service_endpoint(&request).as_str(),
            "https://acct-westus.example/"
        );
    }

    #[test]
    fn location_index_wraps_around_effective_list() {
        let cache = LocationCache::new(&config(&[]));
        cache.on_database_account_read(topology());

        let mut request = ServiceRequest::read_document();
        request.route_to_location_index(4, true);
        assert_eq!(
            cache.resolve_service_endpoint(&request).as_str(),
            "https://acct-eastus.example/"
        );
    }

    #[test]
    fn endpoint_override_bypasses_resolution() {
        let cache = LocationCache::new(&config(&[]));
        cache.on_database_account_read(topology());
        let mut request = ServiceRequest::read_document();
        request.route_to_endpoint(url("https://pinned.example/"));
        assert_eq!(
            cache.resolve_service_endpoint(&request).as_str(),
            "https://pinned.example/"
        );
    }

    #[test]
    fn multi_write_only_for_data_plane_requests() {
        let cache = LocationCache::new(&config(&[]));
        cache.on_database_account_read(topology().with_multiple_write_locations(true));

        assert!(cache.can_use_multiple_write_locations());
        assert!(cache.can_use_multiple_write_locations_for(&ServiceRequest::create_document()));
        assert!(cache.can_use_multiple_write_locations_for(&ServiceRequest::new(
            OperationType::Execute,
            ResourceType::StoredProcedure,
        )));
        assert!(!cache.can_use_multiple_write_locations_for(&ServiceRequest::new(
            OperationType::Create,
            ResourceType::StoredProcedure,
        )));
        assert!(!cache.can_use_multiple_write_locations_for(&ServiceRequest::new(
            OperationType::Create,
            ResourceType::Collection,
        )));
    }

    #[test]
    fn client_opt_out_disables_multi_write() {
        let mut cfg = config(&[]);
        cfg.use_multiple_write_locations = false;
        let cache = LocationCache::new(&cfg);
        cache.on_database_account_read(topology().with_multiple_write_locations(true));
        assert!(!cache.can_use_multiple_write_locations());
    }

    #[test]
    fn region_names_follow_service_order() {
        let cache = LocationCache::new(&config(&["East US"]));
        assert!(cache.available_read_regions().is_empty());
        cache.on_database_account_read(topology());
        assert_eq!(cache.available_write_regions(), ["West US", "East US"]);
        assert_eq!(cache.available_read_regions().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailability_expires_lazily() {
        let cache = LocationCache::new(&config(&[]));
        cache.on_database_account_read(topology());
        let west = url("https://acct-westus.example/");

        cache.mark_endpoint_unavailable_for_read(&west);
        assert_ne!(cache.resolve_service_endpoint(&ServiceRequest::read_document()), west);
        assert!(cache.is_endpoint_unavailable(&west, OperationKind::Read));
        assert!(!cache.is_endpoint_unavailable(&west, OperationKind::Write));

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(!cache.read_endpoints().contains(&west));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.read_endpoints()[0], west);
        assert_eq!(cache.resolve_service_endpoint(&ServiceRequest::read_document()), west);
    }

    #[tokio::test(start_paused = true)]
    async fn remarking_extends_unavailability() {
        let cache = LocationCache::new(&config(&[]));
        cache.on_database_account_read(topology());
        let west = url("https://acct-westus.example/");

        cache.mark_endpoint_unavailable_for_read(&west);
        tokio::time::advance(Duration::from_secs(200)).await;
        cache.mark_endpoint_unavailable_for_read(&west);
        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(!cache.read_endpoints().contains(&west));
    }

    #[test]
    fn refresh_is_synchronous_only_before_first_topology() {
        let cache = LocationCache::new(&config(&[]));
        assert_eq!(cache.should_refresh_endpoints(), RefreshDecision::SYNCHRONOUS);

        cache.on_database_account_read(topology());
        assert_eq!(cache.should_refresh_endpoints(), RefreshDecision::NOT_NEEDED);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_due_after_interval() {
        let cache = LocationCache::new(&config(&[]));
        cache.on_database_account_read(topology());
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(cache.should_refresh_endpoints(), RefreshDecision::BACKGROUND);
    }

    #[test]
    fn refresh_when_first_read_endpoint_unavailable() {
        let cache = LocationCache::new(&config(&[]));
        cache.on_database_account_read(topology());
        // all readable regions down: the fallback leads and is unavailable too
        for endpoint in topology().readable {
            cache.mark_endpoint_unavailable_for_read(endpoint.url());
        }
        cache.mark_endpoint_unavailable_for_read(&url("https://acct-westus.example/"));
        assert!(cache.should_refresh_endpoints().should_refresh);
    }

    #[test]
    fn refresh_when_single_write_region_unavailable() {
        let cache = LocationCache::new(&config(&[]));
        cache.on_database_account_read(topology());
        cache.mark_endpoint_unavailable_for_write(&url("https://acct-westus.example/"));
        assert_eq!(cache.should_refresh_endpoints(), RefreshDecision::BACKGROUND);
    }

    #[test]
    fn refresh_when_most_preferred_region_missing() {
        let cache = LocationCache::new(&config(&["Central India"]));
        cache.on_database_account_read(topology());
        assert_eq!(cache.should_refresh_endpoints(), RefreshDecision::BACKGROUND);
    }

    #[test]
    fn refresh_when_most_preferred_region_marked_unavailable() {
        let cache = LocationCache::new(&config(&["East US", "West US"]));
        cache.on_database_account_read(topology());
        assert_eq!(cache.should_refresh_endpoints(), RefreshDecision::NOT_NEEDED);

        cache.mark_endpoint_unavailable_for_read(&url("https://acct-eastus.example/"));
        assert_eq!(
            cache.read_endpoints()[0].as_str(),
            "https://acct-westus.example/"
        );
        assert_eq!(cache.should_refresh_endpoints(), RefreshDecision::BACKGROUND);
    }

    #[test]
    fn refresh_when_most_preferred_write_region_marked_unavailable() {
        let cache = LocationCache::new(&config(&["East US", "West US"]));
        cache.on_database_account_read(topology().with_multiple_write_locations(true));
        assert_eq!(cache.should_refresh_endpoints(), RefreshDecision::NOT_NEEDED);

        cache.mark_endpoint_unavailable_for_write(&url("https://acct-eastus.example/"));
        assert_eq!(cache.should_refresh_endpoints(), RefreshDecision::BACKGROUND);
    }

    #[test]
    fn refresh_once_when_service_enables_discovery() {
        let cache = LocationCache::new(&config(&[]));
        cache.on_database_account_read(topology().with_endpoint_discovery(false));
        assert_eq!(cache.should_refresh_endpoints(), RefreshDecision::NOT_NEEDED);

        cache.on_database_account_read(topology());
        assert_eq!(cache.should_refresh_endpoints(), RefreshDecision::BACKGROUND);
        assert_eq!(cache.should_refresh_endpoints(), RefreshDecision::NOT_NEEDED);
    }

    #[test]
    fn concurrent_readers_see_consistent_lists() {
        let cache = LocationCache::new(&config(&["East US"]));
        cache.on_database_account_read(topology());

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..500 {
                        let reads = cache.read_endpoints();
                        assert!(!reads.is_empty());
                        let unique: HashSet<_> = reads.iter().collect();
                        assert_eq!(unique.len(), reads.len());
                    }
                });
            }
            scope.spawn(|| {
                for i in 0..200 {
                    if i % 2 == 0 {
                        cache.mark_endpoint_unavailable_for_read(&url(
                            "https://acct-eastus.example/",
                        ));
                    }
                    cache.on_database_account_read(topology());
                }
            });
        });
    }
}
