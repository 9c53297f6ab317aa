//! Lifecycle owner of the [`LocationCache`]: initial and periodic topology refresh.
//!
//! All background refreshes run on one worker task fed by a command queue, so
//! they never overlap each other. Foreground callers only read cached state;
//! the in-flight flag keeps foreground and background fetches from overlapping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::RegionsConfig;
use crate::error::RegionsError;
use crate::fetch::{HttpTopologyFetcher, TopologyFetcher};
use crate::location_cache::LocationCache;
use crate::request::ServiceRequest;
use crate::topology::{AccountTopology, regional_endpoint_url};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerCommand {
    /// Fetch after the delay unless an earlier fetch is already armed
    Arm(Duration),
    /// Fetch now if the cache reports a refresh is due
    RefreshIfDue,
}

/// Clears the in-flight flag when dropped, including on error paths, and
/// wakes callers waiting in [`InFlightGuard::acquire`].
struct InFlightGuard<'a>(&'a Inner);

impl<'a> InFlightGuard<'a> {
    fn try_acquire(inner: &'a Inner) -> Option<Self> {
        inner
            .refresh_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(inner))
    }

    /// Wait until no other refresh is in flight, then take the flag.
    async fn acquire(inner: &'a Inner) -> Self {
        loop {
            let released = inner.refresh_released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if let Some(guard) = Self::try_acquire(inner) {
                return guard;
            }
            released.await;
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.refresh_in_flight.store(false, Ordering::Release);
        self.0.refresh_released.notify_waiters();
    }
}

struct Inner {
    config: RegionsConfig,
    cache: LocationCache,
    fetcher: Arc<dyn TopologyFetcher>,
    refresh_in_flight: AtomicBool,
    refresh_released: Notify,
    armed_once: AtomicBool,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    pending_receiver: Mutex<Option<mpsc::UnboundedReceiver<WorkerCommand>>>,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Multi-region endpoint manager.
///
/// Cheap to clone; clones share the cache and the background worker. The
/// worker stops on [`close`](Self::close) or when the last clone is dropped.
#[derive(Clone)]
pub struct GlobalEndpointManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for GlobalEndpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalEndpointManager")
            .field("default_endpoint", &self.inner.config.default_endpoint.as_str())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl GlobalEndpointManager {
    /// Create a manager without touching the network.
    ///
    /// Call [`init`](Self::init) before routing requests, or use
    /// [`connect`](Self::connect).
    ///
    /// # Errors
    /// Returns [`RegionsError::Config`] if the configuration is invalid.
    pub fn new(config: RegionsConfig, fetcher: Arc<dyn TopologyFetcher>) -> Result<Self, RegionsError> {
        config.validate()?;
        let (commands, receiver) = mpsc::unbounded_channel();
        let cache = LocationCache::new(&config);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                cache,
                fetcher,
                refresh_in_flight: AtomicBool::new(false),
                refresh_released: Notify::new(),
                armed_once: AtomicBool::new(false),
                commands,
                pending_receiver: Mutex::new(Some(receiver)),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// [`new`](Self::new) followed by [`init`](Self::init).
    ///
    /// # Errors
    /// Returns the configuration error or the last fetch error.
    pub async fn connect(
        config: RegionsConfig,
        fetcher: Arc<dyn TopologyFetcher>,
    ) -> Result<Self, RegionsError> {
        let manager = Self::new(config, fetcher)?;
        manager.init().await?;
        Ok(manager)
    }

    /// Connect using the HTTP topology fetcher.
    ///
    /// # Errors
    /// Returns the configuration error, a TLS setup error or the last fetch error.
    pub async fn connect_http(config: RegionsConfig) -> Result<Self, RegionsError> {
        config.validate()?;
        let fetcher = HttpTopologyFetcher::new(&config).map_err(|source| RegionsError::Fetch {
            endpoint: config.default_endpoint.clone(),
            source,
        })?;
        Self::connect(config, Arc::new(fetcher)).await
    }

    /// Fetch the topology once, blocking until it arrives, then start periodic refresh.
    ///
    /// Waits for a refresh already in flight to finish before fetching.
    ///
    /// # Errors
    /// Returns [`RegionsError::Closed`] after [`close`](Self::close), or the
    /// last fetch error if no location answered.
    pub async fn init(&self) -> Result<(), RegionsError> {
        if self.is_closed() {
            return Err(RegionsError::Closed);
        }
        self.ensure_worker();

        let guard = InFlightGuard::acquire(&self.inner).await;
        let topology = self.inner.fetch_from_any_location().await?;
        self.inner.cache.on_database_account_read(topology);
        drop(guard);
        self.arm(self.inner.config.refresh_interval);

        tracing::info!(
            default_endpoint = %self.inner.config.default_endpoint,
            read_endpoints = self.inner.cache.read_endpoints().len(),
            write_endpoints = self.inner.cache.write_endpoints().len(),
            "global endpoint manager initialised"
        );
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &RegionsConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn location_cache(&self) -> &LocationCache {
        &self.inner.cache
    }

    #[must_use]
    pub fn default_endpoint(&self) -> Url {
        self.inner.cache.default_endpoint()
    }

    #[must_use]
    pub fn topology(&self) -> Option<Arc<AccountTopology>> {
        self.inner.cache.topology()
    }

    #[must_use]
    pub fn resolve_service_endpoint(&self, request: &ServiceRequest) -> Url {
        self.inner.cache.resolve_service_endpoint(request)
    }

    #[must_use]
    pub fn read_endpoints(&self) -> Arc<[Url]> {
        self.inner.cache.read_endpoints()
    }

    #[must_use]
    pub fn write_endpoints(&self) -> Arc<[Url]> {
        self.inner.cache.write_endpoints()
    }

    #[must_use]
    pub fn can_use_multiple_write_locations(&self) -> bool {
        self.inner.cache.can_use_multiple_write_locations()
    }

    #[must_use]
    pub fn can_use_multiple_write_locations_for(&self, request: &ServiceRequest) -> bool {
        self.inner.cache.can_use_multiple_write_locations_for(request)
    }

    /// Exclude `endpoint` for reads and ask the worker to re-check the topology.
    pub fn mark_endpoint_unavailable_for_read(&self, endpoint: &Url) {
        self.inner.cache.mark_endpoint_unavailable_for_read(endpoint);
        self.request_refresh_if_due();
    }

    /// Exclude `endpoint` for writes and ask the worker to re-check the topology.
    pub fn mark_endpoint_unavailable_for_write(&self, endpoint: &Url) {
        self.inner.cache.mark_endpoint_unavailable_for_write(endpoint);
        self.request_refresh_if_due();
    }

    /// Refresh the location cache.
    ///
    /// A supplied topology is applied directly. Otherwise the cache decides:
    /// without any topology yet the fetch happens inline, else a background
    /// refresh is scheduled and the call returns at once. Returns `Ok(())`
    /// immediately if another refresh is in flight or the manager is closed.
    ///
    /// # Errors
    /// Returns the last fetch error of an inline fetch.
    pub async fn refresh_location_async(
        &self,
        topology: Option<AccountTopology>,
    ) -> Result<(), RegionsError> {
        if self.is_closed() {
            return Ok(());
        }
        let Some(_guard) = InFlightGuard::try_acquire(&self.inner) else {
            tracing::debug!("topology refresh already in flight");
            return Ok(());
        };

        if let Some(topology) = topology {
            self.inner.cache.on_database_account_read(topology);
            return Ok(());
        }

        let decision = self.inner.cache.should_refresh_endpoints();
        if !decision.should_refresh {
            return Ok(());
        }

        if decision.can_refresh_in_background {
            let delay = if self.inner.armed_once.load(Ordering::Acquire) {
                self.inner.config.refresh_interval
            } else {
                Duration::ZERO
            };
            tracing::debug!(delay_ms = delay.as_millis(), "scheduling background topology refresh");
            self.arm(delay);
            return Ok(());
        }

        let topology = self.inner.fetch_from_any_location().await?;
        self.inner.cache.on_database_account_read(topology);
        self.arm(self.inner.config.refresh_interval);
        Ok(())
    }

    /// Fetch and apply the topology now, whatever the cache says. Used after a
    /// failover, when the routed region stopped serving the request.
    ///
    /// Returns `Ok(())` without fetching if another refresh is in flight.
    ///
    /// # Errors
    /// Returns [`RegionsError::Closed`] after [`close`](Self::close), or the
    /// last fetch error.
    pub async fn refresh_location_now(&self) -> Result<(), RegionsError> {
        if self.is_closed() {
            return Err(RegionsError::Closed);
        }
        let Some(_guard) = InFlightGuard::try_acquire(&self.inner) else {
            tracing::debug!("topology refresh already in flight");
            return Ok(());
        };
        let topology = self.inner.fetch_from_any_location().await?;
        self.inner.cache.on_database_account_read(topology);
        Ok(())
    }

    /// Stop scheduling background refreshes. A fetch already running completes
    /// but is not rescheduled.
    pub fn close(&self) {
        if !self.inner.cancel.is_cancelled() {
            tracing::debug!("closing global endpoint manager");
            self.inner.cancel.cancel();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    fn arm(&self, delay: Duration) {
        self.ensure_worker();
        self.inner.armed_once.store(true, Ordering::Release);
        self.send(WorkerCommand::Arm(delay));
    }

    /// No-op until the worker runs; nothing would drain the queue before that.
    fn request_refresh_if_due(&self) {
        if self.inner.armed_once.load(Ordering::Acquire) {
            self.send(WorkerCommand::RefreshIfDue);
        }
    }

    fn send(&self, command: WorkerCommand) {
        if self.inner.commands.send(command).is_err() {
            tracing::debug!(?command, "refresh worker stopped, command dropped");
        }
    }

    fn ensure_worker(&self) {
        let Some(receiver) = self.inner.pending_receiver.lock().take() else {
            return;
        };
        let worker = RefreshWorker {
            inner: Arc::downgrade(&self.inner),
            commands: receiver,
            cancel: self.inner.cancel.clone(),
            refresh_interval: self.inner.config.refresh_interval,
        };
        tokio::spawn(worker.run());
    }
}

impl Inner {
    /// Try the default endpoint, then each preferred region in order. Returns the
    /// first topology obtained or the last error.
    async fn fetch_from_any_location(&self) -> Result<AccountTopology, RegionsError> {
        let default_endpoint = &self.config.default_endpoint;
        let mut last_error = match self.fetcher.fetch_account_topology(default_endpoint).await {
            Ok(topology) => return Ok(topology),
            Err(source) => {
                tracing::debug!(
                    endpoint = %default_endpoint,
                    error = %source,
                    "topology fetch from default endpoint failed"
                );
                RegionsError::Fetch {
                    endpoint: default_endpoint.clone(),
                    source,
                }
            }
        };

        let known = self.cache.topology();
        for region in &self.config.preferred_regions {
            let endpoint = known
                .as_deref()
                .and_then(|t| t.readable.iter().find(|e| e.is_region(region)))
                .map(|e| e.url().clone())
                .or_else(|| regional_endpoint_url(default_endpoint, region));
            let Some(endpoint) = endpoint else {
                continue;
            };

            match self.fetcher.fetch_account_topology(&endpoint).await {
                Ok(topology) => {
                    tracing::debug!(region = %region, endpoint = %endpoint, "topology fetched from regional endpoint");
                    return Ok(topology);
                }
                Err(source) => {
                    tracing::debug!(
                        region = %region,
                        endpoint = %endpoint,
                        error = %source,
                        "topology fetch from regional endpoint failed"
                    );
                    last_error = RegionsError::Fetch { endpoint, source };
                }
            }
        }
        Err(last_error)
    }

    /// Fetch and apply; failures only cost freshness.
    async fn background_refresh(&self) {
        let Some(_guard) = InFlightGuard::try_acquire(self) else {
            tracing::debug!("foreground refresh in flight, skipping background refresh");
            return;
        };
        match self.fetch_from_any_location().await {
            Ok(topology) => self.cache.on_database_account_read(topology),
            Err(err) => tracing::warn!(error = %err, "background topology refresh failed"),
        }
    }
}

struct RefreshWorker {
    inner: Weak<Inner>,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    cancel: CancellationToken,
    refresh_interval: Duration,
}

impl RefreshWorker {
    async fn run(mut self) {
        let mut deadline: Option<Instant> = None;
        loop {
            let armed = deadline;
            let wake = async move {
                match armed {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                () = self.cancel.cancelled() => break,
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    match command {
                        WorkerCommand::Arm(delay) => {
                            let at = Instant::now() + delay;
                            deadline = Some(deadline.map_or(at, |current| current.min(at)));
                        }
                        WorkerCommand::RefreshIfDue => {
                            let Some(inner) = self.inner.upgrade() else { break };
                            if inner.cache.should_refresh_endpoints().should_refresh {
                                inner.background_refresh().await;
                                deadline = Some(Instant::now() + self.refresh_interval);
                            }
                        }
                    }
                }
                () = wake => {
                    let Some(inner) = self.inner.upgrade() else { break };
                    inner.background_refresh().await;
                    deadline = Some(Instant::now() + self.refresh_interval);
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }
        }
        tracing::debug!("topology refresh worker stopped");
    }
}
