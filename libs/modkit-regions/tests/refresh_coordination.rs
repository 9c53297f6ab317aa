#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Topology refresh coordination between foreground callers and the background worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use modkit_regions::{
    AccountTopology, FetchError, GlobalEndpointManager, RegionalEndpoint, RegionsConfig,
    TopologyFetcher,
};
use tokio::sync::Notify;
use url::Url;

fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

fn topology() -> AccountTopology {
    AccountTopology::single_endpoint(url("https://acct.example/"))
        .with_readable(vec![
            RegionalEndpoint::new("West US", url("https://acct-westus.example/")),
            RegionalEndpoint::new("East US", url("https://acct-eastus.example/")),
        ])
        .with_writable(vec![RegionalEndpoint::new(
            "West US",
            url("https://acct-westus.example/"),
        )])
}

/// Counts fetches and holds each one until released.
#[derive(Default)]
struct GatedFetcher {
    fetches: AtomicUsize,
    started: Notify,
    release: Notify,
}

#[async_trait]
impl TopologyFetcher for GatedFetcher {
    async fn fetch_account_topology(&self, _endpoint: &Url) -> Result<AccountTopology, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        self.release.notified().await;
        Ok(topology())
    }
}

fn config() -> RegionsConfig {
    RegionsConfig::new(url("https://acct.example/")).with_preferred_regions(["East US"])
}

#[tokio::test]
async fn concurrent_refreshes_fetch_once() {
    let fetcher = Arc::new(GatedFetcher::default());
    let manager = GlobalEndpointManager::new(config(), fetcher.clone()).unwrap();

    let first = tokio::spawn({
        let manager = manager.clone();
        async move { manager.refresh_location_async(None).await }
    });
    fetcher.started.notified().await;

    // in flight: both return at once without fetching
    manager.refresh_location_async(None).await.unwrap();
    manager.refresh_location_async(None).await.unwrap();
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);

    fetcher.release.notify_one();
    first.await.unwrap().unwrap();

    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
    assert!(manager.topology().is_some());
    manager.close();
}

#[tokio::test(start_paused = true)]
async fn init_waits_for_refresh_in_flight() {
    let fetcher = Arc::new(GatedFetcher::default());
    let manager = GlobalEndpointManager::new(config(), fetcher.clone()).unwrap();

    let first = tokio::spawn({
        let manager = manager.clone();
        async move { manager.refresh_location_async(None).await }
    });
    fetcher.started.notified().await;

    let init = tokio::spawn({
        let manager = manager.clone();
        async move { manager.init().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
    assert!(!init.is_finished());

    fetcher.release.notify_one();
    first.await.unwrap().unwrap();

    // init fetches only after the first refresh released the flag
    fetcher.started.notified().await;
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 2);
    fetcher.release.notify_one();
    init.await.unwrap().unwrap();
    assert!(manager.topology().is_some());
    manager.close();
}

#[tokio::test]
async fn in_flight_flag_is_cleared_after_failure() {
    struct FailOnce {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TopologyFetcher for FailOnce {
        async fn fetch_account_topology(&self, _: &Url) -> Result<AccountTopology, FetchError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(FetchError::Timeout(Duration::from_secs(10)));
            }
            Ok(topology())
        }
    }

    let fetcher = Arc::new(FailOnce {
        calls: AtomicUsize::new(0),
    });
    let manager = GlobalEndpointManager::new(config(), fetcher.clone()).unwrap();

    // default and East US both fail
    assert!(manager.refresh_location_async(None).await.is_err());
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

    manager.refresh_location_async(None).await.unwrap();
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    assert!(manager.topology().is_some());
    manager.close();
}

#[tokio::test(start_paused = true)]
async fn background_and_foreground_refreshes_never_overlap() {
    let fetcher = Arc::new(GatedFetcher::default());
    let manager = GlobalEndpointManager::new(config(), fetcher.clone()).unwrap();
    manager.refresh_location_async(Some(topology())).await.unwrap();

    // interval elapsed: the worker is armed with zero delay while a forced
    // foreground refresh races it
    tokio::time::advance(Duration::from_secs(301)).await;
    manager.refresh_location_async(None).await.unwrap();

    let foreground = tokio::spawn({
        let manager = manager.clone();
        async move { manager.refresh_location_now().await }
    });
    fetcher.started.notified().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);

    fetcher.release.notify_one();
    foreground.await.unwrap().unwrap();
    manager.close();
}
