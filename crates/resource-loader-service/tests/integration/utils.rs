use std::sync::Arc;
use std::time::Duration;

use resource_loader_service::config::LoaderConfig;
use resource_loader_service::error::LoadError;
use resource_loader_service::fetch::HttpFetcher;
use resource_loader_service::loader::{ResourceLoader, ResourceLoaderBuilder};
use resource_loader_service::memory::FixedMemoryProbe;
use resource_loader_service::network::ManualNetworkMonitor;
use resource_loader_service::types::{LoadOptions, NetworkStatus, Resource};
use resource_loader_service::utils::http::ClientTimeouts;
use resource_loader_test as test;
use tokio::task::JoinHandle;

pub use test::HitCounter;

/// Creates a loader configuration suited for tests.
///
/// Retries are fast and deterministic, and the background monitor effectively never
/// ticks, so tests drive memory and network changes explicitly.
pub fn test_config(update_config: impl FnOnce(&mut LoaderConfig)) -> LoaderConfig {
    let mut config = LoaderConfig {
        monitor_interval: Duration::from_secs(3600),
        enable_performance_monitoring: false,
        ..Default::default()
    };
    config.retry.delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(50);
    config.retry.jitter = false;
    update_config(&mut config);
    config
}

/// Setup tests and create a loader builder backed by a real HTTP client.
///
/// The builder reports a good network and a low, fixed memory usage.
pub fn setup_builder(update_config: impl FnOnce(&mut LoaderConfig)) -> ResourceLoaderBuilder {
    test::setup();

    let config = test_config(update_config);
    let fetcher = HttpFetcher::with_timeouts(&ClientTimeouts::default()).unwrap();

    ResourceLoader::builder(config, Arc::new(fetcher))
        .network_monitor(Arc::new(ManualNetworkMonitor::new(NetworkStatus::Good)))
        .memory_probe(Arc::new(FixedMemoryProbe::new(0.1)))
}

/// Setup tests and create a loader with the default collaborators.
pub async fn setup_loader(update_config: impl FnOnce(&mut LoaderConfig)) -> ResourceLoader {
    setup_builder(update_config)
        .build(tokio::runtime::Handle::current())
        .await
}

/// Waits until the loader reports `count` active requests.
pub async fn wait_for_active(loader: &ResourceLoader, count: usize) {
    for _ in 0..500 {
        if loader.active_requests().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {count} active requests, got {:?}",
        loader.active_requests()
    );
}

/// Spawns a load on the current runtime.
pub fn spawn_load(
    loader: &ResourceLoader,
    url: impl Into<String>,
    options: LoadOptions,
) -> JoinHandle<Result<Resource, LoadError>> {
    let loader = loader.clone();
    let url = url.into();
    tokio::spawn(async move { loader.load(&url, options).await })
}

/// Polls `condition` until it holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
