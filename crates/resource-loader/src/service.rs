//! Wires the loader and its collaborators from the configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use resource_loader_service::config::{Config, ExperimentConfig};
use resource_loader_service::experiment::ExperimentHarness;
use resource_loader_service::fetch::HttpFetcher;
use resource_loader_service::loader::ResourceLoader;
use resource_loader_service::network::ManualNetworkMonitor;
use resource_loader_service::storage::{FsStateStore, MemoryStateStore, StateStore};
use resource_loader_service::strategy::builtin_strategies;
use resource_loader_service::types::NetworkStatus;
use resource_loader_service::utils::http::ClientTimeouts;
use tokio::runtime::Handle;

/// Creates the experiment harness with the builtin strategies and an assigned strategy.
pub fn create_harness(config: &ExperimentConfig) -> ExperimentHarness {
    let store: Arc<dyn StateStore> = match &config.state_dir {
        Some(dir) => Arc::new(FsStateStore::new(dir)),
        None => Arc::new(MemoryStateStore::default()),
    };
    let harness = ExperimentHarness::new(config.clone(), store);
    harness.add_strategies(builtin_strategies());
    if let Some(strategy) = harness.init_test() {
        tracing::info!(test_id = harness.test_id(), %strategy, "strategy assigned");
    }
    harness
}

/// A loader and the experiment harness feeding it, if the experiment is enabled.
pub struct LoaderService {
    pub loader: ResourceLoader,
    pub harness: Option<Arc<ExperimentHarness>>,
}

impl LoaderService {
    /// Destroys the loader and waits for the experiment state to be written.
    pub async fn shutdown(self) {
        self.loader.destroy();
        if let Some(harness) = self.harness {
            harness.flush().await;
        }
    }
}

/// Builds a loader for a command line invocation.
///
/// The network is reported as good, since a command line run has no connectivity events.
pub async fn create_loader(config: &Config, runtime: Handle) -> Result<LoaderService> {
    let fetcher = HttpFetcher::with_timeouts(&ClientTimeouts::default())
        .context("failed to create http client")?;

    let mut builder = ResourceLoader::builder(config.loader.clone(), Arc::new(fetcher))
        .network_monitor(Arc::new(ManualNetworkMonitor::new(NetworkStatus::Good)));
    let harness = config
        .loader
        .use_ab_testing
        .then(|| Arc::new(create_harness(&config.experiment)));
    if let Some(harness) = &harness {
        builder = builder.concurrency_source(harness.clone());
    }

    Ok(LoaderService {
        loader: builder.build(runtime).await,
        harness,
    })
}
