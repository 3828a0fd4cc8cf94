//! The resource loader.
//!
//! [`ResourceLoader`] is a cheap, clonable handle. All state lives behind a single
//! mutex in the shared inner struct and is only touched by the loader's own
//! methods. Background work (the monitor tick and the network subscription) runs
//! on tokio tasks that only hold weak references, so dropping every handle or
//! calling [`destroy`](ResourceLoader::destroy) stops them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::TokenStore;
use crate::cache::{MemoryCache, ResourceCache};
use crate::config::LoaderConfig;
use crate::controller::ConcurrencyController;
use crate::error::LoadError;
use crate::fetch::Fetcher;
use crate::memory::{MemoryProbe, MemoryTier, ProcessMemoryProbe};
use crate::network::{NetworkDebouncer, NetworkMonitor};
use crate::priority::{HeuristicScorer, PriorityScorer};
use crate::strategy::{ConcurrencyContext, ConcurrencySource};
use crate::telemetry::{LoaderStats, PerformanceSnapshot, StatsdTelemetry, TelemetrySink};
use crate::types::{
    DEFAULT_PRIORITY, LoadOptions, NetworkStatus, NetworkStatusChange, RequestId, Resource,
    ResponseKind, normalize_url,
};

mod batch;
mod events;
mod inflight;
mod monitor;

pub use events::LoaderEvent;

use inflight::{ActiveRequest, PendingLoad, QueuedRequest};
use monitor::AnomalyDetector;

/// Capacity of the event channel. Slow subscribers lose the oldest events.
const EVENT_CAPACITY: usize = 256;

/// Number of memory samples kept for leak detection.
const MEMORY_HISTORY: usize = 5;

/// A request currently in flight, as reported by [`ResourceLoader::active_requests`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveRequestInfo {
    pub id: RequestId,
    pub url: String,
    pub priority: u32,
    pub age: Duration,
}

#[derive(Debug)]
struct LoaderState {
    /// Every dispatched attempt, removed when the attempt settles or is cancelled.
    active: BTreeMap<RequestId, ActiveRequest>,
    /// The single outstanding network operation per normalized url.
    pending: HashMap<String, PendingLoad>,
    stats: LoaderStats,
    next_id: u64,
    /// Attempts waiting for a free slot in the active table.
    queue: Vec<QueuedRequest>,
    /// Urls of running batches that wait for a later batch.
    backlog: usize,
    debouncer: NetworkDebouncer,
    memory_ratio: Option<f64>,
    memory_tier: MemoryTier,
    memory_history: VecDeque<f64>,
    anomalies: AnomalyDetector,
    tasks: Vec<JoinHandle<()>>,
}

impl LoaderState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct LoaderInner {
    config: LoaderConfig,
    fetcher: Arc<dyn Fetcher>,
    cache: Option<Arc<dyn ResourceCache>>,
    tokens: Option<Arc<dyn TokenStore>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    memory: Arc<dyn MemoryProbe>,
    source: Arc<dyn ConcurrencySource>,
    scorer: Arc<dyn PriorityScorer>,
    state: Mutex<LoaderState>,
    events: broadcast::Sender<LoaderEvent>,
    /// Parent of every per-attempt cancellation token.
    shutdown: CancellationToken,
    destroyed: AtomicBool,
    runtime: Handle,
}

impl std::fmt::Debug for LoaderInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderInner")
            .field("config", &self.config)
            .field("fetcher", &self.fetcher)
            .field("cache", &self.cache)
            .field("source", &self.source)
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}

impl Drop for LoaderInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl LoaderInner {
    fn emit(&self, event: LoaderEvent) {
        // no subscribers is fine
        self.events.send(event).ok();
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn caching_enabled(&self) -> Option<&Arc<dyn ResourceCache>> {
        self.cache.as_ref().filter(|_| self.config.enable_cache)
    }

    fn network_status(&self) -> NetworkStatus {
        self.state.lock().debouncer.effective()
    }

    fn bearer_token(&self) -> Option<String> {
        if !self.config.enterprise_mode {
            return None;
        }
        self.tokens.as_ref().and_then(|tokens| tokens.bearer_token())
    }

    fn concurrency_context(&self) -> ConcurrencyContext {
        let state = self.state.lock();
        ConcurrencyContext {
            device: self.config.device_type,
            network: state.debouncer.effective(),
            memory_usage_ratio: state.memory_ratio.unwrap_or(0.0),
            active_requests: state.active.len(),
            queued_requests: state.queue.len() + state.backlog,
        }
    }

    /// The recommendation of the concurrency source, capped by the memory tier.
    fn batch_size(&self, context: &ConcurrencyContext) -> usize {
        let tier = self.state.lock().memory_tier;
        let ceiling = tier.concurrency_ceiling(self.config.max_concurrent_loads);
        self.source
            .recommended_concurrency(context)
            .min(ceiling)
            .max(2)
    }

    /// The batch size is also the number of attempts that may be active at once.
    fn current_batch_size(&self) -> usize {
        let context = self.concurrency_context();
        self.batch_size(&context)
    }

    /// Feeds a raw network status change through the debouncer.
    fn handle_network_change(&self, change: NetworkStatusChange) -> NetworkStatus {
        let (previous, effective) = {
            let mut state = self.state.lock();
            let previous = state.debouncer.effective();
            let effective = state.debouncer.record(change.status, Instant::now());
            (previous, effective)
        };

        if effective != previous {
            tracing::info!(
                status = %effective,
                previous = %previous,
                reported = %change.status,
                "network status changed"
            );
            metric!(counter("loader.network_change") += 1, "status" => effective.as_str());
            self.emit(LoaderEvent::NetworkStatusChanged(NetworkStatusChange {
                status: effective,
                previous_status: previous,
            }));
        } else if change.status != effective {
            tracing::debug!(
                status = %effective,
                reported = %change.status,
                "network is flapping, keeping conservative status"
            );
        }
        effective
    }

    /// Adopts the latest reported status once flapping has subsided.
    fn settle_network(&self) {
        let settled = {
            let mut state = self.state.lock();
            let previous = state.debouncer.effective();
            state
                .debouncer
                .settle(Instant::now())
                .map(|status| (previous, status))
        };
        if let Some((previous, status)) = settled {
            tracing::info!(status = %status, previous = %previous, "network status settled");
            self.emit(LoaderEvent::NetworkStatusChanged(NetworkStatusChange {
                status,
                previous_status: previous,
            }));
        }
    }

    /// Classifies the memory usage and reacts to a change of tier.
    ///
    /// Entering the critical tier prunes the cache and cancels every active request
    /// with a priority below the default.
    async fn handle_memory_pressure(&self, ratio: f64) -> MemoryTier {
        let tier = MemoryTier::from_ratio(ratio);
        let entered_critical;
        let cancelled = {
            let mut state = self.state.lock();
            state.memory_ratio = Some(ratio);
            if state.memory_history.len() == MEMORY_HISTORY {
                state.memory_history.pop_front();
            }
            state.memory_history.push_back(ratio);

            let previous = std::mem::replace(&mut state.memory_tier, tier);
            if previous != tier {
                tracing::info!(%tier, previous = %previous, ratio, "memory tier changed");
                self.emit(LoaderEvent::MemoryTierChanged {
                    tier,
                    previous_tier: previous,
                    ratio,
                });
            }

            entered_critical = tier == MemoryTier::Critical && previous != MemoryTier::Critical;
            let mut cancelled = Vec::new();
            if entered_critical {
                let doomed: Vec<RequestId> = state
                    .active
                    .iter()
                    .filter(|(_, request)| request.priority() < DEFAULT_PRIORITY)
                    .map(|(id, _)| *id)
                    .collect();
                for id in doomed {
                    if let Some(request) = state.active.remove(&id) {
                        request.cancel.cancel();
                        cancelled.push((id, request.url));
                    }
                }
                state.stats.cancelled += cancelled.len() as u64;
            }
            cancelled
        };

        if entered_critical {
            tracing::warn!(
                ratio,
                cancelled = cancelled.len(),
                "critical memory pressure, shedding load"
            );
            for (id, url) in cancelled {
                self.emit(LoaderEvent::RequestCancelled { id, url });
            }
            if let Some(cache) = &self.cache {
                let pruned = cache.prune(self.config.memory_prune_fraction).await;
                metric!(counter("loader.cache_pruned") += pruned as i64);
            }
        }

        tier
    }

    fn performance_snapshot(&self) -> PerformanceSnapshot {
        let current_batch_size = self.current_batch_size();
        let state = self.state.lock();
        PerformanceSnapshot {
            timestamp: Utc::now(),
            memory_usage_ratio: state.memory_ratio,
            memory_tier: state.memory_tier,
            network_status: state.debouncer.effective(),
            active_requests: state.active.len(),
            current_batch_size,
            stats: state.stats,
        }
    }
}

/// Collects the collaborators of a [`ResourceLoader`].
pub struct ResourceLoaderBuilder {
    config: LoaderConfig,
    fetcher: Arc<dyn Fetcher>,
    cache: Option<Arc<dyn ResourceCache>>,
    network: Option<Arc<dyn NetworkMonitor>>,
    tokens: Option<Arc<dyn TokenStore>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    memory: Option<Arc<dyn MemoryProbe>>,
    source: Option<Arc<dyn ConcurrencySource>>,
    scorer: Option<Arc<dyn PriorityScorer>>,
}

impl ResourceLoaderBuilder {
    /// Replaces the default in-memory cache.
    pub fn cache(mut self, cache: Arc<dyn ResourceCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn network_monitor(mut self, network: Arc<dyn NetworkMonitor>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn token_store(mut self, tokens: Arc<dyn TokenStore>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Replaces the default statsd telemetry.
    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Replaces the default process memory probe.
    pub fn memory_probe(mut self, memory: Arc<dyn MemoryProbe>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Replaces the default [`ConcurrencyController`], e.g. with an experiment harness.
    pub fn concurrency_source(mut self, source: Arc<dyn ConcurrencySource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Replaces the default [`HeuristicScorer`].
    pub fn priority_scorer(mut self, scorer: Arc<dyn PriorityScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Initializes the collaborators and spawns the background tasks on `runtime`.
    pub async fn build(self, runtime: Handle) -> ResourceLoader {
        let config = self.config;

        let cache = match self.cache {
            Some(cache) => Some(cache),
            None if config.enable_cache => {
                Some(Arc::new(MemoryCache::from_config(&config)) as Arc<dyn ResourceCache>)
            }
            None => None,
        };
        if let Some(cache) = cache.as_ref().filter(|_| config.persist_cache) {
            if let Err(e) = cache.restore().await {
                let dynerr: &dyn std::error::Error = &e;
                tracing::error!(error = dynerr, "failed to restore resource cache");
            }
        }

        let initial_status = match &self.network {
            Some(network) => network.initialize().await,
            None => NetworkStatus::Unknown,
        };
        let network_changes = self.network.as_ref().map(|network| network.subscribe());

        let telemetry = match self.telemetry {
            Some(telemetry) => Some(telemetry),
            None if config.enable_performance_monitoring => {
                Some(Arc::new(StatsdTelemetry) as Arc<dyn TelemetrySink>)
            }
            None => None,
        };
        let memory = self
            .memory
            .unwrap_or_else(|| Arc::new(ProcessMemoryProbe::new(config.memory_budget)));
        if config.use_ab_testing && self.source.is_none() {
            tracing::warn!("strategy experiment enabled without a harness, using the controller");
        }
        let source = self
            .source
            .unwrap_or_else(|| Arc::new(ConcurrencyController::new(&config)));
        let scorer = self
            .scorer
            .unwrap_or_else(|| Arc::new(HeuristicScorer::new()));

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = LoaderState {
            active: BTreeMap::new(),
            pending: HashMap::new(),
            stats: LoaderStats::default(),
            next_id: 0,
            queue: Vec::new(),
            backlog: 0,
            debouncer: NetworkDebouncer::new(&config.network_debounce, initial_status),
            memory_ratio: None,
            memory_tier: MemoryTier::Normal,
            memory_history: VecDeque::with_capacity(MEMORY_HISTORY),
            anomalies: AnomalyDetector::default(),
            tasks: Vec::new(),
        };

        let inner = Arc::new(LoaderInner {
            config,
            fetcher: self.fetcher,
            cache,
            tokens: self.tokens,
            telemetry,
            memory,
            source,
            scorer,
            state: Mutex::new(state),
            events,
            shutdown: CancellationToken::new(),
            destroyed: AtomicBool::new(false),
            runtime: runtime.clone(),
        });

        let mut tasks = vec![runtime.spawn(monitor::run_monitor(
            Arc::downgrade(&inner),
            inner.config.monitor_interval,
            inner.shutdown.clone(),
        ))];
        if let Some(changes) = network_changes {
            tasks.push(runtime.spawn(monitor::run_network_subscription(
                Arc::downgrade(&inner),
                changes,
                inner.shutdown.clone(),
            )));
        }
        inner.state.lock().tasks = tasks;

        tracing::debug!(
            device = inner.config.device_type.as_str(),
            network = %initial_status,
            "resource loader ready"
        );
        ResourceLoader { inner }
    }
}

/// Loads resources with adaptive concurrency, request merging and retries.
#[derive(Clone, Debug)]
pub struct ResourceLoader {
    inner: Arc<LoaderInner>,
}

impl ResourceLoader {
    pub fn builder(config: LoaderConfig, fetcher: Arc<dyn Fetcher>) -> ResourceLoaderBuilder {
        ResourceLoaderBuilder {
            config,
            fetcher,
            cache: None,
            network: None,
            tokens: None,
            telemetry: None,
            memory: None,
            source: None,
            scorer: None,
        }
    }

    /// Loads a single resource.
    ///
    /// Serves from the cache unless `bypass_cache` is set, otherwise performs or joins a
    /// network operation. While the network is offline, only cached resources are
    /// available.
    #[tracing::instrument(level = "debug", skip_all, fields(url = %url))]
    pub async fn load(&self, url: &str, options: LoadOptions) -> Result<Resource, LoadError> {
        if url.trim().is_empty() {
            return Err(LoadError::Validation("empty url".into()));
        }
        if self.inner.is_destroyed() {
            return Err(LoadError::Cancelled);
        }

        let key = normalize_url(url);
        let started = Instant::now();

        if !options.bypass_cache {
            if let Some(cache) = self.inner.caching_enabled() {
                if let Some(raw) = cache.get(&key).await {
                    let result = Resource::decode(&key, &raw, options.response_kind, true);
                    if result.is_ok() {
                        self.inner.state.lock().stats.cache_hits += 1;
                        metric!(counter("loader.cache_hit") += 1);
                    }
                    return self.settle(&key, started, result);
                }
            }

            let status = self.inner.network_status();
            if status.is_offline() {
                tracing::debug!("network offline and resource not cached");
                let result = Err(LoadError::NetworkUnavailable(key.clone()));
                return self.settle(&key, started, result);
            }
        }

        let channel = self.inner.join_or_spawn(&key, &options);
        let result = match channel.await {
            Ok(Ok(raw)) => Resource::decode(&key, &raw, options.response_kind, false),
            Ok(Err(error)) => Err(error),
            // the operation was dropped without settling, i.e. the runtime shut down
            Err(_canceled) => Err(LoadError::Cancelled),
        };
        self.settle(&key, started, result)
    }

    /// Updates counters and emits the outcome of one logical load.
    fn settle(
        &self,
        url: &str,
        started: Instant,
        result: Result<Resource, LoadError>,
    ) -> Result<Resource, LoadError> {
        if self.inner.is_destroyed() {
            return result;
        }

        match &result {
            Ok(resource) => {
                self.inner.state.lock().stats.loaded += 1;
                metric!(timer("loader.load.duration") = started.elapsed(), "cache" => if resource.from_cache { "hit" } else { "miss" });
                self.inner.emit(LoaderEvent::LoadCompleted {
                    url: url.to_owned(),
                    from_cache: resource.from_cache,
                    duration: started.elapsed(),
                });
            }
            Err(LoadError::Cancelled) => {
                tracing::debug!("load cancelled");
            }
            Err(error) => {
                self.inner.state.lock().stats.failed += 1;
                metric!(counter("loader.load.failed") += 1, "reason" => error.metrics_tag());
                tracing::debug!(%error, "load failed");
                self.inner.emit(LoaderEvent::LoadFailed {
                    url: url.to_owned(),
                    error: error.clone(),
                });
            }
        }
        result
    }

    /// Loads many resources in sequential batches.
    ///
    /// Urls are deduplicated and sorted by priority, each batch is sized by the current
    /// concurrency recommendation and runs in parallel.
    ///
    /// The result has one slot per input url, failed loads are `None`.
    pub async fn load_batch<I, S>(&self, urls: I, options: LoadOptions) -> Vec<Option<Resource>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let urls: Vec<String> = urls.into_iter().map(|url| url.as_ref().to_owned()).collect();
        batch::load_batch(self, &urls, options).await
    }

    /// Loads resources in the background at low priority.
    ///
    /// Never fails, the outcome is reported as [`LoaderEvent::PreloadCompleted`].
    pub fn preload<I, S>(&self, urls: I, options: Option<LoadOptions>)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let urls: Vec<String> = urls.into_iter().map(|url| url.as_ref().to_owned()).collect();
        let options = options.unwrap_or_else(|| {
            LoadOptions::default().with_priority(crate::types::PRELOAD_PRIORITY)
        });
        let loader = self.clone();
        self.inner.runtime.spawn(async move {
            let requested = urls.len();
            let results = batch::load_batch(&loader, &urls, options).await;
            let loaded = results.iter().filter(|result| result.is_some()).count();
            tracing::debug!(requested, loaded, "preload completed");
            loader
                .inner
                .emit(LoaderEvent::PreloadCompleted { requested, loaded });
        });
    }

    /// Looks up a resource in the cache without touching the network.
    pub async fn get_from_cache(&self, url: &str) -> Option<Resource> {
        let key = normalize_url(url);
        let cache = self.inner.cache.as_ref()?;
        let resource = cache
            .get(&key)
            .await
            .and_then(|raw| Resource::decode(&key, &raw, ResponseKind::Bytes, true).ok());
        self.inner.emit(LoaderEvent::CacheLookup {
            url: key,
            hit: resource.is_some(),
        });
        resource
    }

    /// Clears the cache, optionally keeping stylesheets, scripts and data files.
    ///
    /// Returns the number of removed entries.
    pub async fn clear_cache(&self, preserve_essential: bool) -> usize {
        let removed = match &self.inner.cache {
            Some(cache) => cache.clear(preserve_essential).await,
            None => 0,
        };
        self.inner.emit(LoaderEvent::CacheCleared {
            preserve_essential,
            removed,
        });
        removed
    }

    /// Cancels all outstanding work, stops the background tasks and resets all counters.
    ///
    /// Idempotent. Loads issued afterwards fail with [`LoadError::Cancelled`].
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        // cancels every attempt and every backoff sleep
        self.inner.shutdown.cancel();

        let (tasks, cancelled) = {
            let mut state = self.inner.state.lock();
            let cancelled = state.active.len() + state.queue.len();
            state.active.clear();
            // dropping the queued senders wakes their attempts
            state.queue.clear();
            state.pending.clear();
            state.stats = LoaderStats::default();
            state.backlog = 0;
            state.memory_history.clear();
            (std::mem::take(&mut state.tasks), cancelled)
        };
        for task in tasks {
            task.abort();
        }

        tracing::debug!(cancelled, "resource loader destroyed");
        self.inner.emit(LoaderEvent::Destroyed);
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// Subscribes to loader events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<LoaderEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> LoaderStats {
        self.inner.state.lock().stats
    }

    pub fn performance_snapshot(&self) -> PerformanceSnapshot {
        self.inner.performance_snapshot()
    }

    /// The size the next batch would have.
    pub fn current_batch_size(&self) -> usize {
        self.inner.current_batch_size()
    }

    /// The effective, debounced network status.
    pub fn network_status(&self) -> NetworkStatus {
        self.inner.network_status()
    }

    pub fn memory_tier(&self) -> MemoryTier {
        self.inner.state.lock().memory_tier
    }

    /// Feeds a raw network status change, as the network subscription does.
    pub fn handle_network_change(&self, change: NetworkStatusChange) -> NetworkStatus {
        self.inner.handle_network_change(change)
    }

    /// Feeds a memory usage ratio, as the background monitor does.
    pub async fn handle_memory_pressure(&self, ratio: f64) -> MemoryTier {
        self.inner.handle_memory_pressure(ratio).await
    }

    pub fn active_requests(&self) -> Vec<ActiveRequestInfo> {
        let now = Instant::now();
        self.inner
            .state
            .lock()
            .active
            .iter()
            .map(|(id, request)| ActiveRequestInfo {
                id: *id,
                url: request.url.clone(),
                priority: request.priority(),
                age: now.duration_since(request.started),
            })
            .collect()
    }

    /// The number of requests waiting for a free slot or a later batch.
    pub fn queued_requests(&self) -> usize {
        let state = self.inner.state.lock();
        state.queue.len() + state.backlog
    }

    /// Boosts the given urls in the priority order of following batches.
    pub fn mark_visible(&self, urls: &[String]) {
        self.inner.scorer.mark_visible(urls);
    }

    pub fn set_navigation_hints(&self, urls: &[String]) {
        self.inner.scorer.set_navigation_hints(urls);
    }
}
