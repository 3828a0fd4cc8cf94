use std::time::Duration;

use crate::error::LoadError;
use crate::memory::MemoryTier;
use crate::telemetry::{Anomaly, PerformanceSnapshot};
use crate::types::{NetworkStatusChange, RequestId};

/// Everything observable about the loader, see [`ResourceLoader::subscribe`](super::ResourceLoader::subscribe).
///
/// Subscribers that fall behind lose the oldest events.
#[derive(Clone, Debug, PartialEq)]
pub enum LoaderEvent {
    /// An attempt was dispatched to the network.
    LoadStarted {
        id: RequestId,
        url: String,
        attempt: u32,
    },
    /// A load settled successfully.
    LoadCompleted {
        url: String,
        from_cache: bool,
        duration: Duration,
    },
    /// A load failed for good.
    LoadFailed { url: String, error: LoadError },
    /// A caller joined a pending network operation.
    RequestMerged { url: String, same_options: bool },
    /// A failed attempt will be retried after `delay`.
    RetryScheduled {
        url: String,
        attempt: u32,
        delay: Duration,
    },
    /// An active request was cancelled under memory pressure.
    RequestCancelled { id: RequestId, url: String },
    BatchCompleted {
        size: usize,
        success_count: usize,
        failure_count: usize,
        concurrency: usize,
        duration: Duration,
    },
    PreloadCompleted { requested: usize, loaded: usize },
    CacheLookup { url: String, hit: bool },
    CacheCleared {
        preserve_essential: bool,
        removed: usize,
    },
    /// The effective (debounced) network status changed.
    NetworkStatusChanged(NetworkStatusChange),
    MemoryTierChanged {
        tier: MemoryTier,
        previous_tier: MemoryTier,
        ratio: f64,
    },
    Snapshot(PerformanceSnapshot),
    AnomalyDetected(Anomaly),
    Destroyed,
}
