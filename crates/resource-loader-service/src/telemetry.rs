//! Performance snapshots, anomalies and the sink they are reported to.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::MemoryTier;
use crate::types::NetworkStatus;

/// Counters kept by the loader, reset by `destroy()`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderStats {
    /// Loads that settled successfully, cache hits included.
    pub loaded: u64,
    /// Loads that failed after all retries.
    pub failed: u64,
    pub cache_hits: u64,
    /// Callers that joined an already pending network operation.
    pub merged: u64,
    pub retried: u64,
    pub cancelled: u64,
    pub batches: u64,
}

impl LoaderStats {
    /// Loads that reached a terminal success or failure.
    pub fn settled(&self) -> u64 {
        self.loaded + self.failed
    }
}

/// A point-in-time view of the loader, produced by the background monitor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub memory_usage_ratio: Option<f64>,
    pub memory_tier: MemoryTier,
    pub network_status: NetworkStatus,
    pub active_requests: usize,
    pub current_batch_size: usize,
    pub stats: LoaderStats,
}

/// Unusual conditions detected by the background monitor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Anomaly {
    /// Memory usage kept growing over the last samples.
    MemoryLeak { samples: Vec<f64> },
    /// Requests are active for longer than the hanging threshold.
    HangingRequests {
        count: usize,
        #[serde(with = "humantime_serde")]
        oldest: Duration,
    },
    /// Too many of the settled loads failed.
    HighFailureRate { failed: u64, settled: u64 },
}

impl Anomaly {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MemoryLeak { .. } => "memory-leak",
            Self::HangingRequests { .. } => "hanging-requests",
            Self::HighFailureRate { .. } => "high-failure-rate",
        }
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemoryLeak { samples } => {
                let first = samples.first().copied().unwrap_or_default();
                let last = samples.last().copied().unwrap_or_default();
                write!(f, "memory usage grew from {first:.2} to {last:.2}")
            }
            Self::HangingRequests { count, oldest } => write!(
                f,
                "{count} requests hanging, oldest for {}",
                humantime::format_duration(*oldest)
            ),
            Self::HighFailureRate { failed, settled } => {
                write!(f, "{failed} of {settled} loads failed")
            }
        }
    }
}

/// Receives performance data from the loader.
pub trait TelemetrySink: Send + Sync + fmt::Debug {
    fn submit_snapshot(&self, snapshot: &PerformanceSnapshot);

    fn report_anomaly(&self, anomaly: &Anomaly);
}

/// The default [`TelemetrySink`], reporting to statsd through the [`metric!`](crate::metric)
/// macro. Without a configured statsd client this only logs anomalies.
#[derive(Debug, Default)]
pub struct StatsdTelemetry;

impl TelemetrySink for StatsdTelemetry {
    fn submit_snapshot(&self, snapshot: &PerformanceSnapshot) {
        if let Some(ratio) = snapshot.memory_usage_ratio {
            metric!(gauge("loader.memory_usage") = ratio);
        }
        metric!(
            gauge("loader.active_requests") = snapshot.active_requests as u64,
            "network" => snapshot.network_status.as_str(),
        );
        metric!(
            gauge("loader.batch_size") = snapshot.current_batch_size as u64,
            "memory_tier" => snapshot.memory_tier.as_str(),
        );
        metric!(gauge("loader.loaded") = snapshot.stats.loaded);
        metric!(gauge("loader.failed") = snapshot.stats.failed);
        metric!(gauge("loader.cache_hits") = snapshot.stats.cache_hits);
        metric!(gauge("loader.merged") = snapshot.stats.merged);
    }

    fn report_anomaly(&self, anomaly: &Anomaly) {
        tracing::warn!(kind = anomaly.kind(), "{anomaly}");
        metric!(counter("loader.anomaly") += 1, "kind" => anomaly.kind());
    }
}
