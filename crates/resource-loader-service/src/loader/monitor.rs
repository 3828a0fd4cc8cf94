//! Background tasks of the loader: the periodic monitor tick and the network subscription.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Weak;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::inflight::ActiveRequest;
use super::{LoaderEvent, LoaderInner, MEMORY_HISTORY};
use crate::telemetry::{Anomaly, LoaderStats};
use crate::types::{NetworkStatusChange, RequestId};

/// Total growth over the memory history that counts as a leak.
const LEAK_GROWTH: f64 = 0.1;

/// Settled loads needed before the failure rate is judged.
const FAILURE_MIN_SETTLED: u64 = 10;
const FAILURE_RATE_THRESHOLD: f64 = 0.3;

const MIN_MONITOR_INTERVAL: Duration = Duration::from_millis(10);

/// Detects anomalies from the loader state, reporting persistent conditions only once.
#[derive(Debug, Default)]
pub(super) struct AnomalyDetector {
    leak_reported: bool,
    failure_reported: bool,
}

impl AnomalyDetector {
    pub fn detect(
        &mut self,
        memory_history: &VecDeque<f64>,
        active: &BTreeMap<RequestId, ActiveRequest>,
        stats: &LoaderStats,
        hanging_threshold: Duration,
        now: Instant,
    ) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();

        let growing = memory_history.len() == MEMORY_HISTORY
            && memory_history
                .iter()
                .zip(memory_history.iter().skip(1))
                .all(|(a, b)| b > a);
        let growth = match (memory_history.front(), memory_history.back()) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        };
        if growing && growth >= LEAK_GROWTH {
            if !self.leak_reported {
                self.leak_reported = true;
                anomalies.push(Anomaly::MemoryLeak {
                    samples: memory_history.iter().copied().collect(),
                });
            }
        } else if !growing {
            self.leak_reported = false;
        }

        let hanging = active
            .values()
            .map(|request| now.saturating_duration_since(request.started))
            .filter(|age| *age > hanging_threshold);
        let (count, oldest) = hanging.fold((0, Duration::ZERO), |(count, oldest), age| {
            (count + 1, oldest.max(age))
        });
        if count > 0 {
            anomalies.push(Anomaly::HangingRequests { count, oldest });
        }

        let settled = stats.settled();
        let failing = settled >= FAILURE_MIN_SETTLED
            && stats.failed as f64 / settled as f64 > FAILURE_RATE_THRESHOLD;
        if failing && !self.failure_reported {
            anomalies.push(Anomaly::HighFailureRate {
                failed: stats.failed,
                settled,
            });
        }
        self.failure_reported = failing;

        anomalies
    }
}

impl LoaderInner {
    /// One monitor tick: re-evaluates network and memory, reviews the concurrency
    /// source and submits telemetry.
    async fn monitor_tick(&self) {
        self.settle_network();

        if let Some(ratio) = self.memory.usage_ratio() {
            self.handle_memory_pressure(ratio).await;
        }

        self.source.review();

        if !self.config.enable_performance_monitoring || self.is_destroyed() {
            return;
        }

        let snapshot = self.performance_snapshot();
        let anomalies = {
            let mut state = self.state.lock();
            let state = &mut *state;
            state.anomalies.detect(
                &state.memory_history,
                &state.active,
                &state.stats,
                self.config.hanging_request_threshold,
                Instant::now(),
            )
        };

        if let Some(telemetry) = &self.telemetry {
            telemetry.submit_snapshot(&snapshot);
        }
        self.emit(LoaderEvent::Snapshot(snapshot));

        for anomaly in anomalies {
            tracing::warn!(kind = anomaly.kind(), "{anomaly}");
            if let Some(telemetry) = &self.telemetry {
                telemetry.report_anomaly(&anomaly);
            }
            self.emit(LoaderEvent::AnomalyDetected(anomaly));
        }
    }
}

/// Runs the monitor tick every `period` until the loader is destroyed or dropped.
pub(super) async fn run_monitor(
    inner: Weak<LoaderInner>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period.max(MIN_MONITOR_INTERVAL));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.monitor_tick().await;
    }
    tracing::trace!("monitor stopped");
}

/// Forwards the status changes of a network monitor to the debouncer.
pub(super) async fn run_network_subscription(
    inner: Weak<LoaderInner>,
    mut changes: broadcast::Receiver<NetworkStatusChange>,
    shutdown: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            _ = shutdown.cancelled() => break,
            change = changes.recv() => change,
        };
        let change = match change {
            Ok(change) => change,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "missed network status changes");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_network_change(change);
    }
    tracing::trace!("network subscription stopped");
}
