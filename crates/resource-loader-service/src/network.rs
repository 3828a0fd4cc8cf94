//! Network status monitoring and debouncing.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::NetworkDebounceConfig;
use crate::types::{NetworkStatus, NetworkStatusChange};

/// Source of network status changes.
#[async_trait]
pub trait NetworkMonitor: Send + Sync + fmt::Debug {
    /// Performs any setup and returns the current status.
    async fn initialize(&self) -> NetworkStatus;

    /// Subscribes to status changes. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<NetworkStatusChange>;
}

/// A [`NetworkMonitor`] driven by the host application through [`report`](Self::report).
#[derive(Debug)]
pub struct ManualNetworkMonitor {
    current: Mutex<NetworkStatus>,
    sender: broadcast::Sender<NetworkStatusChange>,
}

impl ManualNetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            current: Mutex::new(initial),
            sender,
        }
    }

    /// Reports a new raw status to all subscribers.
    ///
    /// Every report is forwarded, even if the status did not change, the debouncer
    /// downstream decides what to make of it.
    pub fn report(&self, status: NetworkStatus) {
        let previous_status = std::mem::replace(&mut *self.current.lock(), status);
        // no subscribers is fine
        self.sender
            .send(NetworkStatusChange {
                status,
                previous_status,
            })
            .ok();
    }

    pub fn current(&self) -> NetworkStatus {
        *self.current.lock()
    }
}

impl Default for ManualNetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::Unknown)
    }
}

#[async_trait]
impl NetworkMonitor for ManualNetworkMonitor {
    async fn initialize(&self) -> NetworkStatus {
        self.current()
    }

    fn subscribe(&self) -> broadcast::Receiver<NetworkStatusChange> {
        self.sender.subscribe()
    }
}

/// Turns raw status changes into a stable effective status.
///
/// When at least `threshold` changes arrive within `window` the network counts as
/// flapping. The effective status is then the most frequent status of the window
/// (ties go to the worse one), and it may only get worse until the flapping stops.
/// Once the window holds fewer than `threshold` changes again, the latest reported
/// status is adopted.
#[derive(Debug)]
pub struct NetworkDebouncer {
    window: Duration,
    threshold: usize,
    changes: VecDeque<(Instant, NetworkStatus)>,
    latest: NetworkStatus,
    effective: NetworkStatus,
}

impl NetworkDebouncer {
    pub fn new(config: &NetworkDebounceConfig, initial: NetworkStatus) -> Self {
        Self {
            window: config.window,
            threshold: config.threshold.max(1),
            changes: VecDeque::new(),
            latest: initial,
            effective: initial,
        }
    }

    pub fn effective(&self) -> NetworkStatus {
        self.effective
    }

    pub fn is_flapping(&self) -> bool {
        self.changes.len() >= self.threshold
    }

    /// Records a raw status change and returns the new effective status.
    pub fn record(&mut self, status: NetworkStatus, now: Instant) -> NetworkStatus {
        self.changes.push_back((now, status));
        self.latest = status;
        self.expire(now);

        self.effective = if self.is_flapping() {
            self.effective.worst(self.consensus())
        } else {
            status
        };
        self.effective
    }

    /// Re-evaluates the window without a new event.
    ///
    /// Returns the new effective status if flapping subsided and it changed.
    pub fn settle(&mut self, now: Instant) -> Option<NetworkStatus> {
        self.expire(now);
        if self.is_flapping() || self.effective == self.latest {
            return None;
        }
        self.effective = self.latest;
        Some(self.effective)
    }

    fn expire(&mut self, now: Instant) {
        while let Some((at, _)) = self.changes.front() {
            if now.duration_since(*at) > self.window {
                self.changes.pop_front();
            } else {
                break;
            }
        }
    }

    fn consensus(&self) -> NetworkStatus {
        let mut counts: HashMap<NetworkStatus, usize> = HashMap::new();
        for (_, status) in &self.changes {
            *counts.entry(*status).or_default() += 1;
        }
        counts
            .into_iter()
            // highest count wins, ties go to the lowest quality
            .max_by_key(|(status, count)| (*count, std::cmp::Reverse(status.quality())))
            .map(|(status, _)| status)
            .unwrap_or(self.latest)
    }
}
