//! The adaptive concurrency controller.
//!
//! Combines the static device/network lookup table with an AIMD value that is
//! driven by the outcome of recent batches.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::config::LoaderConfig;
use crate::strategy::{BatchOutcome, ConcurrencyContext, ConcurrencySource};
use crate::types::{DeviceClass, NetworkStatus};

/// Number of batch outcomes kept for the rolling failure rate.
const SAMPLE_WINDOW: usize = 20;

/// Failure rate above which the AIMD value is halved.
const FAILURE_RATE_THRESHOLD: f64 = 0.25;

/// Memory ratio above which the table value is scaled down.
const MEMORY_SCALE_THRESHOLD: f64 = 0.7;
const MEMORY_SCALE: f64 = 0.7;

const MIN_CONCURRENCY: usize = 2;

/// The base concurrency for a device class on a network.
///
/// An unknown network is treated as fair.
pub fn table_concurrency(device: DeviceClass, network: NetworkStatus) -> usize {
    let column = match network {
        NetworkStatus::Offline => 0,
        NetworkStatus::Poor => 1,
        NetworkStatus::Fair | NetworkStatus::Unknown => 2,
        NetworkStatus::Good => 3,
        NetworkStatus::Excellent => 4,
    };
    let row: [usize; 5] = match device {
        DeviceClass::Desktop => [2, 3, 4, 6, 8],
        DeviceClass::Mobile => [2, 2, 3, 4, 6],
        DeviceClass::LowEndDesktop => [2, 2, 3, 4, 5],
        DeviceClass::LowEndMobile => [2, 2, 2, 3, 4],
    };
    row[column]
}

#[derive(Debug)]
struct ControllerState {
    aimd: usize,
    /// Success rate of each recent batch.
    samples: VecDeque<f64>,
}

/// A [`ConcurrencySource`] based on the lookup table and batch feedback.
#[derive(Debug)]
pub struct ConcurrencyController {
    max_concurrent_loads: usize,
    batch_size: Option<usize>,
    state: Mutex<ControllerState>,
}

impl ConcurrencyController {
    pub fn new(config: &LoaderConfig) -> Self {
        let max_concurrent_loads = config.max_concurrent_loads.max(MIN_CONCURRENCY);
        Self {
            max_concurrent_loads,
            batch_size: config.batch_size,
            state: Mutex::new(ControllerState {
                aimd: max_concurrent_loads,
                samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            }),
        }
    }

    /// The table value, or the configured batch size, scaled for memory pressure.
    pub fn batch_size_for(&self, context: &ConcurrencyContext) -> usize {
        let base = self
            .batch_size
            .unwrap_or_else(|| table_concurrency(context.device, context.network));
        let scaled = if context.memory_usage_ratio > MEMORY_SCALE_THRESHOLD {
            (base as f64 * MEMORY_SCALE) as usize
        } else {
            base
        };
        scaled.max(MIN_CONCURRENCY)
    }

    /// The current AIMD value.
    pub fn aimd(&self) -> usize {
        self.state.lock().aimd
    }

    /// The failure rate over the sample window.
    pub fn failure_rate(&self) -> f64 {
        let state = self.state.lock();
        if state.samples.is_empty() {
            return 0.0;
        }
        1.0 - state.samples.iter().sum::<f64>() / state.samples.len() as f64
    }
}

impl ConcurrencySource for ConcurrencyController {
    fn recommended_concurrency(&self, context: &ConcurrencyContext) -> usize {
        self.aimd().min(self.batch_size_for(context))
    }

    fn record_batch(&self, outcome: &BatchOutcome) {
        let mut state = self.state.lock();
        if state.samples.len() == SAMPLE_WINDOW {
            state.samples.pop_front();
        }
        state.samples.push_back(outcome.success_rate());

        let failure_rate =
            1.0 - state.samples.iter().sum::<f64>() / state.samples.len() as f64;
        let previous = state.aimd;
        if failure_rate > FAILURE_RATE_THRESHOLD {
            // multiplicative decrease
            state.aimd = (state.aimd / 2).max(MIN_CONCURRENCY);
        } else if outcome.failure_count == 0 {
            // additive increase
            state.aimd = (state.aimd + 1).min(self.max_concurrent_loads);
        }

        if state.aimd != previous {
            tracing::debug!(
                from = previous,
                to = state.aimd,
                failure_rate,
                "adjusted concurrency"
            );
        }
    }
}
