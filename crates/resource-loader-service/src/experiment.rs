//! The concurrency strategy experiment.
//!
//! Every client is assigned one registered strategy by a weighted random draw. The
//! assignment is persisted so that a client keeps its strategy across restarts, and
//! every completed batch is recorded as a sample for the assigned strategy. From
//! these samples the harness scores strategies and can promote the best one.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::ExperimentConfig;
use crate::error::StorageError;
use crate::storage::{StateStore, StateWriter};
use crate::strategy::{
    BatchOutcome, ConcurrencyContext, ConcurrencySource, StrategyConfig, StrategyRegistry,
};

/// One recorded batch outcome, attributed to the strategy that was active.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSample {
    pub timestamp: DateTime<Utc>,
    pub strategy_id: String,
    pub concurrency_used: usize,
    pub total_time_ms: f64,
    pub resource_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub context: ConcurrencyContext,
}

impl ExperimentSample {
    pub fn from_outcome(strategy_id: &str, outcome: &BatchOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            strategy_id: strategy_id.to_owned(),
            concurrency_used: outcome.concurrency_used,
            total_time_ms: outcome.total_time.as_secs_f64() * 1000.0,
            resource_count: outcome.resource_count,
            success_count: outcome.success_count,
            failure_count: outcome.failure_count,
            context: outcome.context.clone(),
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.resource_count == 0 {
            return 1.0;
        }
        self.success_count as f64 / self.resource_count as f64
    }
}

/// Aggregated statistics of one strategy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StrategyResult {
    pub strategy_id: String,
    pub name: String,
    pub sample_count: usize,
    pub avg_total_time_ms: f64,
    pub avg_success_rate: f64,
    pub recent_avg_total_time_ms: f64,
    pub recent_success_rate: f64,
    pub score: f64,
}

/// The current standing of the experiment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub test_id: String,
    pub active_strategy_id: Option<String>,
    pub best_strategy_id: Option<String>,
    /// Strategies with at least one sample, in registration order.
    pub strategies: Vec<StrategyResult>,
}

impl ExperimentResults {
    pub fn get(&self, strategy_id: &str) -> Option<&StrategyResult> {
        self.strategies
            .iter()
            .find(|result| result.strategy_id == strategy_id)
    }
}

type SampleMap = BTreeMap<String, Vec<ExperimentSample>>;

#[derive(Debug, Default)]
struct HarnessState {
    registry: StrategyRegistry,
    active: Option<String>,
    samples: SampleMap,
}

/// Assigns strategies, records their outcomes and promotes the best one.
#[derive(Debug)]
pub struct ExperimentHarness {
    config: ExperimentConfig,
    writer: Arc<StateWriter>,
    rng: Mutex<StdRng>,
    state: Mutex<HarnessState>,
    results: watch::Sender<ExperimentResults>,
}

impl ExperimentHarness {
    /// Creates a harness and loads persisted samples, dropping those older than the
    /// retention window.
    ///
    /// State is written to `store` in the background, see [`flush`](Self::flush).
    pub fn new(config: ExperimentConfig, store: Arc<dyn StateStore>) -> Self {
        let (results, _) = watch::channel(ExperimentResults {
            test_id: config.test_id.clone(),
            ..Default::default()
        });
        let harness = Self {
            config,
            writer: StateWriter::new(store),
            rng: Mutex::new(StdRng::from_os_rng()),
            state: Mutex::new(HarnessState::default()),
            results,
        };
        harness.load_samples();
        harness
    }

    /// Replaces the random number generator, for reproducible draws.
    pub fn with_rng(self, rng: StdRng) -> Self {
        *self.rng.lock() = rng;
        self
    }

    pub fn test_id(&self) -> &str {
        &self.config.test_id
    }

    fn assignment_key(&self) -> String {
        format!("{}.assignment", self.config.test_id)
    }

    fn samples_key(&self) -> String {
        format!("{}.samples", self.config.test_id)
    }

    /// Registers a strategy. Malformed or duplicate strategies are logged and rejected.
    pub fn add_strategy(&self, config: StrategyConfig) -> bool {
        match self.state.lock().registry.register(config) {
            Ok(strategy) => {
                tracing::debug!(strategy = strategy.id(), "registered strategy");
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "rejected strategy");
                false
            }
        }
    }

    /// Registers many strategies. Returns `false` if any of them was rejected, the
    /// valid ones are registered regardless.
    pub fn add_strategies(&self, configs: impl IntoIterator<Item = StrategyConfig>) -> bool {
        configs
            .into_iter()
            .fold(true, |all_ok, config| self.add_strategy(config) && all_ok)
    }

    /// Returns the strategy assigned to this client, assigning one if necessary.
    ///
    /// A persisted assignment is reused as long as its strategy is still registered.
    pub fn init_test(&self) -> Option<String> {
        {
            let state = self.state.lock();
            if let Some(active) = &state.active {
                if state.registry.get(active).is_some() {
                    return Some(active.clone());
                }
            }
        }

        if let Some(persisted) = self.load_assignment() {
            let mut state = self.state.lock();
            if state.registry.get(&persisted).is_some() {
                tracing::debug!(strategy = %persisted, "reusing persisted strategy");
                state.active = Some(persisted.clone());
                return Some(persisted);
            }
            tracing::info!(strategy = %persisted, "persisted strategy is no longer registered");
        }

        let drawn = {
            let mut state = self.state.lock();
            let drawn = state
                .registry
                .draw(&mut *self.rng.lock())
                .map(|strategy| strategy.id().to_owned())?;
            state.active = Some(drawn.clone());
            drawn
        };
        tracing::info!(test_id = %self.config.test_id, strategy = %drawn, "assigned strategy");
        self.save_assignment(&drawn);
        Some(drawn)
    }

    /// Assigns a specific registered strategy, replacing the current assignment.
    pub fn assign_strategy(&self, strategy_id: &str) -> bool {
        {
            let mut state = self.state.lock();
            if state.registry.get(strategy_id).is_none() {
                tracing::error!(strategy = strategy_id, "cannot assign unknown strategy");
                return false;
            }
            state.active = Some(strategy_id.to_owned());
        }
        self.save_assignment(strategy_id);
        true
    }

    /// The currently assigned strategy, if any.
    pub fn active_strategy(&self) -> Option<String> {
        self.state.lock().active.clone()
    }

    /// Evaluates the assigned strategy, or falls back to the default concurrency.
    pub fn recommended_concurrency(&self, context: &ConcurrencyContext) -> usize {
        let state = self.state.lock();
        state
            .active
            .as_deref()
            .and_then(|id| state.registry.get(id))
            .map(|strategy| strategy.concurrency(context))
            .unwrap_or(self.config.default_concurrency)
    }

    /// Records a batch outcome for the assigned strategy and publishes the new results.
    pub fn record_result(&self, outcome: &BatchOutcome) {
        let serialized = {
            let mut state = self.state.lock();
            let Some(active) = state.active.clone() else {
                tracing::debug!("no strategy assigned, dropping experiment sample");
                return;
            };

            let samples = state.samples.entry(active.clone()).or_default();
            samples.push(ExperimentSample::from_outcome(&active, outcome));
            if samples.len() > self.config.max_samples {
                let excess = samples.len() - self.config.max_samples;
                samples.drain(..excess);
            }
            serde_json::to_string(&state.samples)
        };

        match serialized {
            Ok(serialized) => self.persist(&self.samples_key(), &serialized),
            Err(e) => tracing::error!(error = %e, "failed to serialize experiment samples"),
        }

        self.results.send_replace(self.get_test_results());
    }

    /// Subscribes to the results published after every recorded sample.
    pub fn subscribe_results(&self) -> watch::Receiver<ExperimentResults> {
        self.results.subscribe()
    }

    /// Scores every strategy that has samples.
    ///
    /// The score is `recent success rate * success_weight - recent average time (ms) / time_divisor`,
    /// over the last `recent_window` samples.
    pub fn get_test_results(&self) -> ExperimentResults {
        let state = self.state.lock();

        let strategies: Vec<StrategyResult> = state
            .registry
            .iter()
            .filter_map(|strategy| {
                let samples = state.samples.get(strategy.id())?;
                if samples.is_empty() {
                    return None;
                }
                let recent = &samples[samples.len().saturating_sub(self.config.recent_window)..];
                let (recent_avg_total_time_ms, recent_success_rate) = averages(recent);
                let (avg_total_time_ms, avg_success_rate) = averages(samples);
                let score = recent_success_rate * self.config.success_weight
                    - recent_avg_total_time_ms / self.config.time_divisor;

                Some(StrategyResult {
                    strategy_id: strategy.id().to_owned(),
                    name: strategy.name().to_owned(),
                    sample_count: samples.len(),
                    avg_total_time_ms,
                    avg_success_rate,
                    recent_avg_total_time_ms,
                    recent_success_rate,
                    score,
                })
            })
            .collect();

        let best_strategy_id = strategies
            .iter()
            .fold(None::<&StrategyResult>, |best, result| match best {
                Some(best) if best.score >= result.score => Some(best),
                _ => Some(result),
            })
            .map(|best| best.strategy_id.clone());

        ExperimentResults {
            test_id: self.config.test_id.clone(),
            active_strategy_id: state.active.clone(),
            best_strategy_id,
            strategies,
        }
    }

    /// Promotes the best scoring strategy and persists the assignment.
    pub fn select_best_strategy(&self) -> Option<String> {
        let best = self.get_test_results().best_strategy_id?;
        self.promote(&best);
        Some(best)
    }

    /// Promotes the best strategy if it clearly beats the assigned one.
    ///
    /// The challenger needs more than `min_samples_for_switch` samples and a score
    /// more than `switch_threshold` above the incumbent's, relative to the
    /// incumbent's absolute score.
    pub fn maybe_promote(&self) -> Option<String> {
        let results = self.get_test_results();
        let best = results.get(results.best_strategy_id.as_deref()?)?;
        if results.active_strategy_id.as_deref() == Some(best.strategy_id.as_str()) {
            return None;
        }
        if best.sample_count <= self.config.min_samples_for_switch {
            return None;
        }

        if let Some(incumbent) = results
            .active_strategy_id
            .as_deref()
            .and_then(|id| results.get(id))
        {
            let required = incumbent.score + self.config.switch_threshold * incumbent.score.abs();
            if best.score <= required {
                return None;
            }
        }

        tracing::info!(
            from = results.active_strategy_id.as_deref().unwrap_or("none"),
            to = %best.strategy_id,
            score = best.score,
            "promoting better strategy"
        );
        self.promote(&best.strategy_id);
        Some(best.strategy_id.clone())
    }

    fn promote(&self, strategy_id: &str) {
        self.state.lock().active = Some(strategy_id.to_owned());
        self.save_assignment(strategy_id);
        metric!(counter("experiment.promoted") += 1, "strategy" => strategy_id);
    }

    /// Drops the assignment (and optionally all samples) and assigns anew.
    pub fn reset_test(&self, clear_results: bool) -> Option<String> {
        {
            let mut state = self.state.lock();
            state.active = None;
            if clear_results {
                state.samples.clear();
            }
        }
        self.remove(&self.assignment_key());
        if clear_results {
            self.remove(&self.samples_key());
        }
        self.init_test()
    }

    fn load_assignment(&self) -> Option<String> {
        let key = self.assignment_key();
        match self.read::<String>(&key) {
            Ok(assignment) => assignment,
            Err(e) => {
                let dynerr: &dyn std::error::Error = &e;
                tracing::error!(error = dynerr, %key, "failed to load strategy assignment");
                None
            }
        }
    }

    fn save_assignment(&self, strategy_id: &str) {
        match serde_json::to_string(strategy_id) {
            Ok(value) => self.persist(&self.assignment_key(), &value),
            Err(e) => tracing::error!(error = %e, "failed to serialize strategy assignment"),
        }
    }

    fn load_samples(&self) {
        let key = self.samples_key();
        let mut samples = match self.read::<SampleMap>(&key) {
            Ok(samples) => samples.unwrap_or_default(),
            Err(e) => {
                let dynerr: &dyn std::error::Error = &e;
                tracing::error!(error = dynerr, %key, "failed to load experiment samples");
                return;
            }
        };

        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut expired = 0;
        for list in samples.values_mut() {
            let before = list.len();
            list.retain(|sample| sample.timestamp >= cutoff);
            expired += before - list.len();
        }
        samples.retain(|_, list| !list.is_empty());

        if expired > 0 {
            tracing::info!(expired, "dropped expired experiment samples");
            match serde_json::to_string(&samples) {
                Ok(serialized) => self.persist(&key, &serialized),
                Err(e) => tracing::error!(error = %e, "failed to serialize experiment samples"),
            }
        }

        self.state.lock().samples = samples;
    }

    fn read<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.writer.get(key)? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    fn persist(&self, key: &str, value: &str) {
        self.writer.set(key, value);
    }

    fn remove(&self, key: &str) {
        self.writer.remove(key);
    }

    /// Waits until the assignment and samples have been written to the state store.
    pub async fn flush(&self) {
        self.writer.flush().await;
    }
}

impl ConcurrencySource for ExperimentHarness {
    fn recommended_concurrency(&self, context: &ConcurrencyContext) -> usize {
        ExperimentHarness::recommended_concurrency(self, context)
    }

    fn record_batch(&self, outcome: &BatchOutcome) {
        self.record_result(outcome)
    }

    fn review(&self) {
        self.maybe_promote();
    }
}

/// Average total time and success rate.
fn averages(samples: &[ExperimentSample]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let count = samples.len() as f64;
    let time = samples.iter().map(|s| s.total_time_ms).sum::<f64>() / count;
    let success = samples.iter().map(|s| s.success_rate()).sum::<f64>() / count;
    (time, success)
}
