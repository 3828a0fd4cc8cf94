//! Concurrency strategies and the registry holding them.
//!
//! A strategy is a named pure function from the current [`ConcurrencyContext`] to a
//! recommended number of concurrent loads. The loader asks a [`ConcurrencySource`]
//! (the controller or the experiment harness) for that number before every batch.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::controller::table_concurrency;
use crate::error::LoadError;
use crate::types::{DeviceClass, NetworkStatus};

/// The input of every concurrency decision.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyContext {
    pub device: DeviceClass,
    pub network: NetworkStatus,
    pub memory_usage_ratio: f64,
    pub active_requests: usize,
    pub queued_requests: usize,
}

/// The outcome of one completed batch.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchOutcome {
    pub concurrency_used: usize,
    pub total_time: Duration,
    pub resource_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub context: ConcurrencyContext,
}

impl BatchOutcome {
    pub fn success_rate(&self) -> f64 {
        if self.resource_count == 0 {
            return 1.0;
        }
        self.success_count as f64 / self.resource_count as f64
    }
}

/// Where the loader gets its operating concurrency from.
pub trait ConcurrencySource: Send + Sync + fmt::Debug {
    fn recommended_concurrency(&self, context: &ConcurrencyContext) -> usize;

    /// Feeds back the outcome of a batch that ran with the recommended concurrency.
    fn record_batch(&self, outcome: &BatchOutcome);

    /// Called on every tick of the loader's background monitor.
    fn review(&self) {}
}

pub type ConcurrencyProvider = Arc<dyn Fn(&ConcurrencyContext) -> usize + Send + Sync>;

/// An unvalidated strategy registration.
#[derive(Clone, Default)]
pub struct StrategyConfig {
    pub id: Option<String>,
    pub name: Option<String>,
    /// Relative weight in the random assignment draw.
    pub weight: f64,
    pub provider: Option<ConcurrencyProvider>,
}

impl StrategyConfig {
    pub fn new<F>(id: impl Into<String>, name: impl Into<String>, provider: F) -> Self
    where
        F: Fn(&ConcurrencyContext) -> usize + Send + Sync + 'static,
    {
        Self {
            id: Some(id.into()),
            name: Some(name.into()),
            weight: 1.0,
            provider: Some(Arc::new(provider)),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

impl fmt::Debug for StrategyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("weight", &self.weight)
            .field("provider", &self.provider.as_ref().map(|_| ".."))
            .finish()
    }
}

/// A validated, registered strategy.
#[derive(Clone)]
pub struct Strategy {
    id: String,
    name: String,
    weight: f64,
    provider: ConcurrencyProvider,
}

impl Strategy {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Evaluates the provider, never returning less than one.
    pub fn concurrency(&self, context: &ConcurrencyContext) -> usize {
        (self.provider)(context).max(1)
    }
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strategy")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}

impl TryFrom<StrategyConfig> for Strategy {
    type Error = LoadError;

    fn try_from(config: StrategyConfig) -> Result<Self, Self::Error> {
        let id = config
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| LoadError::Validation("strategy is missing an id".into()))?;
        let name = config
            .name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| LoadError::Validation(format!("strategy `{id}` is missing a name")))?;
        let provider = config.provider.ok_or_else(|| {
            LoadError::Validation(format!("strategy `{id}` is missing a concurrency provider"))
        })?;
        if !config.weight.is_finite() || config.weight <= 0.0 {
            return Err(LoadError::Validation(format!(
                "strategy `{id}` has an invalid weight of {}",
                config.weight
            )));
        }

        Ok(Self {
            id,
            name,
            weight: config.weight,
            provider,
        })
    }
}

/// The set of registered strategies, in registration order.
#[derive(Clone, Debug, Default)]
pub struct StrategyRegistry {
    strategies: Vec<Strategy>,
}

impl StrategyRegistry {
    /// Validates and registers a strategy. Ids must be unique.
    pub fn register(&mut self, config: StrategyConfig) -> Result<&Strategy, LoadError> {
        let strategy = Strategy::try_from(config)?;
        if self.get(strategy.id()).is_some() {
            return Err(LoadError::Validation(format!(
                "strategy `{}` is already registered",
                strategy.id()
            )));
        }
        self.strategies.push(strategy);
        Ok(&self.strategies[self.strategies.len() - 1])
    }

    pub fn get(&self, id: &str) -> Option<&Strategy> {
        self.strategies.iter().find(|s| s.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Strategy> {
        self.strategies.iter()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Picks a strategy at random, proportionally to the weights.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Strategy> {
        let total: f64 = self.strategies.iter().map(|s| s.weight).sum();
        if self.strategies.is_empty() || total <= 0.0 {
            return None;
        }

        let mut point = rng.random_range(0.0..total);
        for strategy in &self.strategies {
            if point < strategy.weight {
                return Some(strategy);
            }
            point -= strategy.weight;
        }
        // float rounding can leave `point` just above the last weight
        self.strategies.last()
    }
}

/// The strategies registered by default when experimenting.
///
/// * `fixed-4` and `fixed-8` ignore the context entirely.
/// * `adaptive-network` follows the device and network lookup table and backs off
///   under memory pressure.
pub fn builtin_strategies() -> Vec<StrategyConfig> {
    vec![
        StrategyConfig::new("fixed-4", "Fixed concurrency of 4", |_| 4),
        StrategyConfig::new("fixed-8", "Fixed concurrency of 8", |_| 8),
        StrategyConfig::new("adaptive-network", "Network adaptive", |ctx| {
            let base = table_concurrency(ctx.device, ctx.network);
            if ctx.memory_usage_ratio > 0.7 {
                ((base as f64 * 0.7) as usize).max(2)
            } else {
                base
            }
        }),
    ]
}
