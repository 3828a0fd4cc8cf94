use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::types::DeviceClass;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the loader.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "resource_loader".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Retry policy for transient failures.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryStrategy {
    /// Maximum number of retries after the initial attempt.
    pub count: u32,
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    /// Multiplier applied to the delay for every further retry.
    pub backoff_factor: f64,
    /// Adds up to +30% random jitter to every delay.
    pub jitter: bool,
    /// Upper bound for any delay, jitter included.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            count: 3,
            delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            jitter: true,
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Debouncing of network status changes.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkDebounceConfig {
    /// The window in which status changes are counted.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// The number of changes within `window` that counts as flapping.
    pub threshold: usize,
}

impl Default for NetworkDebounceConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            threshold: 3,
        }
    }
}

/// Configuration of the resource loader itself.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Upper bound for the number of concurrent loads.
    ///
    /// Memory pressure scales this down, it never grows above the configured value.
    pub max_concurrent_loads: usize,

    /// A fixed batch size that replaces the device/network lookup table.
    pub batch_size: Option<usize>,

    /// Whether loaded resources are kept in the resource cache.
    pub enable_cache: bool,

    /// Whether the resource cache is persisted to `cache_dir` and restored on startup.
    pub persist_cache: bool,

    /// Where a persistent cache keeps its files.
    pub cache_dir: Option<PathBuf>,

    /// How long a cached resource stays valid.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,

    /// Maximum number of entries in the in-memory cache.
    pub cache_capacity: u64,

    /// Whether concurrent loads of the same URL share one network operation.
    pub enable_request_merging: bool,

    /// Retry policy for transient failures.
    pub retry: RetryStrategy,

    /// Timeout for a single attempt.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// The class of device, used to pick the concurrency lookup table row.
    pub device_type: DeviceClass,

    /// Enables the periodic monitor that samples memory, detects anomalies and
    /// reports telemetry.
    pub enable_performance_monitoring: bool,

    /// Use the strategy experiment to pick the concurrency instead of the controller.
    pub use_ab_testing: bool,

    /// Interval of the background monitor.
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,

    /// Batches with more unique urls than this are grouped by resource type,
    /// putting stylesheets, scripts and data first.
    pub batch_grouping_threshold: usize,

    /// Fraction of the cache pruned when entering the critical memory tier.
    pub memory_prune_fraction: f64,

    /// Memory budget of the process in bytes, used to compute the memory usage ratio.
    pub memory_budget: Option<u64>,

    /// Active requests older than this are reported as hanging.
    #[serde(with = "humantime_serde")]
    pub hanging_request_threshold: Duration,

    /// Debouncing of network status changes.
    pub network_debounce: NetworkDebounceConfig,

    /// Attach the bearer token from the token store to every request.
    pub enterprise_mode: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_loads: 8,
            batch_size: None,
            enable_cache: true,
            persist_cache: false,
            cache_dir: None,
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            cache_capacity: 10_000,
            enable_request_merging: true,
            retry: RetryStrategy::default(),
            timeout: Duration::from_secs(30),
            device_type: DeviceClass::Desktop,
            enable_performance_monitoring: true,
            use_ab_testing: false,
            monitor_interval: Duration::from_secs(5),
            batch_grouping_threshold: 10,
            memory_prune_fraction: 0.3,
            memory_budget: None,
            hanging_request_threshold: Duration::from_secs(30),
            network_debounce: NetworkDebounceConfig::default(),
            enterprise_mode: false,
        }
    }
}

/// Configuration of the concurrency strategy experiment.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Identifier of the experiment, all persisted keys are derived from it.
    pub test_id: String,

    /// Directory for persisted experiment state. Without one, state lives in memory only.
    pub state_dir: Option<PathBuf>,

    /// Samples older than this are dropped when state is loaded.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,

    /// Rolling window of samples kept per strategy.
    pub max_samples: usize,

    /// Number of most recent samples that make up the "recent" statistics.
    pub recent_window: usize,

    /// Concurrency used when no strategy is active.
    pub default_concurrency: usize,

    /// A challenger needs more samples than this before it can be promoted.
    pub min_samples_for_switch: usize,

    /// Relative score improvement a challenger needs over the active strategy.
    pub switch_threshold: f64,

    /// Weight of the success rate in the strategy score.
    ///
    /// Together with `time_divisor` these are tuning knobs, not derived values.
    pub success_weight: f64,

    /// Divisor applied to the average total time (ms) in the strategy score.
    pub time_divisor: f64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            test_id: "concurrency-strategy".into(),
            state_dir: None,
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            max_samples: 1000,
            recent_window: 30,
            default_concurrency: 8,
            min_samples_for_switch: 10,
            switch_threshold: 0.2,
            success_weight: 10.0,
            time_divisor: 100.0,
        }
    }
}

/// See the README for more information on config values.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The resource loader.
    pub loader: LoaderConfig,

    /// The concurrency strategy experiment.
    pub experiment: ExperimentConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
