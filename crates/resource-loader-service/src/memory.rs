//! Memory pressure probing and classification.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A discrete classification of memory pressure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTier {
    #[default]
    Normal,
    Medium,
    High,
    Critical,
}

impl MemoryTier {
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio < 0.5 {
            Self::Normal
        } else if ratio < 0.7 {
            Self::Medium
        } else if ratio < 0.85 {
            Self::High
        } else {
            Self::Critical
        }
    }

    /// The factor applied to the maximum concurrency in this tier.
    pub fn concurrency_scale(self) -> f64 {
        match self {
            Self::Normal => 1.0,
            Self::Medium => 0.75,
            Self::High => 0.5,
            Self::Critical => 0.25,
        }
    }

    /// The concurrency ceiling for this tier, never below 2.
    pub fn concurrency_ceiling(self, max_concurrent_loads: usize) -> usize {
        ((max_concurrent_loads as f64 * self.concurrency_scale()).floor() as usize).max(2)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reports the current memory usage as a ratio of the available budget.
pub trait MemoryProbe: Send + Sync + fmt::Debug {
    /// The usage ratio in `0.0..=1.0`, `None` if it cannot be determined.
    fn usage_ratio(&self) -> Option<f64>;
}

/// Reads the resident set size of the current process from procfs.
///
/// The budget is either configured, or the total memory of the machine.
/// On platforms without procfs the probe reports nothing.
#[derive(Debug, Default)]
pub struct ProcessMemoryProbe {
    budget: Option<u64>,
}

impl ProcessMemoryProbe {
    pub fn new(budget: Option<u64>) -> Self {
        Self { budget }
    }

    fn budget(&self) -> Option<u64> {
        match self.budget {
            Some(budget) => Some(budget),
            None => read_kb_field("/proc/meminfo", "MemTotal:").map(|kb| kb * 1024),
        }
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn usage_ratio(&self) -> Option<f64> {
        let resident = read_kb_field("/proc/self/status", "VmRSS:")? * 1024;
        let budget = self.budget().filter(|b| *b > 0)?;
        Some((resident as f64 / budget as f64).clamp(0.0, 1.0))
    }
}

/// Reads a `Name:   1234 kB` line from a procfs file.
fn read_kb_field(path: &str, field: &str) -> Option<u64> {
    let contents = std::fs::read_to_string(path).ok()?;
    parse_kb_field(&contents, field)
}

fn parse_kb_field(contents: &str, field: &str) -> Option<u64> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix(field))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

/// A probe with a value set from the outside, for hosts that measure memory
/// themselves and for tests.
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    // f64 bits
    ratio: AtomicU64,
}

impl FixedMemoryProbe {
    pub fn new(ratio: f64) -> Self {
        Self {
            ratio: AtomicU64::new(ratio.to_bits()),
        }
    }

    pub fn set(&self, ratio: f64) {
        self.ratio.store(ratio.to_bits(), Ordering::Relaxed);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn usage_ratio(&self) -> Option<f64> {
        Some(f64::from_bits(self.ratio.load(Ordering::Relaxed)))
    }
}
