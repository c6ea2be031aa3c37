//! Pipeline configuration.
//!
//! Loaded from an optional `docflow.toml`, then overridden from the
//! environment:
//!
//! | variable | field |
//! |----------|-------|
//! | `DOCFLOW_BUDGET_TOTAL` | `budget.total` |
//! | `DOCFLOW_WORKERS` | `workers` |
//! | `DOCFLOW_GUARD_ENABLED` | `guard.enabled` |
//! | `DOCFLOW_TELEMETRY_PATH` | `telemetry_path` |

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use coordination::budget::BudgetLimits;
use coordination::metrics::{EfficiencyThreshold, DEFAULT_SCOPE};
use coordination::prompt::DEFAULT_COMPRESSION_RATIO;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_AGENT_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub enabled: bool,
    pub max_timeout_ms: u64,
    pub timeout_step_ms: u64,
    /// `{scope: thresholds}`. Kept loosely typed so a malformed scope only
    /// disables that scope.
    pub thresholds: Value,
}

impl Default for GuardConfig {
    fn default() -> Self {
        let mut thresholds = Map::new();
        thresholds.insert(
            DEFAULT_SCOPE.to_string(),
            serde_json::to_value(EfficiencyThreshold::standard()).unwrap_or_default(),
        );
        Self {
            enabled: true,
            max_timeout_ms: 180_000,
            timeout_step_ms: 1_000,
            thresholds: Value::Object(thresholds),
        }
    }
}

impl GuardConfig {
    pub fn threshold_table(&self) -> HashMap<String, EfficiencyThreshold> {
        EfficiencyThreshold::parse_table(&self.thresholds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub embedding_capacity: usize,
    pub summary_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            embedding_capacity: 512,
            summary_capacity: 512,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub compression_ratio: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            compression_ratio: DEFAULT_COMPRESSION_RATIO,
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub budget: BudgetLimits,
    pub guard: GuardConfig,
    pub cache: CacheConfig,
    pub optimizer: OptimizerConfig,
    /// Size of the blocking worker pool.
    pub workers: usize,
    /// Initial timeout of every agent.
    pub default_timeout_ms: u64,
    pub telemetry_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            budget: BudgetLimits::unlimited(),
            guard: GuardConfig::default(),
            cache: CacheConfig::default(),
            optimizer: OptimizerConfig::default(),
            workers: DEFAULT_WORKERS,
            default_timeout_ms: DEFAULT_AGENT_TIMEOUT_MS,
            telemetry_path: None,
        }
    }
}

impl PipelineConfig {
    /// Read `path` (if given), apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                Self::from_toml(&raw)
                    .with_context(|| format!("Failed to parse config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `DOCFLOW_*` overrides using `lookup` to read variables.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(total) = lookup("DOCFLOW_BUDGET_TOTAL") {
            self.budget.total = total
                .trim()
                .parse()
                .with_context(|| format!("DOCFLOW_BUDGET_TOTAL is not a number: {total}"))?;
        }
        if let Some(workers) = lookup("DOCFLOW_WORKERS") {
            self.workers = workers
                .trim()
                .parse()
                .with_context(|| format!("DOCFLOW_WORKERS is not a number: {workers}"))?;
        }
        if let Some(enabled) = lookup("DOCFLOW_GUARD_ENABLED") {
            self.guard.enabled = matches!(
                enabled.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(path) = lookup("DOCFLOW_TELEMETRY_PATH") {
            self.telemetry_path = (!path.trim().is_empty()).then(|| PathBuf::from(path.trim()));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        let ratio = self.optimizer.compression_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            bail!("optimizer.compression_ratio must be in (0, 1], got {ratio}");
        }
        if self.cache.embedding_capacity == 0 || self.cache.summary_capacity == 0 {
            bail!("cache capacities must be positive");
        }
        if self.guard.timeout_step_ms == 0 {
            bail!("guard.timeout_step_ms must be positive");
        }
        Ok(())
    }
}
