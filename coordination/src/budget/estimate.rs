//! Token estimation from document size hints.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Metadata;

/// Estimate used when a document carries no usable size information.
pub const DEFAULT_TOKEN_ESTIMATE: u64 = 512;

/// Lower bound applied to any stage weight.
pub const MIN_STAGE_WEIGHT: f64 = 0.1;

const CHARS_PER_TOKEN: u64 = 4;

/// Size information known about a document before any agent runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeHint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_estimate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub char_count: Option<u64>,
}

impl SizeHint {
    pub fn from_tokens(tokens: u64) -> Self {
        Self {
            token_estimate: Some(tokens),
            ..Self::default()
        }
    }

    pub fn from_bytes(size_bytes: u64) -> Self {
        Self {
            size_bytes: Some(size_bytes),
            ..Self::default()
        }
    }

    pub fn with_char_count(mut self, char_count: u64) -> Self {
        self.char_count = Some(char_count);
        self
    }

    /// Read `token_estimate`, `size_bytes` and `char_count` from loosely typed
    /// document metadata. Values that are not non-negative integers (or
    /// integer strings) are ignored.
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            token_estimate: metadata.get("token_estimate").and_then(as_count),
            size_bytes: metadata.get("size_bytes").and_then(as_count),
            char_count: metadata.get("char_count").and_then(as_count),
        }
    }

    /// Unweighted token count: `token_estimate`, else `ceil(size_bytes / 4)`,
    /// else `ceil(char_count / 4)`, else [`DEFAULT_TOKEN_ESTIMATE`].
    pub fn base_tokens(&self) -> u64 {
        if let Some(tokens) = self.token_estimate.filter(|t| *t > 0) {
            return tokens;
        }
        if let Some(bytes) = self.size_bytes.filter(|b| *b > 0) {
            return bytes.div_ceil(CHARS_PER_TOKEN);
        }
        if let Some(chars) = self.char_count.filter(|c| *c > 0) {
            return chars.div_ceil(CHARS_PER_TOKEN);
        }
        DEFAULT_TOKEN_ESTIMATE
    }

    /// Weighted estimate, never below one token.
    pub fn estimate(&self, weight: f64) -> u64 {
        let weight = weight.max(MIN_STAGE_WEIGHT);
        let scaled = (self.base_tokens() as f64 * weight).ceil() as u64;
        scaled.max(1)
    }
}

fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Relative cost of each `(agent, step)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageWeights {
    weights: BTreeMap<String, BTreeMap<String, f64>>,
}

impl StageWeights {
    /// A table with no entries; every lookup yields 1.0.
    pub fn empty() -> Self {
        Self {
            weights: BTreeMap::new(),
        }
    }

    pub fn with_weight(mut self, agent: impl Into<String>, step: impl Into<String>, weight: f64) -> Self {
        self.set(agent, step, weight);
        self
    }

    pub fn set(&mut self, agent: impl Into<String>, step: impl Into<String>, weight: f64) {
        self.weights
            .entry(agent.into())
            .or_default()
            .insert(step.into(), weight);
    }

    pub fn get(&self, agent: &str, step: &str) -> f64 {
        self.weights
            .get(agent)
            .and_then(|steps| steps.get(step))
            .copied()
            .unwrap_or(1.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, f64)> {
        self.weights.iter().flat_map(|(agent, steps)| {
            steps
                .iter()
                .map(move |(step, weight)| (agent.as_str(), step.as_str(), *weight))
        })
    }

    pub fn len(&self) -> usize {
        self.weights.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StageWeights {
    fn default() -> Self {
        Self::empty()
            .with_weight("extractor", "ingest", 1.0)
            .with_weight("auditor", "analysis", 0.7)
            .with_weight("classifier", "classification", 0.5)
            .with_weight("accountant", "reconciliation", 0.4)
            .with_weight("cross_validator", "consistency", 0.35)
            .with_weight("intelligence", "analysis", 0.9)
    }
}

/// Token counts along the three scopes, used both for batch estimates and
/// for the consumed-counters snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    pub total: u64,
    pub per_agent: BTreeMap<String, u64>,
    pub per_step: BTreeMap<String, BTreeMap<String, u64>>,
}

impl UsageReport {
    pub fn add(&mut self, agent: &str, step: &str, tokens: u64) {
        self.total += tokens;
        *self.per_agent.entry(agent.to_string()).or_default() += tokens;
        *self
            .per_step
            .entry(agent.to_string())
            .or_default()
            .entry(step.to_string())
            .or_default() += tokens;
    }

    pub fn agent(&self, agent: &str) -> u64 {
        self.per_agent.get(agent).copied().unwrap_or(0)
    }

    pub fn step(&self, agent: &str, step: &str) -> u64 {
        self.per_step
            .get(agent)
            .and_then(|steps| steps.get(step))
            .copied()
            .unwrap_or(0)
    }
}
