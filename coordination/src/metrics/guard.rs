//! Threshold rules that turn metric breaches into tuning decisions.
//!
//! The guard never mutates agent state. It returns [`AdjustmentDecision`]s
//! and the caller applies them (see [`super::AgentControls`]).
//!
//! Each `(agent, action)` pair remembers the signature of the last decision
//! it emitted; a rule only fires again when its triggering value changes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::MetricSummary;

/// Scope consulted when an agent has no thresholds of its own.
pub const DEFAULT_SCOPE: &str = "default";

/// Batch size multiplier proposed on low throughput.
pub const BATCH_SIZE_MULTIPLIER: f64 = 1.25;

/// Per-scope breach thresholds. An absent field disables its rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EfficiencyThreshold {
    pub latency_ms: Option<f64>,
    pub error_rate: Option<f64>,
    pub throughput_min: Option<f64>,
    pub consecutive_retries: Option<u32>,
}

impl EfficiencyThreshold {
    /// The built-in default scope thresholds.
    pub fn standard() -> Self {
        Self {
            latency_ms: Some(2_500.0),
            error_rate: Some(0.15),
            throughput_min: Some(1.0),
            consecutive_retries: Some(3),
        }
    }

    /// No rules evaluated.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_disabled(&self) -> bool {
        self == &Self::disabled()
    }

    /// Parse one scope's thresholds. Malformed input yields a disabled
    /// threshold rather than an error.
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|_| Self::disabled())
    }

    /// Parse a `{scope: thresholds}` table. A non-object yields an empty
    /// table.
    pub fn parse_table(value: &Value) -> HashMap<String, Self> {
        match value {
            Value::Object(scopes) => scopes
                .iter()
                .map(|(scope, thresholds)| (scope.clone(), Self::from_value(thresholds)))
                .collect(),
            _ => HashMap::new(),
        }
    }
}

/// Kind of tuning decision, used for dedupe bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentAction {
    UpdateTimeout,
    EnableRecoveryMode,
    IncreaseBatchSize,
    EscalateRetries,
}

impl std::fmt::Display for AdjustmentAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpdateTimeout => write!(f, "update_timeout"),
            Self::EnableRecoveryMode => write!(f, "enable_recovery_mode"),
            Self::IncreaseBatchSize => write!(f, "increase_batch_size"),
            Self::EscalateRetries => write!(f, "escalate_retries"),
        }
    }
}

/// What a decision asks the caller to change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "parameters", rename_all = "snake_case")]
pub enum Adjustment {
    UpdateTimeout {
        timeout_ms: u64,
        observed_latency_ms: f64,
    },
    EnableRecoveryMode {
        enabled: bool,
        error_rate: f64,
    },
    IncreaseBatchSize {
        multiplier: f64,
        current_throughput: u64,
    },
    EscalateRetries {
        retries: u32,
    },
}

impl Adjustment {
    pub fn action(&self) -> AdjustmentAction {
        match self {
            Self::UpdateTimeout { .. } => AdjustmentAction::UpdateTimeout,
            Self::EnableRecoveryMode { .. } => AdjustmentAction::EnableRecoveryMode,
            Self::IncreaseBatchSize { .. } => AdjustmentAction::IncreaseBatchSize,
            Self::EscalateRetries { .. } => AdjustmentAction::EscalateRetries,
        }
    }
}

/// A tuning decision: `{action, parameters, reason, triggered_at}` on the
/// wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentDecision {
    #[serde(flatten)]
    pub adjustment: Adjustment,
    pub reason: String,
    pub triggered_at: DateTime<Utc>,
}

impl AdjustmentDecision {
    pub fn action(&self) -> AdjustmentAction {
        self.adjustment.action()
    }
}

/// Evaluates [`EfficiencyThreshold`]s against a [`MetricSummary`].
#[derive(Debug, Clone)]
pub struct EfficiencyGuard {
    thresholds: HashMap<String, EfficiencyThreshold>,
    max_timeout_ms: u64,
    timeout_step_ms: u64,
    last_signatures: HashMap<(String, AdjustmentAction), u64>,
}

impl EfficiencyGuard {
    pub fn new(
        thresholds: HashMap<String, EfficiencyThreshold>,
        max_timeout_ms: u64,
        timeout_step_ms: u64,
    ) -> Self {
        Self {
            thresholds,
            max_timeout_ms,
            timeout_step_ms,
            last_signatures: HashMap::new(),
        }
    }

    /// Guard with only the [`EfficiencyThreshold::standard`] default scope.
    pub fn with_defaults(max_timeout_ms: u64, timeout_step_ms: u64) -> Self {
        let thresholds =
            HashMap::from([(DEFAULT_SCOPE.to_string(), EfficiencyThreshold::standard())]);
        Self::new(thresholds, max_timeout_ms, timeout_step_ms)
    }

    /// Thresholds applying to `scope`: its own entry, else the default scope.
    pub fn threshold_for(&self, scope: &str) -> Option<&EfficiencyThreshold> {
        self.thresholds
            .get(scope)
            .or_else(|| self.thresholds.get(DEFAULT_SCOPE))
    }

    /// Replace or add scope thresholds.
    pub fn update_thresholds(
        &mut self,
        thresholds: impl IntoIterator<Item = (String, EfficiencyThreshold)>,
    ) {
        self.thresholds.extend(thresholds);
    }

    pub fn update_timeouts(&mut self, max_timeout_ms: u64, timeout_step_ms: u64) {
        self.max_timeout_ms = max_timeout_ms;
        self.timeout_step_ms = timeout_step_ms;
    }

    pub fn max_timeout_ms(&self) -> u64 {
        self.max_timeout_ms
    }

    fn next_timeout(&self, current_timeout_ms: Option<u64>) -> Option<u64> {
        let baseline = current_timeout_ms.unwrap_or(0);
        let proposed = baseline
            .saturating_add(self.timeout_step_ms)
            .min(self.max_timeout_ms);
        (proposed > baseline).then_some(proposed)
    }

    fn register(&mut self, scope: &str, action: AdjustmentAction, signature: u64) -> bool {
        let key = (scope.to_string(), action);
        if self.last_signatures.get(&key) == Some(&signature) {
            return false;
        }
        self.last_signatures.insert(key, signature);
        true
    }

    /// Evaluate all four rules for `scope`. Never fails; a scope without
    /// thresholds yields no decisions.
    pub fn evaluate(
        &mut self,
        scope: &str,
        summary: &MetricSummary,
        current_timeout_ms: Option<u64>,
    ) -> Vec<AdjustmentDecision> {
        let Some(thresholds) = self.threshold_for(scope).cloned() else {
            return Vec::new();
        };

        let now = Utc::now();
        let avg_latency = summary.average_latency_ms().unwrap_or(0.0);
        let error_rate = summary.error_rate();
        let throughput = summary.throughput;
        let retries = summary.retries;
        let mut decisions = Vec::new();

        if let Some(limit) = thresholds.latency_ms.filter(|l| *l > 0.0) {
            if avg_latency > limit {
                if let Some(timeout_ms) = self.next_timeout(current_timeout_ms) {
                    if self.register(scope, AdjustmentAction::UpdateTimeout, timeout_ms) {
                        decisions.push(AdjustmentDecision {
                            adjustment: Adjustment::UpdateTimeout {
                                timeout_ms,
                                observed_latency_ms: round_to(avg_latency, 2),
                            },
                            reason: format!(
                                "average latency {avg_latency:.1}ms exceeded the {limit:.0}ms limit"
                            ),
                            triggered_at: now,
                        });
                    }
                }
            }
        }

        if let Some(limit) = thresholds.error_rate {
            let rounded = round_to(error_rate, 4);
            if error_rate > limit
                && self.register(
                    scope,
                    AdjustmentAction::EnableRecoveryMode,
                    (rounded * 10_000.0).round() as u64,
                )
            {
                decisions.push(AdjustmentDecision {
                    adjustment: Adjustment::EnableRecoveryMode {
                        enabled: true,
                        error_rate: rounded,
                    },
                    reason: format!(
                        "error rate {:.2}% exceeded the {:.2}% limit",
                        error_rate * 100.0,
                        limit * 100.0
                    ),
                    triggered_at: now,
                });
            }
        }

        if let Some(minimum) = thresholds.throughput_min {
            if (throughput as f64) < minimum
                && self.register(scope, AdjustmentAction::IncreaseBatchSize, throughput)
            {
                decisions.push(AdjustmentDecision {
                    adjustment: Adjustment::IncreaseBatchSize {
                        multiplier: BATCH_SIZE_MULTIPLIER,
                        current_throughput: throughput,
                    },
                    reason: format!("throughput {throughput} below the configured minimum {minimum}"),
                    triggered_at: now,
                });
            }
        }

        if let Some(limit) = thresholds.consecutive_retries.filter(|r| *r > 0) {
            if retries >= limit
                && self.register(scope, AdjustmentAction::EscalateRetries, u64::from(retries))
            {
                decisions.push(AdjustmentDecision {
                    adjustment: Adjustment::EscalateRetries { retries },
                    reason: format!("{retries} consecutive retries reached the limit of {limit}"),
                    triggered_at: now,
                });
            }
        }

        decisions
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ExecutionSample;
    use serde_json::json;

    fn guard_with(threshold: EfficiencyThreshold) -> EfficiencyGuard {
        EfficiencyGuard::new(
            HashMap::from([(DEFAULT_SCOPE.to_string(), threshold)]),
            180_000,
            1_000,
        )
    }

    fn latency_only(limit: f64) -> EfficiencyThreshold {
        EfficiencyThreshold {
            latency_ms: Some(limit),
            ..EfficiencyThreshold::disabled()
        }
    }

    fn summary_with(samples: &[ExecutionSample]) -> MetricSummary {
        let mut summary = MetricSummary::new("auditor");
        for sample in samples {
            summary.record(sample);
        }
        summary
    }

    #[test]
    fn test_latency_breach_proposes_bounded_timeout() {
        let mut guard = guard_with(latency_only(500.0));
        let summary = summary_with(&[ExecutionSample::success(600.0)]);

        let decisions = guard.evaluate("auditor", &summary, Some(2_000));
        assert_eq!(decisions.len(), 1);
        assert_eq!(
            decisions[0].adjustment,
            Adjustment::UpdateTimeout {
                timeout_ms: 3_000,
                observed_latency_ms: 600.0
            }
        );

        // Same trigger value: deduplicated.
        assert!(guard.evaluate("auditor", &summary, Some(2_000)).is_empty());
        // Timeout was applied, so the next candidate differs.
        assert_eq!(guard.evaluate("auditor", &summary, Some(3_000)).len(), 1);
    }

    #[test]
    fn test_timeout_never_exceeds_max() {
        let mut guard = guard_with(latency_only(500.0));
        guard.update_timeouts(2_500, 1_000);
        let summary = summary_with(&[ExecutionSample::success(900.0)]);

        let decisions = guard.evaluate("a", &summary, Some(2_000));
        assert!(matches!(
            decisions[0].adjustment,
            Adjustment::UpdateTimeout { timeout_ms: 2_500, .. }
        ));
        assert!(guard.evaluate("a", &summary, Some(2_500)).is_empty());
    }

    #[test]
    fn test_error_rate_signature_changes() {
        let mut guard = guard_with(EfficiencyThreshold {
            error_rate: Some(0.1),
            ..EfficiencyThreshold::disabled()
        });
        let mut summary = summary_with(&[ExecutionSample::failure(1.0)]);

        assert_eq!(guard.evaluate("a", &summary, None).len(), 1);
        assert!(guard.evaluate("a", &summary, None).is_empty());

        summary.record(&ExecutionSample::success(1.0));
        let decisions = guard.evaluate("a", &summary, None);
        assert_eq!(
            decisions[0].adjustment,
            Adjustment::EnableRecoveryMode {
                enabled: true,
                error_rate: 0.5
            }
        );
    }

    #[test]
    fn test_throughput_and_retry_rules() {
        let mut guard = guard_with(EfficiencyThreshold {
            throughput_min: Some(5.0),
            consecutive_retries: Some(2),
            ..EfficiencyThreshold::disabled()
        });
        let summary = summary_with(&[ExecutionSample::success(1.0).with_retries(2)]);

        let actions: Vec<_> = guard
            .evaluate("a", &summary, None)
            .iter()
            .map(AdjustmentDecision::action)
            .collect();
        assert_eq!(
            actions,
            vec![AdjustmentAction::IncreaseBatchSize, AdjustmentAction::EscalateRetries]
        );
    }

    #[test]
    fn test_zero_retry_threshold_is_disabled() {
        let mut guard = guard_with(EfficiencyThreshold {
            consecutive_retries: Some(0),
            ..EfficiencyThreshold::disabled()
        });
        let summary = summary_with(&[ExecutionSample::success(1.0)]);
        assert!(guard.evaluate("a", &summary, None).is_empty());
    }

    #[test]
    fn test_dedupe_is_per_scope() {
        let mut guard = guard_with(latency_only(10.0));
        let summary = summary_with(&[ExecutionSample::success(50.0)]);

        assert_eq!(guard.evaluate("a", &summary, Some(100)).len(), 1);
        assert_eq!(guard.evaluate("b", &summary, Some(100)).len(), 1);
    }

    #[test]
    fn test_malformed_scope_disables_rules() {
        let table = EfficiencyThreshold::parse_table(&json!({
            "default": {"latency_ms": 10.0},
            "auditor": {"latency_ms": "fast"},
        }));
        let mut guard = EfficiencyGuard::new(table, 10_000, 1_000);
        let summary = summary_with(&[ExecutionSample::success(50.0)]);

        assert!(guard.threshold_for("auditor").unwrap().is_disabled());
        assert!(guard.evaluate("auditor", &summary, Some(100)).is_empty());
        assert_eq!(guard.evaluate("classifier", &summary, Some(100)).len(), 1);
    }

    #[test]
    fn test_no_thresholds_no_decisions() {
        let mut guard = EfficiencyGuard::new(HashMap::new(), 10_000, 1_000);
        let summary = summary_with(&[ExecutionSample::failure(99_999.0).with_retries(10)]);
        assert!(guard.evaluate("a", &summary, None).is_empty());
    }

    #[test]
    fn test_decision_wire_shape() {
        let decision = AdjustmentDecision {
            adjustment: Adjustment::IncreaseBatchSize {
                multiplier: BATCH_SIZE_MULTIPLIER,
                current_throughput: 0,
            },
            reason: "low".into(),
            triggered_at: Utc::now(),
        };
        let value = serde_json::to_value(&decision).unwrap();

        assert_eq!(value["action"], "increase_batch_size");
        assert_eq!(value["parameters"]["multiplier"], 1.25);
        assert_eq!(value["parameters"]["current_throughput"], 0);
        assert_eq!(value["reason"], "low");
        assert!(value["triggered_at"].is_string());
    }
}
