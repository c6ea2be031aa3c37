//! Configured token limits and their JSON snapshot shape.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Limits for the three nested scopes. A limit of 0 (or an absent entry)
/// means unlimited.
///
/// Serializes as `{ "total", "perAgent", "perStep" }`; snake_case keys are
/// accepted on input so TOML config files can use either spelling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BudgetLimits {
    pub total: u64,
    #[serde(alias = "per_agent")]
    pub per_agent: BTreeMap<String, u64>,
    #[serde(alias = "per_step")]
    pub per_step: BTreeMap<String, BTreeMap<String, u64>>,
}

impl BudgetLimits {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_agent_limit(mut self, agent: impl Into<String>, limit: u64) -> Self {
        self.per_agent.insert(agent.into(), limit);
        self
    }

    pub fn with_step_limit(
        mut self,
        agent: impl Into<String>,
        step: impl Into<String>,
        limit: u64,
    ) -> Self {
        self.per_step
            .entry(agent.into())
            .or_default()
            .insert(step.into(), limit);
        self
    }

    /// Configured agent limit, `None` when unlimited.
    pub fn agent_limit(&self, agent: &str) -> Option<u64> {
        self.per_agent.get(agent).copied().filter(|l| *l > 0)
    }

    /// Configured step limit, `None` when unlimited.
    pub fn step_limit(&self, agent: &str, step: &str) -> Option<u64> {
        self.per_step
            .get(agent)
            .and_then(|steps| steps.get(step))
            .copied()
            .filter(|l| *l > 0)
    }

    /// Total limit, `None` when unlimited.
    pub fn total_limit(&self) -> Option<u64> {
        Some(self.total).filter(|t| *t > 0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.total == 0 && self.per_agent.is_empty() && self.per_step.is_empty()
    }

    /// Build limits from an externally supplied budget snapshot.
    ///
    /// Parsing is lenient: anything that is not an object yields `defaults`,
    /// non-numeric entries are skipped, and a snapshot with no positive total
    /// and no agent or step limits yields `defaults`. Otherwise a missing
    /// total, agent table or step table falls back to the matching section
    /// of `defaults`.
    pub fn from_context(value: Option<&Value>, defaults: &BudgetLimits) -> Self {
        let Some(Value::Object(payload)) = value else {
            return defaults.clone();
        };

        let total = payload.get("total").and_then(as_limit).unwrap_or(0);
        let per_agent = payload
            .get("perAgent")
            .or_else(|| payload.get("per_agent"))
            .map(limit_table)
            .unwrap_or_default();
        let per_step: BTreeMap<String, BTreeMap<String, u64>> = match payload
            .get("perStep")
            .or_else(|| payload.get("per_step"))
        {
            Some(Value::Object(agents)) => agents
                .iter()
                .filter(|(_, steps)| steps.is_object())
                .map(|(agent, steps)| (agent.clone(), limit_table(steps)))
                .collect(),
            _ => BTreeMap::new(),
        };

        if total == 0 && per_agent.is_empty() && per_step.is_empty() {
            return defaults.clone();
        }

        Self {
            total: if total == 0 { defaults.total } else { total },
            per_agent: if per_agent.is_empty() {
                defaults.per_agent.clone()
            } else {
                per_agent
            },
            per_step: if per_step.is_empty() {
                defaults.per_step.clone()
            } else {
                per_step
            },
        }
    }
}

fn as_limit(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn limit_table(value: &Value) -> BTreeMap<String, u64> {
    match value {
        Value::Object(entries) => entries
            .iter()
            .filter_map(|(key, limit)| as_limit(limit).map(|l| (key.clone(), l)))
            .collect(),
        _ => BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defaults() -> BudgetLimits {
        BudgetLimits::new(5_000)
            .with_agent_limit("auditor", 900)
            .with_step_limit("auditor", "analysis", 400)
    }

    #[test]
    fn test_snapshot_shape_is_camel_case() {
        let value = serde_json::to_value(defaults()).unwrap();
        assert_eq!(
            value,
            json!({
                "total": 5000,
                "perAgent": {"auditor": 900},
                "perStep": {"auditor": {"analysis": 400}},
            })
        );
    }

    #[test]
    fn test_snake_case_aliases_deserialize() {
        let limits: BudgetLimits =
            serde_json::from_value(json!({"total": 10, "per_agent": {"a": 3}})).unwrap();
        assert_eq!(limits.agent_limit("a"), Some(3));
        assert!(limits.per_step.is_empty());
    }

    #[test]
    fn test_from_context_missing_or_empty_uses_defaults() {
        assert_eq!(BudgetLimits::from_context(None, &defaults()), defaults());
        assert_eq!(
            BudgetLimits::from_context(Some(&json!("nope")), &defaults()),
            defaults()
        );
        assert_eq!(
            BudgetLimits::from_context(Some(&json!({"total": 0})), &defaults()),
            defaults()
        );
    }

    #[test]
    fn test_from_context_overrides_sections() {
        let payload = json!({
            "perAgent": {"extractor": 60, "bogus": "x"},
        });
        let limits = BudgetLimits::from_context(Some(&payload), &defaults());

        assert_eq!(limits.total, 5_000);
        assert_eq!(limits.agent_limit("extractor"), Some(60));
        assert_eq!(limits.agent_limit("auditor"), None);
        assert!(!limits.per_agent.contains_key("bogus"));
        assert_eq!(limits.step_limit("auditor", "analysis"), Some(400));
    }

    #[test]
    fn test_from_context_full_payload() {
        let payload = json!({
            "total": "100",
            "perAgent": {"extraction": 60},
            "perStep": {"extraction": {"ingest": 50}, "broken": 3},
        });
        let limits = BudgetLimits::from_context(Some(&payload), &BudgetLimits::unlimited());

        assert_eq!(limits.total_limit(), Some(100));
        assert_eq!(limits.step_limit("extraction", "ingest"), Some(50));
        assert!(!limits.per_step.contains_key("broken"));
    }

    #[test]
    fn test_zero_limits_are_unlimited() {
        let limits = BudgetLimits::new(0).with_agent_limit("a", 0);
        assert_eq!(limits.total_limit(), None);
        assert_eq!(limits.agent_limit("a"), None);
        assert_eq!(limits.step_limit("a", "s"), None);
    }
}
