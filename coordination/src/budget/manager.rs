//! Shared budget manager with atomic reservations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::{debug, warn};

use super::{
    scope_identifier, BudgetExceeded, BudgetLimits, BudgetScope, BudgetViolation, SizeHint,
    StageWeights, UsageReport,
};

/// Shared reference to a [`BudgetManager`].
pub type SharedBudgetManager = Arc<BudgetManager>;

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    per_agent: HashMap<String, u64>,
    per_step: HashMap<(String, String), u64>,
}

impl Counters {
    fn agent(&self, agent: &str) -> u64 {
        self.per_agent.get(agent).copied().unwrap_or(0)
    }

    fn step(&self, agent: &str, step: &str) -> u64 {
        self.per_step
            .get(&(agent.to_string(), step.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

/// Tracks token consumption against [`BudgetLimits`].
///
/// One manager is shared by every document pipeline of a run; all counters
/// sit behind a single mutex so a reservation is checked and committed
/// atomically.
#[derive(Debug)]
pub struct BudgetManager {
    limits: BudgetLimits,
    weights: StageWeights,
    counters: Mutex<Counters>,
}

impl BudgetManager {
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            weights: StageWeights::default(),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Build a manager from an externally supplied budget snapshot, see
    /// [`BudgetLimits::from_context`].
    pub fn from_context(value: Option<&Value>, defaults: &BudgetLimits) -> Self {
        Self::new(BudgetLimits::from_context(value, defaults))
    }

    /// Replace the stage weight table.
    pub fn with_weights(mut self, weights: StageWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn shared(self) -> SharedBudgetManager {
        Arc::new(self)
    }

    pub fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    pub fn weights(&self) -> &StageWeights {
        &self.weights
    }

    /// Estimate what a batch will consume if every weighted stage runs once
    /// per document.
    pub fn estimate_usage(&self, documents: &[SizeHint]) -> UsageReport {
        let mut usage = UsageReport::default();
        for hint in documents {
            for (agent, step, weight) in self.weights.iter() {
                usage.add(agent, step, hint.estimate(weight));
            }
        }
        usage
    }

    /// Compare a batch estimate, on top of what is already consumed, against
    /// the configured limits.
    ///
    /// Violations are reported in scope order: total, then agents, then
    /// steps. `requested` is the counter value the batch would reach.
    pub fn validate_preflight(&self, usage: &UsageReport) -> Vec<BudgetViolation> {
        let counters = self.lock();
        let mut violations = Vec::new();

        if let Some(limit) = self.limits.total_limit() {
            let requested = counters.total.saturating_add(usage.total);
            if requested > limit {
                violations.push(BudgetViolation {
                    scope: BudgetScope::Total,
                    identifier: scope_identifier(BudgetScope::Total, "", ""),
                    limit,
                    requested,
                });
            }
        }

        for (agent, estimated) in &usage.per_agent {
            if let Some(limit) = self.limits.agent_limit(agent) {
                let requested = counters.agent(agent).saturating_add(*estimated);
                if requested > limit {
                    violations.push(BudgetViolation {
                        scope: BudgetScope::Agent,
                        identifier: scope_identifier(BudgetScope::Agent, agent, ""),
                        limit,
                        requested,
                    });
                }
            }
        }

        for (agent, steps) in &usage.per_step {
            for (step, estimated) in steps {
                if let Some(limit) = self.limits.step_limit(agent, step) {
                    let requested = counters.step(agent, step).saturating_add(*estimated);
                    if requested > limit {
                        violations.push(BudgetViolation {
                            scope: BudgetScope::Step,
                            identifier: scope_identifier(BudgetScope::Step, agent, step),
                            limit,
                            requested,
                        });
                    }
                }
            }
        }

        violations
    }

    /// Estimate and reserve tokens for one stage of one document.
    ///
    /// `weight` overrides the table weight for `(agent, step)`. Returns the
    /// number of tokens reserved.
    pub fn consume_for_stage(
        &self,
        agent: &str,
        step: &str,
        hint: &SizeHint,
        weight: Option<f64>,
    ) -> Result<u64, BudgetExceeded> {
        let weight = weight.unwrap_or_else(|| self.weights.get(agent, step));
        let tokens = hint.estimate(weight);
        self.consume(agent, step, tokens)?;
        Ok(tokens)
    }

    /// Reserve `tokens` against all three scopes or none. Zero is a no-op.
    pub fn consume(&self, agent: &str, step: &str, tokens: u64) -> Result<(), BudgetExceeded> {
        if tokens == 0 {
            return Ok(());
        }

        let mut counters = self.lock();
        let exceeded = |scope: BudgetScope, limit: u64, requested: u64| BudgetExceeded {
            scope,
            agent: agent.to_string(),
            step: step.to_string(),
            limit,
            requested,
        };

        let checks = [
            (BudgetScope::Total, self.limits.total_limit(), counters.total),
            (
                BudgetScope::Agent,
                self.limits.agent_limit(agent),
                counters.agent(agent),
            ),
            (
                BudgetScope::Step,
                self.limits.step_limit(agent, step),
                counters.step(agent, step),
            ),
        ];
        for (scope, limit, consumed) in checks {
            let Some(limit) = limit else { continue };
            let requested = consumed.saturating_add(tokens);
            if requested > limit {
                let err = exceeded(scope, limit, requested);
                warn!(
                    agent,
                    step,
                    scope = %scope,
                    limit,
                    requested,
                    "Token budget reservation rejected"
                );
                return Err(err);
            }
        }

        counters.total += tokens;
        *counters.per_agent.entry(agent.to_string()).or_default() += tokens;
        *counters
            .per_step
            .entry((agent.to_string(), step.to_string()))
            .or_default() += tokens;
        debug!(agent, step, tokens, total = counters.total, "Token budget consumed");
        Ok(())
    }

    /// Tokens left in the pipeline total, `None` when unlimited.
    pub fn remaining_total(&self) -> Option<u64> {
        let limit = self.limits.total_limit()?;
        Some(limit.saturating_sub(self.lock().total))
    }

    /// Tokens left for `agent`, `None` when unlimited.
    pub fn remaining_for_agent(&self, agent: &str) -> Option<u64> {
        let limit = self.limits.agent_limit(agent)?;
        Some(limit.saturating_sub(self.lock().agent(agent)))
    }

    /// Tokens left for `agent`'s `step`; falls back to the agent's remainder
    /// when the step itself has no limit.
    pub fn remaining_for_step(&self, agent: &str, step: &str) -> Option<u64> {
        match self.limits.step_limit(agent, step) {
            Some(limit) => Some(limit.saturating_sub(self.lock().step(agent, step))),
            None => self.remaining_for_agent(agent),
        }
    }

    /// Counters consumed so far.
    pub fn consumed(&self) -> UsageReport {
        let counters = self.lock();
        let mut report = UsageReport {
            total: counters.total,
            per_agent: counters
                .per_agent
                .iter()
                .map(|(agent, tokens)| (agent.clone(), *tokens))
                .collect(),
            ..UsageReport::default()
        };
        for ((agent, step), tokens) in &counters.per_step {
            report
                .per_step
                .entry(agent.clone())
                .or_default()
                .insert(step.clone(), *tokens);
        }
        report
    }

    /// Configured limits in their serialized snapshot shape.
    pub fn snapshot(&self) -> BudgetLimits {
        self.limits.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    #[test]
    fn test_preflight_reports_agent_but_not_total() {
        let manager = BudgetManager::new(BudgetLimits::new(100).with_agent_limit("extraction", 60));
        let mut usage = UsageReport::default();
        usage.add("extraction", "ingest", 80);

        let violations = manager.validate_preflight(&usage);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].scope, BudgetScope::Agent);
        assert_eq!(violations[0].identifier, "extraction");
        assert_eq!(violations[0].limit, 60);
        assert_eq!(violations[0].requested, 80);
    }

    #[test]
    fn test_preflight_counts_consumed_tokens() {
        let manager = BudgetManager::new(BudgetLimits::new(100));
        let mut usage = UsageReport::default();
        usage.add("auditor", "analysis", 40);
        assert!(manager.validate_preflight(&usage).is_empty());

        manager.consume("extractor", "ingest", 70).unwrap();
        let violations = manager.validate_preflight(&usage);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].scope, BudgetScope::Total);
        assert_eq!(violations[0].requested, 110);
    }

    #[test]
    fn test_consume_for_stage_over_agent_limit() {
        let manager = BudgetManager::new(BudgetLimits::new(100).with_agent_limit("extraction", 60));

        let err = manager
            .consume_for_stage("extraction", "ingest", &SizeHint::from_tokens(80), None)
            .unwrap_err();
        assert_eq!(err.scope, BudgetScope::Agent);
        assert_eq!(err.limit, 60);
        assert_eq!(err.requested, 80);
        assert_eq!(err.identifier(), "extraction");
        assert_eq!(manager.consumed(), UsageReport::default());
    }

    #[test]
    fn test_rejection_consumes_nothing() {
        let manager = BudgetManager::new(
            BudgetLimits::new(1_000)
                .with_agent_limit("auditor", 500)
                .with_step_limit("auditor", "analysis", 50),
        );
        manager.consume("auditor", "analysis", 40).unwrap();
        let before = manager.consumed();

        let err = manager.consume("auditor", "analysis", 20).unwrap_err();
        assert_eq!(err.scope, BudgetScope::Step);
        assert_eq!(err.requested, 60);
        assert_eq!(err.identifier(), "auditor:analysis");
        assert_eq!(manager.consumed(), before);
    }

    #[test]
    fn test_total_checked_before_agent() {
        let manager = BudgetManager::new(BudgetLimits::new(10).with_agent_limit("a", 5));
        let err = manager.consume("a", "s", 20).unwrap_err();
        assert_eq!(err.scope, BudgetScope::Total);
        assert_eq!(err.identifier(), "pipeline");
    }

    #[test]
    fn test_zero_tokens_is_noop() {
        let manager = BudgetManager::new(BudgetLimits::new(1));
        manager.consume("a", "s", 0).unwrap();
        assert_eq!(manager.consumed().total, 0);
    }

    #[test]
    fn test_remaining_counters() {
        let manager = BudgetManager::new(
            BudgetLimits::new(100)
                .with_agent_limit("a", 40)
                .with_step_limit("a", "x", 10),
        );
        manager.consume("a", "x", 8).unwrap();
        manager.consume("a", "y", 12).unwrap();

        assert_eq!(manager.remaining_total(), Some(80));
        assert_eq!(manager.remaining_for_agent("a"), Some(20));
        assert_eq!(manager.remaining_for_step("a", "x"), Some(2));
        assert_eq!(manager.remaining_for_step("a", "y"), Some(20));
        assert_eq!(manager.remaining_for_agent("b"), None);

        let unlimited = BudgetManager::new(BudgetLimits::unlimited());
        assert_eq!(unlimited.remaining_total(), None);
    }

    #[test]
    fn test_estimate_usage_covers_weight_table() {
        let manager = BudgetManager::new(BudgetLimits::unlimited());
        let usage = manager.estimate_usage(&[SizeHint::from_tokens(100), SizeHint::from_tokens(100)]);

        assert_eq!(usage.step("extractor", "ingest"), 200);
        assert_eq!(usage.step("cross_validator", "consistency"), 70);
        assert_eq!(usage.total, 2 * (100 + 70 + 50 + 40 + 35 + 90));
    }

    #[test]
    fn test_preflight_step_identifier() {
        let manager = BudgetManager::new(BudgetLimits::new(0).with_step_limit("auditor", "analysis", 10));
        let usage = manager.estimate_usage(&[SizeHint::from_tokens(100)]);
        let violations = manager.validate_preflight(&usage);

        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].identifier, "auditor:analysis");
        assert_eq!(violations[0].requested, 70);
    }

    #[test]
    fn test_weight_override() {
        let manager = BudgetManager::new(BudgetLimits::unlimited());
        let tokens = manager
            .consume_for_stage("auditor", "analysis", &SizeHint::from_tokens(100), Some(2.0))
            .unwrap();
        assert_eq!(tokens, 200);
    }

    #[test]
    fn test_from_context_snapshot() {
        let manager = BudgetManager::from_context(
            Some(&json!({"total": 100, "perAgent": {"extraction": 60}})),
            &BudgetLimits::unlimited(),
        );
        assert_eq!(
            serde_json::to_value(manager.snapshot()).unwrap(),
            json!({"total": 100, "perAgent": {"extraction": 60}, "perStep": {}})
        );
    }

    #[test]
    fn test_concurrent_consumption_never_exceeds_limit() {
        let manager = BudgetManager::new(BudgetLimits::new(1_000)).shared();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    let agent = format!("agent-{i}");
                    let mut accepted = 0u64;
                    for _ in 0..100 {
                        if manager.consume(&agent, "step", 3).is_ok() {
                            accepted += 3;
                        }
                    }
                    accepted
                })
            })
            .collect();
        let accepted: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert!(accepted <= 1_000);
        assert_eq!(manager.consumed().total, accepted);
        assert_eq!(manager.remaining_total(), Some(1_000 - accepted));
    }
}
