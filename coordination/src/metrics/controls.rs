//! Caller-side application of guard decisions.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use super::{Adjustment, AdjustmentDecision};

/// Live runtime parameters of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentControls {
    pub timeout_ms: u64,
    pub recovery_mode: bool,
    pub batch_size_hint: u32,
    pub retries: u32,
}

impl AgentControls {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            recovery_mode: false,
            batch_size_hint: 1,
            retries: 0,
        }
    }

    /// Apply decisions in order.
    pub fn apply(&mut self, decisions: &[AdjustmentDecision]) {
        for decision in decisions {
            match decision.adjustment {
                Adjustment::UpdateTimeout { timeout_ms, .. } => {
                    if timeout_ms > 0 {
                        self.timeout_ms = timeout_ms;
                    }
                }
                Adjustment::EnableRecoveryMode { enabled, .. } => {
                    self.recovery_mode = enabled;
                }
                Adjustment::IncreaseBatchSize { multiplier, .. } => {
                    let scaled = (f64::from(self.batch_size_hint) * multiplier).round();
                    self.batch_size_hint = (scaled as u32).max(1);
                }
                Adjustment::EscalateRetries { retries } => {
                    self.retries = self.retries.max(retries);
                }
            }
        }
    }
}

/// Shared reference to a [`ControlBoard`].
pub type SharedControlBoard = Arc<ControlBoard>;

/// Per-agent [`AgentControls`] shared by every pipeline of a run.
#[derive(Debug)]
pub struct ControlBoard {
    default_timeout_ms: u64,
    controls: Mutex<HashMap<String, AgentControls>>,
}

impl ControlBoard {
    pub fn new(default_timeout_ms: u64) -> Self {
        Self {
            default_timeout_ms,
            controls: Mutex::new(HashMap::new()),
        }
    }

    pub fn shared(self) -> SharedControlBoard {
        Arc::new(self)
    }

    /// Current controls for `agent`, defaults if none were set yet.
    pub fn get(&self, agent: &str) -> AgentControls {
        self.lock()
            .get(agent)
            .copied()
            .unwrap_or_else(|| AgentControls::new(self.default_timeout_ms))
    }

    pub fn set(&self, agent: impl Into<String>, controls: AgentControls) {
        self.lock().insert(agent.into(), controls);
    }

    /// Apply decisions to `agent`'s controls and return the result.
    pub fn apply(&self, agent: &str, decisions: &[AdjustmentDecision]) -> AgentControls {
        let mut controls = self.lock();
        let entry = controls
            .entry(agent.to_string())
            .or_insert_with(|| AgentControls::new(self.default_timeout_ms));
        entry.apply(decisions);
        *entry
    }

    pub fn snapshot(&self) -> BTreeMap<String, AgentControls> {
        self.lock()
            .iter()
            .map(|(agent, controls)| (agent.clone(), *controls))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AgentControls>> {
        self.controls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn decision(adjustment: Adjustment) -> AdjustmentDecision {
        AdjustmentDecision {
            adjustment,
            reason: String::new(),
            triggered_at: Utc::now(),
        }
    }

    #[test]
    fn test_apply_rules() {
        let mut controls = AgentControls::new(1_000);
        controls.apply(&[
            decision(Adjustment::UpdateTimeout {
                timeout_ms: 2_000,
                observed_latency_ms: 1_500.0,
            }),
            decision(Adjustment::EnableRecoveryMode {
                enabled: true,
                error_rate: 0.5,
            }),
            decision(Adjustment::IncreaseBatchSize {
                multiplier: 1.25,
                current_throughput: 0,
            }),
            decision(Adjustment::EscalateRetries { retries: 4 }),
        ]);

        assert_eq!(controls.timeout_ms, 2_000);
        assert!(controls.recovery_mode);
        assert_eq!(controls.batch_size_hint, 1, "round(1.25) keeps the hint at 1");
        assert_eq!(controls.retries, 4);
    }

    #[test]
    fn test_batch_hint_grows_and_retries_never_drop() {
        let mut controls = AgentControls::new(1_000);
        controls.batch_size_hint = 4;
        controls.retries = 5;
        controls.apply(&[
            decision(Adjustment::IncreaseBatchSize {
                multiplier: 1.25,
                current_throughput: 0,
            }),
            decision(Adjustment::EscalateRetries { retries: 3 }),
            decision(Adjustment::UpdateTimeout {
                timeout_ms: 0,
                observed_latency_ms: 0.0,
            }),
        ]);

        assert_eq!(controls.batch_size_hint, 5);
        assert_eq!(controls.retries, 5);
        assert_eq!(controls.timeout_ms, 1_000);
    }

    #[test]
    fn test_board_defaults_and_apply() {
        let board = ControlBoard::new(120_000);
        assert_eq!(board.get("auditor").timeout_ms, 120_000);

        let updated = board.apply(
            "auditor",
            &[decision(Adjustment::UpdateTimeout {
                timeout_ms: 121_000,
                observed_latency_ms: 3_000.0,
            })],
        );
        assert_eq!(updated.timeout_ms, 121_000);
        assert_eq!(board.get("auditor").timeout_ms, 121_000);
        assert_eq!(board.snapshot().len(), 1);
    }
}
