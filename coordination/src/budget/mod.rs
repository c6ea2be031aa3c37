//! Token budget accounting across three nested scopes.
//!
//! A pipeline run draws from a finite token quota tracked as a process-wide
//! total, per agent, and per agent stage. Reservations are all-or-nothing:
//! the total limit is checked first, then the agent limit, then the step
//! limit, and consumption is committed only when all three pass.
//!
//! # Usage
//!
//! ```rust,ignore
//! use coordination::budget::{BudgetLimits, BudgetManager, SizeHint};
//!
//! let limits = BudgetLimits::new(100).with_agent_limit("extractor", 60);
//! let manager = BudgetManager::new(limits);
//!
//! let usage = manager.estimate_usage(&[SizeHint::from_bytes(4096)]);
//! if manager.validate_preflight(&usage).is_empty() {
//!     let tokens = manager.consume_for_stage("extractor", "ingest", &SizeHint::from_bytes(4096), None)?;
//! }
//! ```

pub mod estimate;
pub mod limits;
pub mod manager;

pub use estimate::{SizeHint, StageWeights, UsageReport, DEFAULT_TOKEN_ESTIMATE, MIN_STAGE_WEIGHT};
pub use limits::BudgetLimits;
pub use manager::{BudgetManager, SharedBudgetManager};

use serde::{Deserialize, Serialize};

/// Which of the nested counters a limit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    /// Whole pipeline run.
    Total,
    /// One agent across all of its stages.
    Agent,
    /// One agent stage.
    Step,
}

impl std::fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Total => write!(f, "total"),
            Self::Agent => write!(f, "agent"),
            Self::Step => write!(f, "step"),
        }
    }
}

/// Render the identifier a scope limit is keyed by.
pub fn scope_identifier(scope: BudgetScope, agent: &str, step: &str) -> String {
    match scope {
        BudgetScope::Total => "pipeline".to_string(),
        BudgetScope::Agent => agent.to_string(),
        BudgetScope::Step => format!("{agent}:{step}"),
    }
}

/// A reservation that would push one of the scopes past its limit.
///
/// `requested` is the counter value the reservation would have produced
/// (already consumed plus the new tokens), not just the new tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("token budget exceeded for {agent}/{step} ({scope} scope): requested {requested}, limit {limit}")]
pub struct BudgetExceeded {
    pub scope: BudgetScope,
    pub agent: String,
    pub step: String,
    pub limit: u64,
    pub requested: u64,
}

impl BudgetExceeded {
    pub fn identifier(&self) -> String {
        scope_identifier(self.scope, &self.agent, &self.step)
    }
}

/// A preflight check failure for a whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetViolation {
    pub scope: BudgetScope,
    pub identifier: String,
    pub limit: u64,
    pub requested: u64,
}

impl std::fmt::Display for BudgetViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} budget for {} exceeded: requested {}, limit {}",
            self.scope, self.identifier, self.requested, self.limit
        )
    }
}
