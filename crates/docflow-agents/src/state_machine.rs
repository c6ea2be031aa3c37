//! Pipeline state machine: explicit stage states and legal transition guards.
//!
//! Every document run owns one [`StageMachine`]. The orchestrator calls
//! `advance()` before each stage; the machine rejects out-of-order stages
//! and records every transition so a run can be replayed from telemetry.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::agents::Stage;

/// The states of one document run.
///
/// Every run starts at `Pending` and terminates at either `Completed` or
/// `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Accepted, no stage started yet.
    Pending,
    Extraction,
    Audit,
    Classification,
    Accounting,
    /// Recomputing degenerate accounting totals.
    Reconciling,
    CrossValidation,
    Insight,
    /// All stages finished. Terminal.
    Completed,
    /// A stage failed or the budget ran out. Terminal.
    Failed,
}

impl PipelineState {
    /// Whether this is a terminal state (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl From<Stage> for PipelineState {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Extraction => Self::Extraction,
            Stage::Audit => Self::Audit,
            Stage::Classification => Self::Classification,
            Stage::Accounting => Self::Accounting,
            Stage::CrossValidation => Self::CrossValidation,
            Stage::Insight => Self::Insight,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Extraction => write!(f, "Extraction"),
            Self::Audit => write!(f, "Audit"),
            Self::Classification => write!(f, "Classification"),
            Self::Accounting => write!(f, "Accounting"),
            Self::Reconciling => write!(f, "Reconciling"),
            Self::CrossValidation => write!(f, "CrossValidation"),
            Self::Insight => write!(f, "Insight"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Legal transitions between pipeline states.
///
/// ```text
/// Pending → Extraction
/// Extraction → Audit
/// Audit → Classification
/// Classification → Accounting
/// Accounting → Reconciling | CrossValidation
/// Reconciling → CrossValidation
/// CrossValidation → Insight
/// Insight → Completed
/// any non-terminal → Failed
/// ```
fn is_legal_transition(from: PipelineState, to: PipelineState) -> bool {
    use PipelineState::*;

    if to == Failed && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Pending, Extraction)
            | (Extraction, Audit)
            | (Audit, Classification)
            | (Classification, Accounting)
            | (Accounting, Reconciling)
            | (Accounting, CrossValidation)
            | (Reconciling, CrossValidation)
            | (CrossValidation, Insight)
            | (Insight, Completed)
    )
}

/// A single recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: PipelineState,
    pub to: PipelineState,
    /// Milliseconds since the state machine was created.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone, PartialEq)]
pub struct IllegalTransition {
    pub from: PipelineState,
    pub to: PipelineState,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal state transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// Tracks the current state of one document run and its transition log.
#[derive(Debug)]
pub struct StageMachine {
    current: PipelineState,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl StageMachine {
    pub fn new() -> Self {
        Self {
            current: PipelineState::Pending,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> PipelineState {
        self.current
    }

    /// Attempt to advance to the next state.
    pub fn advance(
        &mut self,
        to: PipelineState,
        reason: Option<&str>,
    ) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        tracing::debug!(from = %self.current, to = %to, "State transition");

        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(())
    }

    /// Transition to `Failed` from any non-terminal state.
    pub fn fail(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(PipelineState::Failed, Some(reason))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// Whether the run passed through `Reconciling`.
    pub fn reconciled(&self) -> bool {
        self.transitions
            .iter()
            .any(|t| t.to == PipelineState::Reconciling)
    }

    pub fn summary(&self) -> String {
        let states: Vec<String> = self.transitions.iter().map(|t| t.to.to_string()).collect();
        let mut summary = format!(
            "{} → {} ({}ms, {} transitions)",
            PipelineState::Pending,
            self.current,
            self.created_at.elapsed().as_millis(),
            self.transitions.len(),
        );
        if !states.is_empty() {
            summary.push_str(&format!(" [{}]", states.join(" → ")));
        }
        summary
    }
}

impl Default for StageMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_through(sm: &mut StageMachine, stages: &[Stage]) {
        for stage in stages {
            sm.advance((*stage).into(), None).unwrap();
        }
    }

    #[test]
    fn test_initial_state() {
        let sm = StageMachine::new();
        assert_eq!(sm.current(), PipelineState::Pending);
        assert!(!sm.is_terminal());
        assert!(sm.transitions().is_empty());
    }

    #[test]
    fn test_happy_path_without_reconcile() {
        let mut sm = StageMachine::new();
        run_through(&mut sm, &Stage::ALL);
        sm.advance(PipelineState::Completed, None).unwrap();

        assert!(sm.is_terminal());
        assert!(!sm.reconciled());
        assert_eq!(sm.transitions().len(), 7);
    }

    #[test]
    fn test_reconcile_detour() {
        let mut sm = StageMachine::new();
        run_through(
            &mut sm,
            &[
                Stage::Extraction,
                Stage::Audit,
                Stage::Classification,
                Stage::Accounting,
            ],
        );
        sm.advance(PipelineState::Reconciling, Some("zero grand total"))
            .unwrap();
        run_through(&mut sm, &[Stage::CrossValidation, Stage::Insight]);
        sm.advance(PipelineState::Completed, None).unwrap();

        assert!(sm.reconciled());
        assert_eq!(sm.transitions()[4].reason.as_deref(), Some("zero grand total"));
    }

    #[test]
    fn test_failure_from_any_non_terminal_state() {
        for state in [
            PipelineState::Pending,
            PipelineState::Extraction,
            PipelineState::Audit,
            PipelineState::Classification,
            PipelineState::Accounting,
            PipelineState::Reconciling,
            PipelineState::CrossValidation,
            PipelineState::Insight,
        ] {
            let mut sm = StageMachine {
                current: state,
                created_at: Instant::now(),
                transitions: Vec::new(),
            };
            assert!(sm.fail("boom").is_ok());
            assert_eq!(sm.current(), PipelineState::Failed);
        }
    }

    #[test]
    fn test_cannot_leave_terminal_state() {
        let mut sm = StageMachine::new();
        sm.fail("budget").unwrap();
        assert!(sm.fail("again").is_err());
        let err = sm.advance(PipelineState::Extraction, None).unwrap_err();
        assert_eq!(err.from, PipelineState::Failed);
    }

    #[test]
    fn test_illegal_skip() {
        let mut sm = StageMachine::new();
        sm.advance(PipelineState::Extraction, None).unwrap();
        let err = sm.advance(PipelineState::Accounting, None).unwrap_err();
        assert_eq!(err.to, PipelineState::Accounting);
        assert!(err.to_string().contains("Extraction → Accounting"));
    }

    #[test]
    fn test_transition_record_serde() {
        let record = TransitionRecord {
            from: PipelineState::Accounting,
            to: PipelineState::Reconciling,
            elapsed_ms: 12,
            reason: None,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["to"], "reconciling");
        assert!(value.get("reason").is_none());
    }

    #[test]
    fn test_summary() {
        let mut sm = StageMachine::new();
        sm.advance(PipelineState::Extraction, None).unwrap();
        sm.fail("test").unwrap();
        let summary = sm.summary();
        assert!(summary.contains("Failed"));
        assert!(summary.contains("2 transitions"));
    }
}
