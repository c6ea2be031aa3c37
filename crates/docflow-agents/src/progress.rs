//! Per-document progress projection, maintained from stage hooks.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agents::Stage;
use crate::hooks::{AfterHook, BeforeHook, HookContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// `document_id -> agent -> status`.
pub type ProgressSnapshot = BTreeMap<String, BTreeMap<String, StageStatus>>;

pub type SharedProgressTracker = Arc<ProgressTracker>;

/// Tracks which stage each document is in. Agents a document has not
/// reached yet are reported as pending.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    documents: Mutex<ProgressSnapshot>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedProgressTracker {
        Arc::new(self)
    }

    fn lock(&self) -> MutexGuard<'_, ProgressSnapshot> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, document_id: &str, agent: &str, status: StageStatus) {
        let mut documents = self.lock();
        let agents = documents
            .entry(document_id.to_string())
            .or_insert_with(|| {
                Stage::ALL
                    .iter()
                    .map(|stage| (stage.agent().to_string(), StageStatus::Pending))
                    .collect()
            });
        agents.insert(agent.to_string(), status);
    }

    pub fn status(&self, document_id: &str, agent: &str) -> Option<StageStatus> {
        self.lock().get(document_id)?.get(agent).copied()
    }

    /// Whether every stage of the document completed.
    pub fn is_complete(&self, document_id: &str) -> bool {
        self.lock().get(document_id).is_some_and(|agents| {
            agents
                .values()
                .all(|status| *status == StageStatus::Completed)
        })
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.lock().clone()
    }
}

#[async_trait]
impl BeforeHook for ProgressTracker {
    async fn before(&self, agent: &str, ctx: &HookContext) {
        self.set(&ctx.document_id, agent, StageStatus::Running);
    }
}

#[async_trait]
impl AfterHook for ProgressTracker {
    async fn after(&self, agent: &str, ctx: &HookContext) {
        let status = if ctx.success.unwrap_or(true) {
            StageStatus::Completed
        } else {
            StageStatus::Failed
        };
        self.set(&ctx.document_id, agent, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tracks_stage_lifecycle() {
        let tracker = ProgressTracker::new();
        let ctx = HookContext::new(Stage::Extraction, "nf-1", "run-1", 1_000);

        tracker.before("extractor", &ctx).await;
        assert_eq!(tracker.status("nf-1", "extractor"), Some(StageStatus::Running));
        assert_eq!(tracker.status("nf-1", "auditor"), Some(StageStatus::Pending));

        tracker.after("extractor", &ctx.completed(3.0, true)).await;
        assert_eq!(tracker.status("nf-1", "extractor"), Some(StageStatus::Completed));
        assert!(!tracker.is_complete("nf-1"));
        assert_eq!(tracker.status("nf-2", "extractor"), None);
    }

    #[tokio::test]
    async fn test_failed_stage() {
        let tracker = ProgressTracker::new();
        let ctx = HookContext::new(Stage::Accounting, "nf-1", "run-1", 1_000);
        tracker.after("accountant", &ctx.completed(1.0, false)).await;

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot["nf-1"]["accountant"], StageStatus::Failed);
        assert_eq!(snapshot["nf-1"].len(), Stage::ALL.len());
    }
}
