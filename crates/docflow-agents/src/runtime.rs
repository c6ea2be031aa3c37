//! Wires the shared components of one pipeline process from a
//! [`PipelineConfig`].

use std::sync::Arc;

use anyhow::{Context, Result};
use coordination::blackboard::{SharedBlackboard, SharedBlackboardRef};
use coordination::budget::{BudgetManager, SharedBudgetManager};
use coordination::cache::{ContextCache, SharedContextCache};
use coordination::metrics::{
    ControlBoard, EfficiencyGuard, MetricsCollector, SharedControlBoard, SharedMetricsCollector,
};
use tracing::info;

use crate::agents::AgentSet;
use crate::config::PipelineConfig;
use crate::hooks::GuardHook;
use crate::orchestrator::Orchestrator;
use crate::progress::{ProgressTracker, SharedProgressTracker};
use crate::query::{Embedder, QueryController, Responder};
use crate::telemetry::TelemetrySink;

/// Everything a pipeline process shares across document runs.
pub struct PipelineRuntime {
    pub cache: SharedContextCache,
    pub budget: SharedBudgetManager,
    pub metrics: SharedMetricsCollector,
    pub controls: SharedControlBoard,
    pub blackboard: SharedBlackboardRef,
    pub progress: SharedProgressTracker,
    pub orchestrator: Arc<Orchestrator>,
    compression_ratio: f64,
}

impl PipelineRuntime {
    pub fn from_config(config: &PipelineConfig, agents: AgentSet) -> Result<Self> {
        let cache = ContextCache::new(config.cache.embedding_capacity, config.cache.summary_capacity)
            .context("Failed to create context cache")?
            .shared();
        let budget = BudgetManager::new(config.budget.clone()).shared();

        let guard = config.guard.enabled.then(|| {
            EfficiencyGuard::new(
                config.guard.threshold_table(),
                config.guard.max_timeout_ms,
                config.guard.timeout_step_ms,
            )
        });
        let metrics = MetricsCollector::new(guard).shared();
        let controls = ControlBoard::new(config.default_timeout_ms).shared();
        let blackboard = SharedBlackboard::new().shared();
        let progress = ProgressTracker::new().shared();
        let guard_hook = Arc::new(GuardHook::new(Arc::clone(&metrics), Arc::clone(&controls)));

        let mut orchestrator = Orchestrator::new(agents, Arc::clone(&budget), Arc::clone(&blackboard))
            .with_workers(config.workers)
            .with_controls(Arc::clone(&controls))
            .with_before_hook(guard_hook.clone())
            .with_after_hook(guard_hook)
            .with_before_hook(progress.clone())
            .with_after_hook(progress.clone());
        if let Some(path) = &config.telemetry_path {
            orchestrator = orchestrator.with_telemetry(Arc::new(TelemetrySink::new(path)));
        }

        info!(
            workers = config.workers,
            guard = config.guard.enabled,
            budget_total = config.budget.total,
            "Pipeline runtime ready"
        );

        Ok(Self {
            cache,
            budget,
            metrics,
            controls,
            blackboard,
            progress,
            orchestrator: orchestrator.shared(),
            compression_ratio: config.optimizer.compression_ratio,
        })
    }

    /// A query controller sharing this runtime's cache.
    pub fn query_controller(
        &self,
        embedder: Arc<dyn Embedder>,
        responder: Arc<dyn Responder>,
    ) -> Result<QueryController> {
        QueryController::with_compression_ratio(
            Arc::clone(&self.cache),
            embedder,
            responder,
            self.compression_ratio,
        )
        .context("Failed to create query controller")
    }
}
