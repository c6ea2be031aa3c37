//! Thread-safe metrics store with optional guard evaluation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{
    AdjustmentDecision, EfficiencyGuard, EfficiencyThreshold, ExecutionSample, MetricReport,
    MetricSummary,
};

/// Shared reference to a [`MetricsCollector`].
pub type SharedMetricsCollector = Arc<MetricsCollector>;

/// Export shape consumed by dashboards and reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsExport {
    pub generated_at: DateTime<Utc>,
    pub metrics: BTreeMap<String, MetricReport>,
    pub adjustments: BTreeMap<String, Vec<AdjustmentDecision>>,
}

#[derive(Debug)]
struct CollectorState {
    metrics: BTreeMap<String, MetricSummary>,
    adjustments: BTreeMap<String, Vec<AdjustmentDecision>>,
    guard: Option<EfficiencyGuard>,
}

/// Per-agent [`MetricSummary`] store.
///
/// Summaries, the last decisions per agent and the guard's dedupe state all
/// live under one lock, so concurrent pipelines see a consistent view.
#[derive(Debug)]
pub struct MetricsCollector {
    state: Mutex<CollectorState>,
}

impl MetricsCollector {
    /// `guard = None` records metrics without ever producing decisions.
    pub fn new(guard: Option<EfficiencyGuard>) -> Self {
        Self {
            state: Mutex::new(CollectorState {
                metrics: BTreeMap::new(),
                adjustments: BTreeMap::new(),
                guard,
            }),
        }
    }

    pub fn shared(self) -> SharedMetricsCollector {
        Arc::new(self)
    }

    pub fn guard_enabled(&self) -> bool {
        self.lock().guard.is_some()
    }

    /// Record one execution and return any decisions the guard emits.
    ///
    /// The agent's current timeout is read from `sample.metadata["timeout_ms"]`.
    pub fn record_execution(&self, agent: &str, sample: ExecutionSample) -> Vec<AdjustmentDecision> {
        let mut state = self.lock();
        let CollectorState {
            metrics,
            adjustments,
            guard,
        } = &mut *state;

        let summary = metrics
            .entry(agent.to_string())
            .or_insert_with(|| MetricSummary::new(agent));
        summary.record(&sample);

        let Some(guard) = guard.as_mut() else {
            return Vec::new();
        };
        let decisions = guard.evaluate(agent, summary, sample.timeout_ms());
        for decision in &decisions {
            info!(
                agent,
                action = %decision.action(),
                reason = %decision.reason,
                "Efficiency guard decision"
            );
        }
        if !decisions.is_empty() {
            adjustments.insert(agent.to_string(), decisions.clone());
        }
        decisions
    }

    pub fn snapshot(&self) -> BTreeMap<String, MetricReport> {
        self.lock()
            .metrics
            .iter()
            .map(|(agent, summary)| (agent.clone(), summary.to_report()))
            .collect()
    }

    /// The most recent non-empty decision list per agent.
    pub fn adjustments(&self) -> BTreeMap<String, Vec<AdjustmentDecision>> {
        self.lock().adjustments.clone()
    }

    pub fn export_payload(&self) -> MetricsExport {
        let state = self.lock();
        MetricsExport {
            generated_at: Utc::now(),
            metrics: state
                .metrics
                .iter()
                .map(|(agent, summary)| (agent.clone(), summary.to_report()))
                .collect(),
            adjustments: state.adjustments.clone(),
        }
    }

    /// Forget all metrics and decisions. Guard thresholds are kept.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.metrics.clear();
        state.adjustments.clear();
    }

    /// No-op when the guard is disabled.
    pub fn update_thresholds(&self, thresholds: HashMap<String, EfficiencyThreshold>) {
        if let Some(guard) = self.lock().guard.as_mut() {
            guard.update_thresholds(thresholds);
        }
    }

    /// No-op when the guard is disabled.
    pub fn update_timeouts(&self, max_timeout_ms: u64, timeout_step_ms: u64) {
        if let Some(guard) = self.lock().guard.as_mut() {
            guard.update_timeouts(max_timeout_ms, timeout_step_ms);
        }
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
