//! Before/after stage hooks.
//!
//! Hooks observe every stage call without the orchestrator knowing who is
//! listening. All hooks registered for a point are awaited concurrently.
//!
//! [`GuardHook`] closes the efficiency loop: it records each execution into
//! the [`MetricsCollector`](coordination::metrics::MetricsCollector) and
//! applies the returned decisions to the shared [`ControlBoard`], so the
//! agent's *next* call runs with the adjusted timeout, recovery flag and
//! batch hint.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use coordination::metrics::{ExecutionSample, SharedControlBoard, SharedMetricsCollector};
use serde::Serialize;
use tracing::debug;

use crate::agents::Stage;

/// What a hook is told about a stage call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookContext {
    pub stage: Stage,
    pub document_id: String,
    pub run_id: String,
    /// Agent timeout in effect for this call.
    pub timeout_ms: u64,
    /// Tokens reserved for the call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    /// Set for after-hooks only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    /// Set for after-hooks only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

impl HookContext {
    pub fn new(
        stage: Stage,
        document_id: impl Into<String>,
        run_id: impl Into<String>,
        timeout_ms: u64,
    ) -> Self {
        Self {
            stage,
            document_id: document_id.into(),
            run_id: run_id.into(),
            timeout_ms,
            tokens: None,
            latency_ms: None,
            success: None,
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// The after-hook view of this context.
    pub fn completed(&self, latency_ms: f64, success: bool) -> Self {
        Self {
            latency_ms: Some(latency_ms),
            success: Some(success),
            ..self.clone()
        }
    }
}

#[async_trait]
pub trait BeforeHook: Send + Sync {
    async fn before(&self, agent: &str, ctx: &HookContext);
}

#[async_trait]
pub trait AfterHook: Send + Sync {
    async fn after(&self, agent: &str, ctx: &HookContext);
}

/// Feeds executions into the metrics collector and applies its decisions.
pub struct GuardHook {
    collector: SharedMetricsCollector,
    controls: SharedControlBoard,
    started: Mutex<HashMap<(String, String), Instant>>,
}

impl GuardHook {
    pub fn new(collector: SharedMetricsCollector, controls: SharedControlBoard) -> Self {
        Self {
            collector,
            controls,
            started: Mutex::new(HashMap::new()),
        }
    }

    fn key(agent: &str, ctx: &HookContext) -> (String, String) {
        (ctx.run_id.clone(), agent.to_string())
    }
}

#[async_trait]
impl BeforeHook for GuardHook {
    async fn before(&self, agent: &str, ctx: &HookContext) {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Self::key(agent, ctx), Instant::now());
    }
}

#[async_trait]
impl AfterHook for GuardHook {
    async fn after(&self, agent: &str, ctx: &HookContext) {
        let started = self
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&Self::key(agent, ctx));
        let duration_ms = ctx
            .latency_ms
            .or_else(|| started.map(|t| t.elapsed().as_secs_f64() * 1000.0))
            .unwrap_or(0.0);

        let sample = if ctx.success.unwrap_or(true) {
            ExecutionSample::success(duration_ms)
        } else {
            ExecutionSample::failure(duration_ms)
        };
        let mut sample = sample
            .with_metadata("timeout_ms", ctx.timeout_ms)
            .with_metadata("stage", ctx.stage.as_str())
            .with_metadata("document_id", ctx.document_id.as_str());
        if let Some(tokens) = ctx.tokens {
            sample = sample.with_metadata("tokens", tokens);
        }

        let decisions = self.collector.record_execution(agent, sample);
        if !decisions.is_empty() {
            let controls = self.controls.apply(agent, &decisions);
            debug!(
                agent,
                timeout_ms = controls.timeout_ms,
                recovery_mode = controls.recovery_mode,
                batch_size_hint = controls.batch_size_hint,
                "Agent controls adjusted"
            );
        }
    }
}
