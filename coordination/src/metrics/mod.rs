//! Runtime metrics and the adaptive efficiency guard.
//!
//! Every stage execution is recorded into a [`MetricsCollector`], which keeps
//! a rolling [`MetricSummary`] per agent and, when an [`EfficiencyGuard`] is
//! attached, evaluates four threshold rules:
//!
//! | rule | trigger | decision |
//! |------|---------|----------|
//! | latency | `average_latency_ms > latency_ms` | `update_timeout` |
//! | errors | `error_rate > error_rate` | `enable_recovery_mode` |
//! | throughput | `throughput < throughput_min` | `increase_batch_size` |
//! | retries | `retries >= consecutive_retries` | `escalate_retries` |
//!
//! # Usage
//!
//! ```rust,ignore
//! use coordination::metrics::{ControlBoard, EfficiencyGuard, ExecutionSample, MetricsCollector};
//!
//! let collector = MetricsCollector::new(Some(EfficiencyGuard::with_defaults(180_000, 1_000)));
//! let board = ControlBoard::new(120_000);
//!
//! let timeout = board.get("auditor").timeout_ms;
//! let decisions = collector.record_execution(
//!     "auditor",
//!     ExecutionSample::success(3_100.0).with_metadata("timeout_ms", timeout),
//! );
//! board.apply("auditor", &decisions);
//! ```

pub mod collector;
pub mod controls;
pub mod guard;
pub mod summary;

pub use collector::{MetricsCollector, MetricsExport, SharedMetricsCollector};
pub use controls::{AgentControls, ControlBoard, SharedControlBoard};
pub use guard::{
    Adjustment, AdjustmentAction, AdjustmentDecision, EfficiencyGuard, EfficiencyThreshold,
    BATCH_SIZE_MULTIPLIER, DEFAULT_SCOPE,
};
pub use summary::{ExecutionSample, MetricReport, MetricSummary};
