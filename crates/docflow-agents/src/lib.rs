//! Document pipeline runtime.
//!
//! Runs fiscal documents through six stage agents
//! (extraction, audit, classification, accounting, cross validation, insight)
//! on top of the `coordination` primitives: token budgets, the shared
//! blackboard, the efficiency guard and the content cache.
//!
//! - [`agents`]: the stage-agent trait and the reference agents
//! - [`orchestrator`]: per-document runs and concurrent batches
//! - [`hooks`] / [`progress`]: stage observers, including the guard loop
//! - [`state_machine`]: legal stage ordering with a transition log
//! - [`query`]: cache-aware query answering over documents
//! - [`config`], [`runtime`], [`telemetry`]: process wiring and run records

pub mod agents;
pub mod config;
pub mod hooks;
pub mod orchestrator;
pub mod progress;
pub mod query;
pub mod runtime;
pub mod state_machine;
pub mod telemetry;

pub use agents::{AgentSet, Stage, StageAgent, StageContext};
pub use config::PipelineConfig;
pub use orchestrator::{BatchOutcome, Orchestrator, PipelineError, PipelineRunResult};
pub use runtime::PipelineRuntime;
