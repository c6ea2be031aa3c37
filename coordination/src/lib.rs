//! Deterministic coordination primitives for the document-analysis pipeline.
//!
//! This library provides the shared, concurrency-safe pieces the agent
//! orchestrator is built from:
//! - [`cache`]: version-aware LRU pools for embeddings and summaries
//! - [`budget`]: nested token budgets (pipeline, agent, agent stage)
//! - [`prompt`]: ingestion preprocessing, prompt compression, context selection
//! - [`metrics`]: per-agent execution metrics and the efficiency guard
//! - [`blackboard`]: in-process publish/subscribe hub for progress reporting
//! - [`documents`]: the stage input/output model
//! - [`reconcile`]: repair of degenerate accounting totals
//!
//! Every shared structure is guarded by its own lock so several document
//! pipelines can use one instance concurrently.

#![allow(clippy::uninlined_format_args)]

pub mod blackboard;
pub mod budget;
pub mod cache;
pub mod documents;
pub mod metrics;
pub mod prompt;
pub mod reconcile;

/// Loosely-typed metadata attached to documents, cache entries and samples.
pub type Metadata = serde_json::Map<String, serde_json::Value>;
