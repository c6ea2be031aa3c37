//! Shared blackboard for observing pipeline progress.
//!
//! Agents never read from each other; the orchestrator publishes each
//! stage's output here so reporters can follow a run without coupling to
//! the agents. Three message kinds exist: `raw` (extraction data),
//! `summary` (mid-pipeline digests) and `insight` (final output).
//!
//! # Usage
//!
//! ```rust,ignore
//! use coordination::blackboard::{PublishMeta, SharedBlackboard};
//!
//! let board = SharedBlackboard::new().shared();
//! let mut sub = board.subscribe();
//!
//! tokio::spawn(async move {
//!     while let Some(envelope) = sub.recv().await {
//!         println!("{} {}", envelope.kind(), envelope.document_id());
//!     }
//! });
//!
//! board.publish_raw("extractor", payload, PublishMeta::new().tokens(120));
//! board.finalize();
//! ```

pub mod board;
pub mod types;

pub use board::{SharedBlackboard, SharedBlackboardRef, Subscription};
pub use types::{
    BlackboardSnapshot, BoardPayload, Envelope, FinalInsightPayload, MessageEnvelope, MessageKind,
    PublishMeta, RawDataPayload, SemanticSummaryPayload,
};
