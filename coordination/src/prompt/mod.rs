//! Prompt and context optimization.
//!
//! - [`preprocess`]: normalization, content digests and incremental embedding reuse
//! - [`optimizer`]: summary compression, plan selection and response fingerprints
//! - [`select`]: similarity-ranked context selection under a token budget
//!
//! # Usage
//!
//! ```rust,ignore
//! use coordination::prompt::{DocumentPayload, IngestionPreprocessor, PromptOptimizer};
//!
//! let preprocessor = IngestionPreprocessor::new(cache.clone());
//! let batch = preprocessor.prepare_batch(&[DocumentPayload::new("nf-1", text)], false);
//!
//! let optimizer = PromptOptimizer::new(cache, 0.35)?;
//! let optimized = optimizer.optimize("summarize the invoices", &batch.documents, false);
//! println!("{} -> {}", optimized.plan.strategy, optimized.fingerprint);
//! ```

pub mod optimizer;
pub mod preprocess;
pub mod select;

pub use optimizer::{ChainPlan, OptimizedPrompt, PromptOptimizer, Strategy, DEFAULT_COMPRESSION_RATIO};
pub use preprocess::{
    DocumentPayload, IngestionPreprocessor, Normalizer, PreprocessedDocument, PreprocessingResult,
};
pub use select::{estimate_tokens, ContextSelector};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OptimizerError {
    #[error("compression ratio must be in (0, 1], got {0}")]
    InvalidRatio(f64),

    #[error("at least one normalization step is required")]
    NoNormalizers,

    #[error("missing digest for document {document_id}")]
    MissingDigest { document_id: String },
}
