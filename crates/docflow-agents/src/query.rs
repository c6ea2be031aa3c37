//! Cache-aware query controller.
//!
//! Answers a free-form query over a set of documents while reusing as much
//! earlier work as possible:
//!
//! 1. preprocess the documents, reusing embeddings whose digest is unchanged
//! 2. embed only the pending documents and persist them versioned by digest
//! 3. build the optimized prompt (summaries and plan come from the cache when valid)
//! 4. serve the response from the cache when the prompt fingerprint matches,
//!    otherwise call the responder and store its answer
//!
//! `force_refresh` bypasses every cache lookup but still writes fresh
//! results back.
//!
//! # Usage
//!
//! ```rust,ignore
//! let controller = QueryController::new(cache, Arc::new(LocalEmbedder::default()), Arc::new(EchoResponder))?;
//! let result = controller.run("summarize the invoices", &documents, false).await?;
//! assert!(!result.fingerprint.is_empty());
//! ```

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use coordination::cache::{Embedding, SharedContextCache};
use coordination::prompt::{
    ChainPlan, ContextSelector, DocumentPayload, IngestionPreprocessor, OptimizerError,
    PreprocessedDocument, PromptOptimizer, DEFAULT_COMPRESSION_RATIO,
};
use coordination::Metadata;
use serde::Serialize;
use tracing::{debug, info};

/// Computes embeddings for documents whose cached embedding is stale.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(
        &self,
        documents: Vec<PreprocessedDocument>,
    ) -> anyhow::Result<BTreeMap<String, Embedding>>;
}

/// Produces the final answer for an optimized prompt.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, prompt: String, plan: ChainPlan) -> anyhow::Result<String>;
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("embedding failed: {0:#}")]
    Embedding(anyhow::Error),

    #[error("embedder returned no vector for document {document_id}")]
    MissingEmbedding { document_id: String },

    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    #[error("responder failed: {0:#}")]
    Response(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub response: String,
    pub from_cache: bool,
    pub plan: ChainPlan,
    pub prompt: String,
    pub fingerprint: String,
    pub summaries: Vec<String>,
    /// Every document's embedding, fresh or reused.
    pub embeddings: BTreeMap<String, Embedding>,
}

pub struct QueryController {
    cache: SharedContextCache,
    preprocessor: IngestionPreprocessor,
    optimizer: PromptOptimizer,
    embedder: Arc<dyn Embedder>,
    responder: Arc<dyn Responder>,
    context: Option<(ContextSelector, usize)>,
}

impl QueryController {
    pub fn new(
        cache: SharedContextCache,
        embedder: Arc<dyn Embedder>,
        responder: Arc<dyn Responder>,
    ) -> Result<Self, QueryError> {
        Self::with_compression_ratio(cache, embedder, responder, DEFAULT_COMPRESSION_RATIO)
    }

    pub fn with_compression_ratio(
        cache: SharedContextCache,
        embedder: Arc<dyn Embedder>,
        responder: Arc<dyn Responder>,
        compression_ratio: f64,
    ) -> Result<Self, QueryError> {
        Ok(Self {
            preprocessor: IngestionPreprocessor::new(Arc::clone(&cache)),
            optimizer: PromptOptimizer::new(Arc::clone(&cache), compression_ratio)?,
            cache,
            embedder,
            responder,
            context: None,
        })
    }

    /// Append the normalized documents most similar to the prompt, within
    /// `max_tokens`.
    pub fn with_context_selector(mut self, selector: ContextSelector, max_tokens: usize) -> Self {
        self.context = Some((selector, max_tokens));
        self
    }

    pub async fn run(
        &self,
        query: &str,
        documents: &[DocumentPayload],
        force_refresh: bool,
    ) -> Result<QueryResult, QueryError> {
        let batch = self.preprocessor.prepare_batch(documents, force_refresh);

        let mut embeddings = batch.reused_embeddings.clone();
        if !batch.pending_embeddings.is_empty() {
            let fresh = self
                .embedder
                .embed(batch.pending_embeddings.clone())
                .await
                .map_err(QueryError::Embedding)?;
            if let Some(missing) = batch
                .pending_embeddings
                .iter()
                .find(|doc| !fresh.contains_key(&doc.document_id))
            {
                return Err(QueryError::MissingEmbedding {
                    document_id: missing.document_id.clone(),
                });
            }
            self.preprocessor
                .persist_embeddings(&fresh, &batch.pending_versions())?;
            embeddings.extend(fresh);
        }

        let optimized = self
            .optimizer
            .optimize(query, &batch.documents, force_refresh);
        let prompt = match &self.context {
            Some((selector, max_tokens)) => {
                let chunks: Vec<&str> = batch
                    .documents
                    .iter()
                    .map(|doc| doc.normalized_text.as_str())
                    .collect();
                selector.select(&optimized.prompt, &chunks, *max_tokens)
            }
            None => optimized.prompt.clone(),
        };

        let key = response_key(&optimized.fingerprint);
        if !force_refresh {
            if let Some(response) = self.cache.get_summary(&key, Some(&optimized.fingerprint)) {
                debug!(fingerprint = %optimized.fingerprint, "Response cache hit");
                return Ok(QueryResult {
                    response,
                    from_cache: true,
                    plan: optimized.plan,
                    prompt,
                    fingerprint: optimized.fingerprint,
                    summaries: optimized.summaries,
                    embeddings,
                });
            }
        }

        let response = self
            .responder
            .respond(prompt.clone(), optimized.plan.clone())
            .await
            .map_err(QueryError::Response)?;

        let mut metadata = Metadata::new();
        metadata.insert("strategy".into(), optimized.plan.strategy.to_string().into());
        metadata.insert("documents".into(), batch.documents.len().into());
        self.cache.put_summary(
            key,
            response.clone(),
            Some(optimized.fingerprint.clone()),
            metadata,
        );
        info!(
            fingerprint = %optimized.fingerprint,
            strategy = %optimized.plan.strategy,
            documents = batch.documents.len(),
            "Query answered"
        );

        Ok(QueryResult {
            response,
            from_cache: false,
            plan: optimized.plan,
            prompt,
            fingerprint: optimized.fingerprint,
            summaries: optimized.summaries,
            embeddings,
        })
    }
}

fn response_key(fingerprint: &str) -> String {
    format!("response::{fingerprint}")
}

/// Offline embedder: hashed bag-of-words, L2 normalized.
#[derive(Debug, Clone)]
pub struct LocalEmbedder {
    dimensions: usize,
}

impl LocalEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Embedding {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text.split_whitespace() {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            vector[(hasher.finish() % self.dimensions as u64) as usize] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

impl Default for LocalEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(
        &self,
        documents: Vec<PreprocessedDocument>,
    ) -> anyhow::Result<BTreeMap<String, Embedding>> {
        Ok(documents
            .into_iter()
            .map(|doc| {
                let vector = self.embed_text(&doc.normalized_text);
                (doc.document_id, vector)
            })
            .collect())
    }
}

/// Responder that renders the plan and prompt back. Used by the CLI when no
/// model backend is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoResponder;

#[async_trait]
impl Responder for EchoResponder {
    async fn respond(&self, prompt: String, plan: ChainPlan) -> anyhow::Result<String> {
        let steps = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| format!("{}. {step}", i + 1))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(format!("[{}]\n{steps}\n\n{prompt}", plan.strategy))
    }
}
