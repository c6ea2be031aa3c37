//! Offline normalization with incremental embedding reuse.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::OptimizerError;
use crate::cache::{Embedding, SharedContextCache};
use crate::Metadata;

/// One text transformation step.
pub type Normalizer = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Raw document handed to ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentPayload {
    pub document_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl DocumentPayload {
    pub fn new(document_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A normalized document and the digest of its normalized text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessedDocument {
    pub document_id: String,
    pub normalized_text: String,
    pub digest: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreprocessingResult {
    pub documents: Vec<PreprocessedDocument>,
    /// Documents whose embedding is missing or stale.
    pub pending_embeddings: Vec<PreprocessedDocument>,
    /// Cached embeddings still valid for the current digest.
    pub reused_embeddings: BTreeMap<String, Embedding>,
}

impl PreprocessingResult {
    pub fn digests(&self) -> Vec<&str> {
        self.documents.iter().map(|d| d.digest.as_str()).collect()
    }

    /// `document_id -> digest` for the pending documents.
    pub fn pending_versions(&self) -> BTreeMap<String, String> {
        self.pending_embeddings
            .iter()
            .map(|d| (d.document_id.clone(), d.digest.clone()))
            .collect()
    }
}

/// Normalizes documents and decides which embeddings must be recomputed.
pub struct IngestionPreprocessor {
    cache: SharedContextCache,
    normalizers: Vec<Normalizer>,
}

impl IngestionPreprocessor {
    /// Preprocessor with the default steps: lowercase, then collapse
    /// whitespace runs to single spaces.
    pub fn new(cache: SharedContextCache) -> Self {
        Self {
            cache,
            normalizers: default_normalizers(),
        }
    }

    pub fn with_normalizers(
        cache: SharedContextCache,
        normalizers: Vec<Normalizer>,
    ) -> Result<Self, OptimizerError> {
        if normalizers.is_empty() {
            return Err(OptimizerError::NoNormalizers);
        }
        Ok(Self { cache, normalizers })
    }

    pub fn normalize(&self, text: &str) -> String {
        let mut normalized = text.to_string();
        for step in &self.normalizers {
            normalized = step(&normalized);
        }
        normalized
    }

    pub fn digest(text: &str) -> String {
        blake3::hash(text.as_bytes()).to_hex().to_string()
    }

    /// Normalize every document and split them into pending vs reused
    /// embeddings. `force_refresh` treats every cached embedding as stale.
    pub fn prepare_batch(
        &self,
        documents: &[DocumentPayload],
        force_refresh: bool,
    ) -> PreprocessingResult {
        let mut result = PreprocessingResult::default();

        for item in documents {
            let normalized_text = self.normalize(&item.content);
            let digest = Self::digest(&normalized_text);
            let doc = PreprocessedDocument {
                document_id: item.document_id.clone(),
                normalized_text,
                digest,
                metadata: item.metadata.clone(),
            };

            let cached = if force_refresh {
                None
            } else {
                self.cache.get_embedding(&doc.document_id, Some(&doc.digest))
            };
            match cached {
                Some(embedding) => {
                    result.reused_embeddings.insert(doc.document_id.clone(), embedding);
                }
                None => result.pending_embeddings.push(doc.clone()),
            }
            result.documents.push(doc);
        }

        debug!(
            documents = result.documents.len(),
            pending = result.pending_embeddings.len(),
            reused = result.reused_embeddings.len(),
            "Prepared ingestion batch"
        );
        result
    }

    /// Store freshly computed embeddings versioned by their digest.
    ///
    /// Every embedding must have a digest in `versions`; nothing is stored
    /// if one is missing.
    pub fn persist_embeddings(
        &self,
        embeddings: &BTreeMap<String, Embedding>,
        versions: &BTreeMap<String, String>,
    ) -> Result<(), OptimizerError> {
        if let Some(missing) = embeddings.keys().find(|id| !versions.contains_key(*id)) {
            return Err(OptimizerError::MissingDigest {
                document_id: missing.clone(),
            });
        }
        for (document_id, embedding) in embeddings {
            let mut metadata = Metadata::new();
            metadata.insert("document_id".into(), document_id.clone().into());
            self.cache.put_embedding(
                document_id.clone(),
                embedding.clone(),
                versions.get(document_id).cloned(),
                metadata,
            );
        }
        Ok(())
    }
}

fn default_normalizers() -> Vec<Normalizer> {
    vec![
        Box::new(|text: &str| text.to_lowercase()),
        Box::new(|text: &str| text.split_whitespace().collect::<Vec<_>>().join(" ")),
    ]
}
