//! Summary compression, chain planning and response fingerprints.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{OptimizerError, PreprocessedDocument};
use crate::cache::SharedContextCache;
use crate::Metadata;

pub const DEFAULT_COMPRESSION_RATIO: f64 = 0.35;

static SENTENCE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]\s+").expect("SENTENCE_BREAK regex should compile"));

const SUMMARIZATION_KEYWORDS: &[&str] = &["summar", "overview", "synthes", "resumo"];
const CLASSIFICATION_KEYWORDS: &[&str] = &["classif", "categor", "kind"];

/// How the responder should approach a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Summarization,
    Classification,
    Analysis,
}

impl Strategy {
    /// Keyword classifier over the lowercased query.
    pub fn for_query(query: &str) -> Self {
        let query = query.to_lowercase();
        let matches = |keywords: &[&str]| keywords.iter().any(|k| query.contains(k));
        if matches(SUMMARIZATION_KEYWORDS) {
            Self::Summarization
        } else if matches(CLASSIFICATION_KEYWORDS) {
            Self::Classification
        } else {
            Self::Analysis
        }
    }

    pub fn steps(self) -> &'static [&'static str] {
        match self {
            Self::Summarization => &[
                "Consolidate the relevant evidence",
                "Check temporal consistency",
                "Produce an executive synthesis",
            ],
            Self::Classification => &[
                "Extract the key characteristics",
                "Apply the known taxonomy",
                "Justify the classification",
            ],
            Self::Analysis => &[
                "Identify the central facts",
                "Map the fiscal implications",
                "Produce a structured answer",
            ],
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Summarization => write!(f, "summarization"),
            Self::Classification => write!(f, "classification"),
            Self::Analysis => write!(f, "analysis"),
        }
    }
}

/// Strategy plus the ordered reasoning steps embedded in the prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainPlan {
    pub strategy: Strategy,
    pub steps: Vec<String>,
}

impl ChainPlan {
    pub fn for_query(query: &str) -> Self {
        let strategy = Strategy::for_query(query);
        Self {
            strategy,
            steps: strategy.steps().iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizedPrompt {
    pub prompt: String,
    pub summaries: Vec<String>,
    pub plan: ChainPlan,
    /// Hash of query, strategy and sorted document digests. Keys the
    /// response cache.
    pub fingerprint: String,
}

/// Builds compressed prompts, reusing cached summaries when the document
/// digest is unchanged.
pub struct PromptOptimizer {
    cache: SharedContextCache,
    compression_ratio: f64,
}

impl PromptOptimizer {
    pub fn new(cache: SharedContextCache, compression_ratio: f64) -> Result<Self, OptimizerError> {
        if !(compression_ratio > 0.0 && compression_ratio <= 1.0) {
            return Err(OptimizerError::InvalidRatio(compression_ratio));
        }
        Ok(Self {
            cache,
            compression_ratio,
        })
    }

    pub fn compression_ratio(&self) -> f64 {
        self.compression_ratio
    }

    pub fn optimize(
        &self,
        query: &str,
        documents: &[PreprocessedDocument],
        force_refresh: bool,
    ) -> OptimizedPrompt {
        let summaries: Vec<String> = documents
            .iter()
            .map(|doc| self.summary_for(doc, force_refresh))
            .collect();
        let plan = ChainPlan::for_query(query);
        let prompt = render_prompt(query, &summaries, &plan);
        let fingerprint = fingerprint(query, plan.strategy, documents);

        OptimizedPrompt {
            prompt,
            summaries,
            plan,
            fingerprint,
        }
    }

    /// Keep the first `max(1, floor(n * ratio))` sentences.
    pub fn compress(&self, text: &str) -> String {
        let sentences = split_sentences(text);
        if sentences.is_empty() {
            return text.to_string();
        }
        let keep = ((sentences.len() as f64 * self.compression_ratio).floor() as usize).max(1);
        sentences[..keep.min(sentences.len())].join(" ")
    }

    fn summary_for(&self, doc: &PreprocessedDocument, force_refresh: bool) -> String {
        if !force_refresh {
            if let Some(summary) = self.cache.get_summary(&doc.document_id, Some(&doc.digest)) {
                return summary;
            }
        }
        debug!(document_id = %doc.document_id, "Summary cache miss, compressing");

        let summary = self.compress(&doc.normalized_text);
        let mut metadata = Metadata::new();
        metadata.insert("document_id".into(), doc.document_id.clone().into());
        if let Some(source) = doc.metadata.get("source") {
            metadata.insert("source".into(), source.clone());
        }
        self.cache.put_summary(
            doc.document_id.clone(),
            summary.clone(),
            Some(doc.digest.clone()),
            metadata,
        );
        summary
    }
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for m in SENTENCE_BREAK.find_iter(text) {
        // Keep the punctuation with its sentence.
        let end = m.start() + 1;
        sentences.push(&text[start..end]);
        start = m.end();
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }
    sentences
}

fn render_prompt(query: &str, summaries: &[String], plan: &ChainPlan) -> String {
    let steps = plan
        .steps
        .iter()
        .map(|step| format!("- {step}"))
        .collect::<Vec<_>>()
        .join("\n");
    let context = summaries
        .iter()
        .enumerate()
        .map(|(i, summary)| format!("Document {}: {summary}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "You are a fiscal document assistant. Follow the plan below before answering.\n\
         Plan ({}):\n{steps}\n\n\
         Available context:\n{context}\n\n\
         Question: {query}\n\
         Answer precisely and cite the documents used.",
        plan.strategy
    )
}

/// Deterministic over document order.
pub fn fingerprint(query: &str, strategy: Strategy, documents: &[PreprocessedDocument]) -> String {
    let mut digests: Vec<&str> = documents.iter().map(|d| d.digest.as_str()).collect();
    digests.sort_unstable();
    let strategy = strategy.to_string();
    let mut parts = vec![query, strategy.as_str()];
    parts.extend(digests);
    blake3::hash(parts.join("|").as_bytes()).to_hex().to_string()
}
