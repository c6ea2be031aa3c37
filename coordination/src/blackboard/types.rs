//! Envelope and payload types shared through the blackboard.
//!
//! Field names are camelCase on the wire (`documentId`, `latencyMs`,
//! `correlationId`) because reporting clients consume them directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Metadata;

/// Kind of message on the blackboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Raw,
    Summary,
    Insight,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw => write!(f, "raw"),
            Self::Summary => write!(f, "summary"),
            Self::Insight => write!(f, "insight"),
        }
    }
}

/// Low-level data materialized by extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDataPayload {
    pub document_id: String,
    pub stage: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

/// Semantic digest produced by a mid-pipeline agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticSummaryPayload {
    pub document_id: String,
    pub stage: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub highlights: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Open escape hatch for stage-specific fields.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub extra: Metadata,
}

impl SemanticSummaryPayload {
    pub fn new(
        document_id: impl Into<String>,
        stage: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            stage: stage.into(),
            summary: summary.into(),
            highlights: Vec::new(),
            score: None,
            extra: Metadata::new(),
        }
    }

    pub fn with_highlights(mut self, highlights: Vec<String>) -> Self {
        self.highlights = highlights;
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Final insight layer delivered to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalInsightPayload {
    pub document_id: String,
    pub stage: String,
    pub summary: String,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provenance: Vec<Value>,
}

/// A published message. Immutable once on the blackboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope<P> {
    pub agent: String,
    pub kind: MessageKind,
    pub payload: P,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Optional accounting attached to a publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishMeta {
    pub tokens: Option<u64>,
    pub latency_ms: Option<f64>,
    pub correlation_id: Option<String>,
}

impl PublishMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tokens(mut self, tokens: u64) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn latency_ms(mut self, latency_ms: f64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Payloads that can be published, each mapped to one [`MessageKind`].
pub trait BoardPayload: Sized {
    const KIND: MessageKind;

    fn document_id(&self) -> &str;

    fn into_envelope(envelope: MessageEnvelope<Self>) -> Envelope;
}

impl BoardPayload for RawDataPayload {
    const KIND: MessageKind = MessageKind::Raw;

    fn document_id(&self) -> &str {
        &self.document_id
    }

    fn into_envelope(envelope: MessageEnvelope<Self>) -> Envelope {
        Envelope::Raw(envelope)
    }
}

impl BoardPayload for SemanticSummaryPayload {
    const KIND: MessageKind = MessageKind::Summary;

    fn document_id(&self) -> &str {
        &self.document_id
    }

    fn into_envelope(envelope: MessageEnvelope<Self>) -> Envelope {
        Envelope::Summary(envelope)
    }
}

impl BoardPayload for FinalInsightPayload {
    const KIND: MessageKind = MessageKind::Insight;

    fn document_id(&self) -> &str {
        &self.document_id
    }

    fn into_envelope(envelope: MessageEnvelope<Self>) -> Envelope {
        Envelope::Insight(envelope)
    }
}

/// Any envelope, as stored in history and delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Envelope {
    Raw(MessageEnvelope<RawDataPayload>),
    Summary(MessageEnvelope<SemanticSummaryPayload>),
    Insight(MessageEnvelope<FinalInsightPayload>),
}

impl Envelope {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Raw(_) => MessageKind::Raw,
            Self::Summary(_) => MessageKind::Summary,
            Self::Insight(_) => MessageKind::Insight,
        }
    }

    pub fn agent(&self) -> &str {
        match self {
            Self::Raw(e) => &e.agent,
            Self::Summary(e) => &e.agent,
            Self::Insight(e) => &e.agent,
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            Self::Raw(e) => &e.payload.document_id,
            Self::Summary(e) => &e.payload.document_id,
            Self::Insight(e) => &e.payload.document_id,
        }
    }

    pub fn stage(&self) -> &str {
        match self {
            Self::Raw(e) => &e.payload.stage,
            Self::Summary(e) => &e.payload.stage,
            Self::Insight(e) => &e.payload.stage,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::Raw(e) => e.correlation_id.as_deref(),
            Self::Summary(e) => e.correlation_id.as_deref(),
            Self::Insight(e) => e.correlation_id.as_deref(),
        }
    }
}

/// Serializable copy of the blackboard history, grouped by kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlackboardSnapshot {
    pub raw: Vec<MessageEnvelope<RawDataPayload>>,
    pub summaries: Vec<MessageEnvelope<SemanticSummaryPayload>>,
    pub insights: Vec<MessageEnvelope<FinalInsightPayload>>,
}

impl BlackboardSnapshot {
    pub fn insights_for(&self, document_id: &str) -> usize {
        self.insights
            .iter()
            .filter(|e| e.payload.document_id == document_id)
            .count()
    }
}
