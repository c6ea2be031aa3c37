//! Document model passed between pipeline stages.
//!
//! Each stage consumes the previous stage's output type and produces its
//! own; the [`Document`] travels along so later stages can inspect items
//! and totals.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::budget::SizeHint;
use crate::Metadata;

/// A document submitted to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentInput {
    pub document_id: String,
    pub filename: String,
    pub content_type: String,
    /// Text content, already decoded by the ingestion collaborator.
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl DocumentInput {
    pub fn new(document_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            filename: String::new(),
            content_type: "text/plain".to_string(),
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Size hint from metadata, falling back to the content length.
    pub fn size_hint(&self) -> SizeHint {
        let mut hint = SizeHint::from_metadata(&self.metadata);
        if hint.token_estimate.is_none() && hint.size_bytes.is_none() && !self.content.is_empty() {
            hint.size_bytes = Some(self.content.len() as u64);
        }
        hint
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub total_value: f64,
    /// Tax name to amount.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub taxes: BTreeMap<String, f64>,
}

impl DocumentItem {
    /// Declared total, or `quantity * unit_price` when none was declared.
    pub fn effective_total(&self) -> f64 {
        if self.total_value > 0.0 {
            self.total_value
        } else {
            (self.quantity * self.unit_price).max(0.0)
        }
    }

    pub fn tax_total(&self) -> f64 {
        self.taxes.values().sum::<f64>().max(0.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentTotals {
    pub items_total: f64,
    #[serde(default)]
    pub taxes_total: f64,
    pub grand_total: f64,
}

/// Extraction output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub filename: String,
    pub content_type: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub extracted_at: DateTime<Utc>,
    #[serde(default)]
    pub items: Vec<DocumentItem>,
    #[serde(default)]
    pub totals: DocumentTotals,
}

impl Document {
    pub fn from_input(input: &DocumentInput, items: Vec<DocumentItem>) -> Self {
        Self {
            document_id: input.document_id.clone(),
            filename: input.filename.clone(),
            content_type: input.content_type.clone(),
            metadata: input.metadata.clone(),
            extracted_at: Utc::now(),
            items,
            totals: DocumentTotals::default(),
        }
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Error and critical issues fail an audit.
    pub fn is_blocking(self) -> bool {
        matches!(self, Self::Error | Self::Critical)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditIssue {
    pub code: String,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub document_id: String,
    pub document: Document,
    pub issues: Vec<AuditIssue>,
    pub passed: bool,
    pub audited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub document_id: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub sector: String,
    pub confidence: f64,
    pub document: Document,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub account: String,
    pub description: String,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountingOutput {
    pub document_id: String,
    pub ledger_entries: Vec<LedgerEntry>,
    pub sped_files: Vec<String>,
    pub generated_at: DateTime<Utc>,
    pub document: Option<Document>,
    pub totals: Option<DocumentTotals>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossValidationFinding {
    pub code: String,
    pub message: String,
    pub severity: Severity,
    #[serde(default)]
    pub context: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossValidationReport {
    pub document_id: String,
    pub operations: Vec<Value>,
    pub findings: Vec<CrossValidationFinding>,
    pub generated_at: DateTime<Utc>,
}

impl CrossValidationReport {
    pub fn has_critical(&self) -> bool {
        self.findings
            .iter()
            .any(|f| f.severity == Severity::Critical)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightReference {
    pub description: String,
    pub exists: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightReport {
    pub document_id: String,
    pub title: String,
    pub summary: String,
    pub provenance: Vec<InsightReference>,
    pub recommendations: Vec<String>,
}

/// Parse a monetary amount written either as `1234.56` or in the Brazilian
/// style `R$ 1.234,56`. Unparseable input yields 0.
///
/// A separator that repeats, or a lone dot followed by exactly three digits,
/// groups thousands. A lone comma is always the decimal mark.
pub fn parse_amount(text: &str) -> f64 {
    let sanitized: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-'))
        .collect();
    if sanitized.is_empty() {
        return 0.0;
    }

    let commas = sanitized.matches(',').count();
    let dots = sanitized.matches('.').count();
    let normalized = match (commas, dots) {
        (0, 0) => sanitized,
        (c, d) if c > 0 && d > 0 => {
            let last_comma = sanitized.rfind(',').unwrap_or(0);
            let last_dot = sanitized.rfind('.').unwrap_or(0);
            if last_comma > last_dot {
                sanitized.replace('.', "").replace(',', ".")
            } else {
                sanitized.replace(',', "")
            }
        }
        (1, 0) => sanitized.replace(',', "."),
        (_, 0) => sanitized.replace(',', ""),
        (0, 1) if groups_thousands(&sanitized) => sanitized.replace('.', ""),
        (0, 1) => sanitized,
        _ => sanitized.replace('.', ""),
    };

    normalized.parse().unwrap_or(0.0)
}

/// `1.234` style: exactly three digits after the only dot, and a non-zero
/// integer part.
fn groups_thousands(text: &str) -> bool {
    match text.split_once('.') {
        Some((int, frac)) => {
            frac.len() == 3 && !int.trim_start_matches('-').trim_start_matches('0').is_empty()
        }
        None => false,
    }
}
