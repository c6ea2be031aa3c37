//! Deterministic consistency checks between accounting and the upstream
//! stages.

use chrono::Utc;
use coordination::documents::{CrossValidationFinding, CrossValidationReport, Document, Severity};
use coordination::Metadata;
use serde_json::{json, Value};

use super::{CrossValidationInput, StageAgent, StageContext};

pub const DEFAULT_TOLERANCE: f64 = 5.0;
pub const DEFAULT_CONFIDENCE_FLOOR: f64 = 0.65;

/// Compares document and accounting grand totals, flags low classification
/// confidence and escalates blocking audit issues.
#[derive(Debug, Clone, Copy)]
pub struct TotalsCrossValidator {
    tolerance: f64,
    confidence_floor: f64,
}

impl Default for TotalsCrossValidator {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE, DEFAULT_CONFIDENCE_FLOOR)
    }
}

impl TotalsCrossValidator {
    pub fn new(tolerance: f64, confidence_floor: f64) -> Self {
        Self {
            tolerance: tolerance.abs(),
            confidence_floor,
        }
    }

    /// One operation record per item.
    pub fn operations(document: &Document) -> Vec<Value> {
        document
            .items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                json!({
                    "id": format!("{}-item-{}", document.document_id, index + 1),
                    "sku": item.sku,
                    "description": item.description,
                    "quantity": item.quantity,
                    "total_value": item.total_value,
                })
            })
            .collect()
    }

    pub fn findings(&self, input: &CrossValidationInput) -> Vec<CrossValidationFinding> {
        let mut findings = Vec::new();

        let document_total = input.document.totals.grand_total;
        let accounting_total = input
            .accounting
            .totals
            .map(|t| t.grand_total)
            .unwrap_or(document_total);
        if (document_total - accounting_total).abs() > self.tolerance {
            findings.push(finding(
                "GRAND_TOTAL_MISMATCH",
                "document and accounting grand totals differ beyond tolerance",
                Severity::Critical,
                [
                    ("document", json!(document_total)),
                    ("accounting", json!(accounting_total)),
                    ("tolerance", json!(self.tolerance)),
                ],
            ));
        }

        let confidence = input.classification.confidence;
        if confidence < self.confidence_floor {
            findings.push(finding(
                "LOW_CLASSIFICATION_CONFIDENCE",
                "classification confidence below the allowed minimum",
                Severity::Warning,
                [("confidence", json!(confidence))],
            ));
        }

        for issue in input.audit.issues.iter().filter(|i| i.severity.is_blocking()) {
            findings.push(finding(
                &format!("AUDIT::{}", issue.code),
                &issue.message,
                Severity::Critical,
                [("severity", json!(issue.severity))],
            ));
        }
        findings
    }
}

fn finding<const N: usize>(
    code: &str,
    message: &str,
    severity: Severity,
    context: [(&str, Value); N],
) -> CrossValidationFinding {
    CrossValidationFinding {
        code: code.to_string(),
        message: message.to_string(),
        severity,
        context: context
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect::<Metadata>(),
    }
}

impl StageAgent<CrossValidationInput, CrossValidationReport> for TotalsCrossValidator {
    fn name(&self) -> &str {
        "cross_validator"
    }

    /// In recovery mode only critical findings are reported and the
    /// per-item operation records are skipped.
    fn run(
        &self,
        input: CrossValidationInput,
        ctx: &StageContext,
    ) -> anyhow::Result<CrossValidationReport> {
        let mut findings = self.findings(&input);
        let operations = if ctx.controls.recovery_mode {
            findings.retain(|f| f.severity == Severity::Critical);
            Vec::new()
        } else {
            Self::operations(&input.document)
        };
        Ok(CrossValidationReport {
            document_id: input.document.document_id.clone(),
            operations,
            findings,
            generated_at: Utc::now(),
        })
    }
}
