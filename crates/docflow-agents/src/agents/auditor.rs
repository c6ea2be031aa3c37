//! Rule-based auditor.

use std::collections::BTreeSet;

use chrono::Utc;
use coordination::documents::{AuditIssue, AuditReport, Document, Severity};

use super::{StageAgent, StageContext};

/// CFOP codes accepted when no allow-list is configured.
pub const DEFAULT_VALID_CFOPS: [&str; 2] = ["5102", "6102"];

/// Checks every item against the document's CFOP and basic value sanity.
///
/// An audit passes when no issue has a blocking severity.
#[derive(Debug, Clone)]
pub struct RuleAuditor {
    valid_cfops: BTreeSet<String>,
}

impl Default for RuleAuditor {
    fn default() -> Self {
        Self::new(DEFAULT_VALID_CFOPS)
    }
}

impl RuleAuditor {
    pub fn new<S: Into<String>>(valid_cfops: impl IntoIterator<Item = S>) -> Self {
        Self {
            valid_cfops: valid_cfops.into_iter().map(Into::into).collect(),
        }
    }

    pub fn validate(&self, document: &Document) -> Vec<AuditIssue> {
        let mut issues = Vec::new();
        if document.items.is_empty() {
            issues.push(AuditIssue {
                code: "NO_ITEMS".into(),
                message: "document has no line items".into(),
                severity: Severity::Warning,
            });
            return issues;
        }

        let cfop = document.metadata_str("cfop").unwrap_or("0000").trim();
        for (index, item) in document.items.iter().enumerate() {
            if !self.valid_cfops.contains(cfop) {
                issues.push(AuditIssue {
                    code: "CFOP_INVALID".into(),
                    message: format!("CFOP {cfop} is not allowed (item {})", index + 1),
                    severity: Severity::Error,
                });
            }
            if item.quantity < 0.0 || item.unit_price < 0.0 || item.total_value < 0.0 {
                issues.push(AuditIssue {
                    code: "NEGATIVE_VALUE".into(),
                    message: format!("item {} has a negative value", index + 1),
                    severity: Severity::Error,
                });
            }
        }
        issues
    }
}

impl StageAgent<Document, AuditReport> for RuleAuditor {
    fn name(&self) -> &str {
        "auditor"
    }

    fn run(&self, document: Document, _ctx: &StageContext) -> anyhow::Result<AuditReport> {
        let issues = self.validate(&document);
        let passed = !issues.iter().any(|issue| issue.severity.is_blocking());
        Ok(AuditReport {
            document_id: document.document_id.clone(),
            document,
            issues,
            passed,
            audited_at: Utc::now(),
        })
    }
}
