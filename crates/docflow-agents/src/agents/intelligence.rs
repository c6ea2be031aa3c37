//! Insight summarizer, the last stage.

use coordination::documents::{InsightReference, InsightReport, Severity};

use super::{InsightInput, StageAgent, StageContext};

#[derive(Debug, Clone, Copy, Default)]
pub struct InsightSummarizer;

impl StageAgent<InsightInput, InsightReport> for InsightSummarizer {
    fn name(&self) -> &str {
        "intelligence"
    }

    fn run(&self, input: InsightInput, _ctx: &StageContext) -> anyhow::Result<InsightReport> {
        let accounting = &input.accounting;
        let findings = &input.cross_validation.findings;
        let grand_total = accounting.totals.map(|t| t.grand_total).unwrap_or(0.0);
        let critical = findings
            .iter()
            .filter(|f| f.severity == Severity::Critical)
            .count();

        let summary = format!(
            "{} ledger entries booked, grand total {grand_total:.2}; {} findings ({critical} critical).",
            accounting.ledger_entries.len(),
            findings.len(),
        );

        let mut recommendations: Vec<String> = findings
            .iter()
            .filter(|f| f.severity == Severity::Critical)
            .map(|f| format!("Review {}: {}", f.code, f.message))
            .collect();
        recommendations.push("Keep monitoring".to_string());

        Ok(InsightReport {
            document_id: accounting.document_id.clone(),
            title: "Executive summary".to_string(),
            summary,
            provenance: vec![
                InsightReference {
                    description: "accounting ledger".to_string(),
                    exists: !accounting.ledger_entries.is_empty(),
                },
                InsightReference {
                    description: "cross validation".to_string(),
                    exists: !input.cross_validation.operations.is_empty(),
                },
            ],
            recommendations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{test_context, Stage};
    use chrono::Utc;
    use coordination::documents::{
        AccountingOutput, CrossValidationFinding, CrossValidationReport, DocumentTotals,
        LedgerEntry,
    };

    #[test]
    fn test_summary_and_recommendations() {
        let input = InsightInput {
            accounting: AccountingOutput {
                document_id: "nf-5".into(),
                ledger_entries: vec![LedgerEntry {
                    account: "3.1.01 revenue".into(),
                    description: "tea".into(),
                    amount: 12.5,
                }],
                sped_files: Vec::new(),
                generated_at: Utc::now(),
                document: None,
                totals: Some(DocumentTotals {
                    items_total: 12.5,
                    taxes_total: 0.0,
                    grand_total: 12.5,
                }),
            },
            cross_validation: CrossValidationReport {
                document_id: "nf-5".into(),
                operations: Vec::new(),
                findings: vec![CrossValidationFinding {
                    code: "AUDIT::CFOP_INVALID".into(),
                    message: "bad cfop".into(),
                    severity: Severity::Critical,
                    context: Default::default(),
                }],
                generated_at: Utc::now(),
            },
        };

        let report = InsightSummarizer
            .run(input, &test_context(Stage::Insight))
            .unwrap();
        assert_eq!(report.title, "Executive summary");
        assert!(report.summary.contains("grand total 12.50"));
        assert!(report.summary.contains("1 critical"));
        assert_eq!(report.recommendations.len(), 2);
        assert_eq!(report.recommendations.last().unwrap(), "Keep monitoring");
        assert!(report.provenance[0].exists);
        assert!(!report.provenance[1].exists);
    }
}
