//! Keyword classifier.

use coordination::documents::{AuditReport, ClassificationResult};

use super::{StageAgent, StageContext};

const SECTOR_KEYWORDS: &[(&str, &[&str])] = &[
    ("services", &["service", "servico", "consulting", "maintenance"]),
    ("industry", &["raw material", "materia prima", "steel", "resin"]),
];

const DEFAULT_SECTOR: &str = "retail";

/// Derives the document type from the audit verdict and the sector from
/// item descriptions. A `sector` metadata entry overrides the keywords.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn sector_for(report: &AuditReport) -> String {
        if let Some(sector) = report.document.metadata_str("sector") {
            return sector.to_string();
        }
        let descriptions: Vec<String> = report
            .document
            .items
            .iter()
            .map(|item| item.description.to_lowercase())
            .collect();
        SECTOR_KEYWORDS
            .iter()
            .find(|(_, keywords)| {
                descriptions
                    .iter()
                    .any(|d| keywords.iter().any(|k| d.contains(k)))
            })
            .map(|(sector, _)| sector.to_string())
            .unwrap_or_else(|| DEFAULT_SECTOR.to_string())
    }
}

impl StageAgent<AuditReport, ClassificationResult> for KeywordClassifier {
    fn name(&self) -> &str {
        "classifier"
    }

    fn run(&self, report: AuditReport, _ctx: &StageContext) -> anyhow::Result<ClassificationResult> {
        let (doc_type, confidence) = if report.passed {
            ("NF-e", 0.9)
        } else {
            ("NF-e-erro", 0.5)
        };
        Ok(ClassificationResult {
            document_id: report.document_id.clone(),
            doc_type: doc_type.to_string(),
            sector: Self::sector_for(&report),
            confidence,
            document: report.document,
        })
    }
}
