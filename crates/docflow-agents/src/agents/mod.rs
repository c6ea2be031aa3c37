//! Stage agents for the document pipeline.
//!
//! Each stage is a [`StageAgent`] with its own input and output type. Agents
//! are blocking and never see each other; the orchestrator threads the
//! output of one stage into the next and dispatches every call onto the
//! worker pool.
//!
//! The `reference_*` agents are deterministic implementations used by the
//! CLI and the tests. Production deployments swap in agents backed by OCR or
//! an LLM through [`AgentSet`].

pub mod accountant;
pub mod auditor;
pub mod classifier;
pub mod cross_validator;
pub mod extractor;
pub mod intelligence;

use std::fmt;
use std::sync::Arc;

use coordination::documents::{
    AccountingOutput, AuditReport, ClassificationResult, CrossValidationReport, Document,
    DocumentInput, InsightReport,
};
use coordination::metrics::AgentControls;
use serde::{Deserialize, Serialize};

pub use accountant::LedgerAccountant;
pub use auditor::RuleAuditor;
pub use classifier::KeywordClassifier;
pub use cross_validator::TotalsCrossValidator;
pub use extractor::LineExtractor;
pub use intelligence::InsightSummarizer;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extraction,
    Audit,
    Classification,
    Accounting,
    CrossValidation,
    Insight,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Extraction,
        Stage::Audit,
        Stage::Classification,
        Stage::Accounting,
        Stage::CrossValidation,
        Stage::Insight,
    ];

    /// Agent name used for budgets, metrics and blackboard envelopes.
    pub fn agent(self) -> &'static str {
        match self {
            Self::Extraction => "extractor",
            Self::Audit => "auditor",
            Self::Classification => "classifier",
            Self::Accounting => "accountant",
            Self::CrossValidation => "cross_validator",
            Self::Insight => "intelligence",
        }
    }

    /// Budget step the stage is charged against.
    pub fn step(self) -> &'static str {
        match self {
            Self::Extraction => "ingest",
            Self::Audit => "analysis",
            Self::Classification => "classification",
            Self::Accounting => "reconciliation",
            Self::CrossValidation => "consistency",
            Self::Insight => "analysis",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Audit => "audit",
            Self::Classification => "classification",
            Self::Accounting => "accounting",
            Self::CrossValidation => "cross_validation",
            Self::Insight => "insight",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an agent knows about the call it is serving.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub run_id: String,
    pub document_id: String,
    pub stage: Stage,
    /// Live controls for this agent, as last adjusted by the guard.
    pub controls: AgentControls,
}

/// One pipeline stage. `run` is blocking and is executed on the worker pool.
pub trait StageAgent<I, O>: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, input: I, ctx: &StageContext) -> anyhow::Result<O>;
}

/// Input of the cross-validation stage.
#[derive(Debug, Clone)]
pub struct CrossValidationInput {
    /// Latest view of the document, including any repaired totals.
    pub document: Document,
    pub audit: AuditReport,
    pub classification: ClassificationResult,
    pub accounting: AccountingOutput,
}

/// Input of the insight stage.
#[derive(Debug, Clone)]
pub struct InsightInput {
    pub accounting: AccountingOutput,
    pub cross_validation: CrossValidationReport,
}

pub type SharedStageAgent<I, O> = Arc<dyn StageAgent<I, O>>;

/// The six agents an orchestrator runs, one per [`Stage`].
#[derive(Clone)]
pub struct AgentSet {
    pub extractor: SharedStageAgent<DocumentInput, Document>,
    pub auditor: SharedStageAgent<Document, AuditReport>,
    pub classifier: SharedStageAgent<AuditReport, ClassificationResult>,
    pub accountant: SharedStageAgent<ClassificationResult, AccountingOutput>,
    pub cross_validator: SharedStageAgent<CrossValidationInput, CrossValidationReport>,
    pub intelligence: SharedStageAgent<InsightInput, InsightReport>,
}

impl AgentSet {
    /// The deterministic reference agents.
    pub fn reference() -> Self {
        Self {
            extractor: Arc::new(LineExtractor::new()),
            auditor: Arc::new(RuleAuditor::default()),
            classifier: Arc::new(KeywordClassifier),
            accountant: Arc::new(LedgerAccountant),
            cross_validator: Arc::new(TotalsCrossValidator::default()),
            intelligence: Arc::new(InsightSummarizer),
        }
    }

    pub fn with_extractor(mut self, agent: SharedStageAgent<DocumentInput, Document>) -> Self {
        self.extractor = agent;
        self
    }

    pub fn with_auditor(mut self, agent: SharedStageAgent<Document, AuditReport>) -> Self {
        self.auditor = agent;
        self
    }

    pub fn with_classifier(
        mut self,
        agent: SharedStageAgent<AuditReport, ClassificationResult>,
    ) -> Self {
        self.classifier = agent;
        self
    }

    pub fn with_accountant(
        mut self,
        agent: SharedStageAgent<ClassificationResult, AccountingOutput>,
    ) -> Self {
        self.accountant = agent;
        self
    }

    pub fn with_cross_validator(
        mut self,
        agent: SharedStageAgent<CrossValidationInput, CrossValidationReport>,
    ) -> Self {
        self.cross_validator = agent;
        self
    }

    pub fn with_intelligence(mut self, agent: SharedStageAgent<InsightInput, InsightReport>) -> Self {
        self.intelligence = agent;
        self
    }
}

#[cfg(test)]
pub(crate) fn test_context(stage: Stage) -> StageContext {
    StageContext {
        run_id: "run-test".into(),
        document_id: "nf-test".into(),
        stage,
        controls: AgentControls::new(120_000),
    }
}
