//! Agent Orchestrator
//!
//! Drives each document through the six stages in order:
//!
//! ```text
//! extraction → audit → classification → accounting → [reconcile] → cross validation → insight
//! ```
//!
//! A run first validates its whole estimate against the remaining budget;
//! nothing executes when that fails. Then, for every stage, the orchestrator:
//! 1. advances the run's [`StageMachine`]
//! 2. reserves tokens from the shared budget (a failed reservation aborts the run)
//! 3. awaits all before-hooks concurrently
//! 4. runs the blocking agent on the worker pool
//! 5. awaits all after-hooks concurrently, on failure too
//! 6. publishes the stage output on the blackboard before the next stage starts
//!
//! Each run publishes on its own blackboard scope, a child of the
//! orchestrator's board, and finalizes that scope exactly once on exit,
//! including failed runs, so its subscribers never wait forever. A batch
//! gets one more scope that closes after its last document.

use std::sync::Arc;
use std::time::Instant;

use coordination::blackboard::{
    FinalInsightPayload, PublishMeta, RawDataPayload, SemanticSummaryPayload, SharedBlackboardRef,
};
use coordination::budget::{
    BudgetExceeded, BudgetViolation, SharedBudgetManager, SizeHint, UsageReport,
};
use coordination::documents::{
    AccountingOutput, AuditReport, ClassificationResult, CrossValidationReport, Document,
    DocumentInput, InsightReport,
};
use coordination::metrics::{ControlBoard, SharedControlBoard};
use coordination::reconcile::{ReconcileOutcome, Reconciler};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::{
    AgentSet, CrossValidationInput, InsightInput, SharedStageAgent, Stage, StageContext,
};
use crate::config::{DEFAULT_AGENT_TIMEOUT_MS, DEFAULT_WORKERS};
use crate::hooks::{AfterHook, BeforeHook, HookContext};
use crate::state_machine::{IllegalTransition, PipelineState, StageMachine};
use crate::telemetry::{RunRecord, RunStatus, StageTiming, TelemetrySink};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Budget(#[from] BudgetExceeded),

    #[error("budget preflight failed: {}", join_violations(.violations))]
    Preflight { violations: Vec<BudgetViolation> },

    #[error("{stage} stage failed in {agent}: {error:#}")]
    Agent {
        stage: Stage,
        agent: String,
        error: anyhow::Error,
    },

    #[error("worker pool is closed")]
    WorkerPoolClosed,

    #[error(transparent)]
    Transition(#[from] IllegalTransition),

    #[error("document task failed: {0}")]
    Task(String),
}

impl PipelineError {
    /// Whether the run was stopped by the token budget.
    pub fn is_budget(&self) -> bool {
        matches!(self, Self::Budget(_) | Self::Preflight { .. })
    }
}

/// Everything one document run produced.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunResult {
    pub run_id: String,
    /// Latest view of the document, including repaired totals.
    pub document: Document,
    pub audit: AuditReport,
    pub classification: ClassificationResult,
    pub accounting: AccountingOutput,
    pub cross_validation: CrossValidationReport,
    pub insight: InsightReport,
    pub repaired: bool,
    pub tokens: u64,
}

#[derive(Debug)]
pub struct DocumentOutcome {
    pub document_id: String,
    pub result: Result<PipelineRunResult, PipelineError>,
}

/// Result of [`Orchestrator::run_batch`].
#[derive(Debug)]
pub enum BatchOutcome {
    /// Preflight rejected the batch. No agent ran and no tokens were consumed.
    Fallback {
        reason: String,
        documents: Vec<String>,
        violations: Vec<BudgetViolation>,
        estimated: UsageReport,
    },
    /// One outcome per input document, in input order.
    Completed { documents: Vec<DocumentOutcome> },
}

impl BatchOutcome {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }

    /// Serializable view for the CLI and logs.
    pub fn report(&self) -> BatchReport<'_> {
        match self {
            Self::Fallback {
                reason,
                documents,
                violations,
                ..
            } => BatchReport::Fallback {
                reason,
                documents,
                violations,
            },
            Self::Completed { documents } => BatchReport::Completed {
                documents: documents
                    .iter()
                    .map(|outcome| match &outcome.result {
                        Ok(result) => DocumentReport {
                            document_id: &outcome.document_id,
                            status: RunStatus::Completed,
                            result: Some(result),
                            error: None,
                        },
                        Err(error) => DocumentReport {
                            document_id: &outcome.document_id,
                            status: if error.is_budget() {
                                RunStatus::Fallback
                            } else {
                                RunStatus::Failed
                            },
                            result: None,
                            error: Some(error.to_string()),
                        },
                    })
                    .collect(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchReport<'a> {
    Fallback {
        reason: &'a str,
        documents: &'a [String],
        violations: &'a [BudgetViolation],
    },
    Completed {
        documents: Vec<DocumentReport<'a>>,
    },
}

#[derive(Debug, Serialize)]
pub struct DocumentReport<'a> {
    pub document_id: &'a str,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<&'a PipelineRunResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn join_violations(violations: &[BudgetViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Finalizes a blackboard scope when its run exits, whichever way it exits.
struct FinalizeOnDrop(SharedBlackboardRef);

impl Drop for FinalizeOnDrop {
    fn drop(&mut self) {
        self.0.finalize();
    }
}

/// Mutable bookkeeping of one document run.
struct RunState {
    run_id: String,
    document_id: String,
    hint: SizeHint,
    board: SharedBlackboardRef,
    machine: StageMachine,
    record: RunRecord,
}

impl RunState {
    fn new(input: &DocumentInput, board: SharedBlackboardRef) -> Self {
        let run_id = Uuid::new_v4().to_string();
        Self {
            record: RunRecord::new(&run_id, &input.document_id),
            document_id: input.document_id.clone(),
            hint: input.size_hint(),
            board,
            machine: StageMachine::new(),
            run_id,
        }
    }

    fn publish_meta(&self, staged: &Staged<impl Sized>) -> PublishMeta {
        PublishMeta::new()
            .tokens(staged.tokens)
            .latency_ms(staged.latency_ms)
            .correlation_id(&self.run_id)
    }
}

/// A stage output with what it cost.
struct Staged<O> {
    output: O,
    tokens: u64,
    latency_ms: f64,
}

pub struct Orchestrator {
    agents: AgentSet,
    budget: SharedBudgetManager,
    blackboard: SharedBlackboardRef,
    controls: SharedControlBoard,
    reconciler: Reconciler,
    workers: Arc<Semaphore>,
    before_hooks: Vec<Arc<dyn BeforeHook>>,
    after_hooks: Vec<Arc<dyn AfterHook>>,
    telemetry: Option<Arc<TelemetrySink>>,
}

impl Orchestrator {
    pub fn new(
        agents: AgentSet,
        budget: SharedBudgetManager,
        blackboard: SharedBlackboardRef,
    ) -> Self {
        Self {
            agents,
            budget,
            blackboard,
            controls: ControlBoard::new(DEFAULT_AGENT_TIMEOUT_MS).shared(),
            reconciler: Reconciler::default(),
            workers: Arc::new(Semaphore::new(DEFAULT_WORKERS)),
            before_hooks: Vec::new(),
            after_hooks: Vec::new(),
            telemetry: None,
        }
    }

    /// Bound the number of agent calls running at once across all documents.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Arc::new(Semaphore::new(workers.max(1)));
        self
    }

    pub fn with_controls(mut self, controls: SharedControlBoard) -> Self {
        self.controls = controls;
        self
    }

    pub fn with_reconciler(mut self, reconciler: Reconciler) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn with_telemetry(mut self, sink: Arc<TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn with_before_hook(mut self, hook: Arc<dyn BeforeHook>) -> Self {
        self.register_before_hook(hook);
        self
    }

    pub fn with_after_hook(mut self, hook: Arc<dyn AfterHook>) -> Self {
        self.register_after_hook(hook);
        self
    }

    pub fn register_before_hook(&mut self, hook: Arc<dyn BeforeHook>) {
        self.before_hooks.push(hook);
    }

    pub fn register_after_hook(&mut self, hook: Arc<dyn AfterHook>) {
        self.after_hooks.push(hook);
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Board every run forwards to. Runs never finalize it.
    pub fn blackboard(&self) -> &SharedBlackboardRef {
        &self.blackboard
    }

    pub fn budget(&self) -> &SharedBudgetManager {
        &self.budget
    }

    pub fn controls(&self) -> &SharedControlBoard {
        &self.controls
    }

    /// Run every stage for one document on a fresh scope of the
    /// orchestrator's blackboard.
    pub async fn run(&self, input: DocumentInput) -> Result<PipelineRunResult, PipelineError> {
        self.run_on(input, self.blackboard.scope()).await
    }

    /// Run every stage for one document, publishing on `board`.
    ///
    /// `board` is finalized when the run exits. Create it with
    /// `orchestrator.blackboard().scope()` and subscribe before calling to
    /// follow the run live.
    pub async fn run_on(
        &self,
        input: DocumentInput,
        board: SharedBlackboardRef,
    ) -> Result<PipelineRunResult, PipelineError> {
        self.run_document(input, board, true).await
    }

    async fn run_document(
        &self,
        input: DocumentInput,
        board: SharedBlackboardRef,
        preflight: bool,
    ) -> Result<PipelineRunResult, PipelineError> {
        let _finalize = FinalizeOnDrop(Arc::clone(&board));
        let started = Instant::now();
        let mut state = RunState::new(&input, board);
        info!(
            run_id = %state.run_id,
            document_id = %state.document_id,
            "Pipeline run started"
        );

        let checked = if preflight {
            self.preflight_document(&state.hint)
        } else {
            Ok(())
        };
        let outcome = match checked {
            Ok(()) => match self.execute(input, &mut state).await {
                Ok(result) => state
                    .machine
                    .advance(PipelineState::Completed, None)
                    .map(|()| result)
                    .map_err(PipelineError::from),
                Err(error) => Err(error),
            },
            Err(error) => Err(error),
        };

        if let Err(error) = &outcome {
            if !state.machine.is_terminal() {
                let _ = state.machine.fail(&error.to_string());
            }
            warn!(
                run_id = %state.run_id,
                document_id = %state.document_id,
                budget = error.is_budget(),
                "Pipeline run failed: {error}"
            );
        } else {
            info!(
                run_id = %state.run_id,
                summary = %state.machine.summary(),
                "Pipeline run completed"
            );
        }

        self.finish_record(state, &outcome, started);
        outcome
    }

    /// Run a batch concurrently on a fresh scope of the orchestrator's
    /// blackboard.
    pub async fn run_batch(self: &Arc<Self>, inputs: Vec<DocumentInput>) -> BatchOutcome {
        self.run_batch_on(inputs, self.blackboard.scope()).await
    }

    /// Run a batch concurrently after a budget preflight, publishing on
    /// `board`.
    ///
    /// When the preflight finds a violation nothing runs and a
    /// [`BatchOutcome::Fallback`] is returned. Otherwise each document runs as
    /// its own task on its own scope of `board`; one document failing does
    /// not affect the others. `board` is finalized once, after the last
    /// document.
    pub async fn run_batch_on(
        self: &Arc<Self>,
        inputs: Vec<DocumentInput>,
        board: SharedBlackboardRef,
    ) -> BatchOutcome {
        let _finalize = FinalizeOnDrop(Arc::clone(&board));
        let hints: Vec<SizeHint> = inputs.iter().map(DocumentInput::size_hint).collect();
        let estimated = self.budget.estimate_usage(&hints);
        let violations = self.budget.validate_preflight(&estimated);
        if !violations.is_empty() {
            let reason = join_violations(&violations);
            warn!(
                documents = inputs.len(),
                violations = violations.len(),
                "Budget preflight failed, skipping batch: {reason}"
            );
            return BatchOutcome::Fallback {
                reason,
                documents: inputs.into_iter().map(|input| input.document_id).collect(),
                violations,
                estimated,
            };
        }

        let (document_ids, handles): (Vec<_>, Vec<_>) = inputs
            .into_iter()
            .map(|input| {
                let this = Arc::clone(self);
                let document_id = input.document_id.clone();
                let scope = board.scope();
                (
                    document_id,
                    tokio::spawn(async move { this.run_document(input, scope, false).await }),
                )
            })
            .unzip();

        let documents = document_ids
            .into_iter()
            .zip(join_all(handles).await)
            .map(|(document_id, joined)| DocumentOutcome {
                document_id,
                result: joined.unwrap_or_else(|e| Err(PipelineError::Task(e.to_string()))),
            })
            .collect();
        BatchOutcome::Completed { documents }
    }

    /// Validate one document's estimate against the remaining budget.
    fn preflight_document(&self, hint: &SizeHint) -> Result<(), PipelineError> {
        let estimated = self.budget.estimate_usage(std::slice::from_ref(hint));
        let violations = self.budget.validate_preflight(&estimated);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Preflight { violations })
        }
    }

    async fn execute(
        &self,
        input: DocumentInput,
        state: &mut RunState,
    ) -> Result<PipelineRunResult, PipelineError> {
        let document_id = state.document_id.clone();

        let extracted = self
            .run_stage(state, Stage::Extraction, &self.agents.extractor, input)
            .await?;
        let data = raw_data(&extracted.output, &state.run_id);
        state.board.publish_raw(
            Stage::Extraction.agent(),
            RawDataPayload {
                document_id: document_id.clone(),
                stage: Stage::Extraction.to_string(),
                data,
                metadata: extracted.output.metadata.clone(),
            },
            state.publish_meta(&extracted),
        );

        let audit = self
            .run_stage(state, Stage::Audit, &self.agents.auditor, extracted.output.clone())
            .await?;
        state.board.publish_summary(
            Stage::Audit.agent(),
            audit_summary(&audit.output),
            state.publish_meta(&audit),
        );

        let classification = self
            .run_stage(
                state,
                Stage::Classification,
                &self.agents.classifier,
                audit.output.clone(),
            )
            .await?;
        state.board.publish_summary(
            Stage::Classification.agent(),
            classification_summary(&classification.output),
            state.publish_meta(&classification),
        );

        let mut accounting = self
            .run_stage(
                state,
                Stage::Accounting,
                &self.agents.accountant,
                classification.output.clone(),
            )
            .await?;
        state.board.publish_summary(
            Stage::Accounting.agent(),
            accounting_summary(&accounting.output),
            state.publish_meta(&accounting),
        );

        let repaired = if self.reconciler.needs_repair(&accounting.output) {
            state
                .machine
                .advance(PipelineState::Reconciling, Some("degenerate accounting totals"))?;
            let outcome = self.reconciler.reconcile(&mut accounting.output);
            if let ReconcileOutcome::Repaired { before, .. } = &outcome {
                let summary = accounting_summary(&accounting.output)
                    .with_extra("repaired", json!(true))
                    .with_extra("declared_totals", json!(before));
                state.board.publish_summary(
                    Stage::Accounting.agent(),
                    summary,
                    PublishMeta::new().correlation_id(&state.run_id),
                );
            }
            outcome.is_repaired()
        } else {
            false
        };

        let document = accounting
            .output
            .document
            .clone()
            .unwrap_or_else(|| classification.output.document.clone());
        let cross_validation = self
            .run_stage(
                state,
                Stage::CrossValidation,
                &self.agents.cross_validator,
                CrossValidationInput {
                    document: document.clone(),
                    audit: audit.output.clone(),
                    classification: classification.output.clone(),
                    accounting: accounting.output.clone(),
                },
            )
            .await?;
        state.board.publish_summary(
            Stage::CrossValidation.agent(),
            cross_validation_summary(&cross_validation.output),
            state.publish_meta(&cross_validation),
        );

        let insight = self
            .run_stage(
                state,
                Stage::Insight,
                &self.agents.intelligence,
                InsightInput {
                    accounting: accounting.output.clone(),
                    cross_validation: cross_validation.output.clone(),
                },
            )
            .await?;
        state.board.publish_insight(
            Stage::Insight.agent(),
            insight_payload(&insight.output),
            state.publish_meta(&insight),
        );

        state.record.repaired = repaired;
        Ok(PipelineRunResult {
            run_id: state.run_id.clone(),
            document,
            audit: audit.output,
            classification: classification.output,
            accounting: accounting.output,
            cross_validation: cross_validation.output,
            insight: insight.output,
            repaired,
            tokens: state.record.tokens,
        })
    }

    async fn run_stage<I, O>(
        &self,
        state: &mut RunState,
        stage: Stage,
        agent: &SharedStageAgent<I, O>,
        input: I,
    ) -> Result<Staged<O>, PipelineError>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        state.machine.advance(stage.into(), None)?;

        let agent_name = stage.agent();
        let tokens = self
            .budget
            .consume_for_stage(agent_name, stage.step(), &state.hint, None)?;

        let controls = self.controls.get(agent_name);
        let hook_ctx = HookContext::new(stage, &state.document_id, &state.run_id, controls.timeout_ms)
            .with_tokens(tokens);
        join_all(
            self.before_hooks
                .iter()
                .map(|hook| hook.before(agent_name, &hook_ctx)),
        )
        .await;

        let ctx = StageContext {
            run_id: state.run_id.clone(),
            document_id: state.document_id.clone(),
            stage,
            controls,
        };
        let permit = Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::WorkerPoolClosed)?;
        let worker = Arc::clone(agent);
        let started = Instant::now();
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            worker.run(input, &ctx)
        })
        .await
        .unwrap_or_else(|e| Err(anyhow::anyhow!("agent task aborted: {e}")));
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let success = result.is_ok();

        let done = hook_ctx.completed(latency_ms, success);
        join_all(
            self.after_hooks
                .iter()
                .map(|hook| hook.after(agent_name, &done)),
        )
        .await;

        state.record.record_stage(StageTiming {
            stage,
            agent: agent_name.to_string(),
            latency_ms,
            tokens,
            success,
        });
        debug!(
            run_id = %state.run_id,
            agent = agent_name,
            implementation = agent.name(),
            tokens,
            latency_ms,
            success,
            "Stage finished"
        );

        result
            .map(|output| Staged {
                output,
                tokens,
                latency_ms,
            })
            .map_err(|error| PipelineError::Agent {
                stage,
                agent: agent_name.to_string(),
                error,
            })
    }

    fn finish_record(
        &self,
        state: RunState,
        outcome: &Result<PipelineRunResult, PipelineError>,
        started: Instant,
    ) {
        let RunState {
            machine,
            mut record,
            ..
        } = state;
        record.status = match outcome {
            Ok(_) => RunStatus::Completed,
            Err(error) if error.is_budget() => RunStatus::Fallback,
            Err(_) => RunStatus::Failed,
        };
        record.error = outcome.as_ref().err().map(ToString::to_string);
        record.elapsed_ms = started.elapsed().as_millis() as u64;
        record.transitions = machine.transitions().to_vec();
        record.emit();
        if let Some(sink) = &self.telemetry {
            sink.append(&record);
        }
    }
}

/// Stage output as blackboard data; `null` (with a warning) when it does not
/// serialize.
fn raw_data<T: Serialize>(output: &T, run_id: &str) -> Value {
    serde_json::to_value(output).unwrap_or_else(|e| {
        warn!(run_id, "Failed to serialize stage output: {e}");
        Value::Null
    })
}

fn audit_summary(audit: &AuditReport) -> SemanticSummaryPayload {
    let summary = if audit.passed {
        "approved"
    } else {
        "pending issues"
    };
    SemanticSummaryPayload::new(&audit.document_id, Stage::Audit.as_str(), summary)
        .with_highlights(
            audit
                .issues
                .iter()
                .map(|issue| format!("{}: {}", issue.code, issue.message))
                .collect(),
        )
        .with_extra("passed", json!(audit.passed))
}

fn classification_summary(classification: &ClassificationResult) -> SemanticSummaryPayload {
    SemanticSummaryPayload::new(
        &classification.document_id,
        Stage::Classification.as_str(),
        format!(
            "Type {} for sector {}",
            classification.doc_type, classification.sector
        ),
    )
    .with_score(classification.confidence)
}

fn accounting_summary(accounting: &AccountingOutput) -> SemanticSummaryPayload {
    let grand_total = accounting.totals.map(|t| t.grand_total).unwrap_or_default();
    let mut summary = SemanticSummaryPayload::new(
        &accounting.document_id,
        Stage::Accounting.as_str(),
        format!(
            "{} ledger entries, grand total {:.2}",
            accounting.ledger_entries.len(),
            grand_total
        ),
    )
    .with_highlights(accounting.sped_files.clone());
    if let Some(totals) = accounting.totals {
        summary = summary.with_extra("totals", json!(totals));
    }
    summary
}

fn cross_validation_summary(report: &CrossValidationReport) -> SemanticSummaryPayload {
    SemanticSummaryPayload::new(
        &report.document_id,
        Stage::CrossValidation.as_str(),
        format!(
            "{} operations checked, {} findings",
            report.operations.len(),
            report.findings.len()
        ),
    )
    .with_highlights(report.findings.iter().map(|f| f.code.clone()).collect())
    .with_extra("critical", json!(report.has_critical()))
}

fn insight_payload(insight: &InsightReport) -> FinalInsightPayload {
    FinalInsightPayload {
        document_id: insight.document_id.clone(),
        stage: Stage::Insight.to_string(),
        summary: insight.summary.clone(),
        insights: insight.recommendations.clone(),
        provenance: insight
            .provenance
            .iter()
            .map(|p| json!({ "description": p.description, "exists": p.exists }))
            .collect(),
    }
}
