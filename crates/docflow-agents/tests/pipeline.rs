//! End-to-end pipeline runs with the reference agents.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use coordination::blackboard::{MessageKind, SharedBlackboard};
use coordination::budget::{BudgetLimits, BudgetManager};
use coordination::documents::{AuditReport, Document, DocumentInput};
use docflow_agents::agents::{LineExtractor, RuleAuditor};
use docflow_agents::config::PipelineConfig;
use docflow_agents::orchestrator::{BatchOutcome, Orchestrator, PipelineError};
use docflow_agents::{AgentSet, PipelineRuntime, Stage, StageAgent, StageContext};

const INVOICE: &str = "\
cfop: 5102
[CB-1] Coffee beans 1kg | 2 | 35,90 | 71,80 | icms=12,92
Paper filters | 10 | 1,50 | 15,00
";

/// Extractor that counts its calls.
#[derive(Default)]
struct CountingExtractor {
    inner: LineExtractor,
    calls: AtomicUsize,
}

impl StageAgent<DocumentInput, Document> for CountingExtractor {
    fn name(&self) -> &str {
        "counting_extractor"
    }

    fn run(&self, input: DocumentInput, ctx: &StageContext) -> anyhow::Result<Document> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.run(input, ctx)
    }
}

struct FailingAuditor;

impl StageAgent<Document, AuditReport> for FailingAuditor {
    fn name(&self) -> &str {
        "failing_auditor"
    }

    fn run(&self, _input: Document, _ctx: &StageContext) -> anyhow::Result<AuditReport> {
        Err(anyhow!("rules service unavailable"))
    }
}

/// Auditor that takes a noticeable amount of time.
struct SlowAuditor(RuleAuditor);

impl StageAgent<Document, AuditReport> for SlowAuditor {
    fn name(&self) -> &str {
        "slow_auditor"
    }

    fn run(&self, input: Document, ctx: &StageContext) -> anyhow::Result<AuditReport> {
        std::thread::sleep(Duration::from_millis(60));
        self.0.run(input, ctx)
    }
}

/// Auditor that holds every document except `fast` for a while.
struct LaggingAuditor {
    fast: &'static str,
    delay: Duration,
}

impl StageAgent<Document, AuditReport> for LaggingAuditor {
    fn name(&self) -> &str {
        "lagging_auditor"
    }

    fn run(&self, input: Document, ctx: &StageContext) -> anyhow::Result<AuditReport> {
        if ctx.document_id != self.fast {
            std::thread::sleep(self.delay);
        }
        RuleAuditor::default().run(input, ctx)
    }
}

fn orchestrator(agents: AgentSet, limits: BudgetLimits) -> Orchestrator {
    Orchestrator::new(
        agents,
        BudgetManager::new(limits).shared(),
        SharedBlackboard::new().shared(),
    )
    .with_workers(2)
}

#[tokio::test]
async fn test_concurrent_batch_yields_one_insight_per_document() {
    let orchestrator = orchestrator(AgentSet::reference(), BudgetLimits::unlimited()).shared();
    let inputs = ["nf-1", "nf-2", "nf-3"]
        .into_iter()
        .map(|id| DocumentInput::new(id, INVOICE))
        .collect();

    let BatchOutcome::Completed { documents } = orchestrator.run_batch(inputs).await else {
        panic!("batch should not fall back");
    };
    let ids: Vec<&str> = documents.iter().map(|d| d.document_id.as_str()).collect();
    assert_eq!(ids, ["nf-1", "nf-2", "nf-3"]);
    assert!(documents.iter().all(|d| d.result.is_ok()));

    let blackboard = orchestrator.blackboard();
    let snapshot = blackboard.snapshot();
    for id in ["nf-1", "nf-2", "nf-3"] {
        assert_eq!(snapshot.insights_for(id), 1);
    }
    let run_ids: BTreeSet<_> = snapshot
        .insights
        .iter()
        .filter_map(|e| e.correlation_id.clone())
        .collect();
    assert_eq!(run_ids.len(), 3);
    // One batch scope closed; the orchestrator board stays open.
    assert_eq!(blackboard.closed_scopes(), 1);
    assert!(!blackboard.is_finalized());
}

#[tokio::test]
async fn test_live_subscriber_follows_whole_batch() {
    let agents = AgentSet::reference().with_auditor(Arc::new(LaggingAuditor {
        fast: "nf-1",
        delay: Duration::from_millis(200),
    }));
    let orchestrator = orchestrator(agents, BudgetLimits::unlimited())
        .with_workers(4)
        .shared();

    let batch_board = orchestrator.blackboard().scope();
    let mut subscription = batch_board.subscribe();
    let drain = tokio::spawn(async move {
        let mut insights = Vec::new();
        while let Some(envelope) = subscription.recv().await {
            if envelope.kind() == MessageKind::Insight {
                insights.push(envelope.document_id().to_string());
            }
        }
        insights
    });
    let waiter = {
        let batch_board = Arc::clone(&batch_board);
        tokio::spawn(async move {
            batch_board.wait_finalized().await;
            batch_board.snapshot().insights.len()
        })
    };

    let inputs = ["nf-1", "nf-2", "nf-3"]
        .into_iter()
        .map(|id| DocumentInput::new(id, INVOICE))
        .collect();
    let outcome = orchestrator
        .run_batch_on(inputs, Arc::clone(&batch_board))
        .await;
    assert!(!outcome.is_fallback());

    let mut insights = tokio::time::timeout(Duration::from_secs(5), drain)
        .await
        .expect("subscriber should be released")
        .unwrap();
    insights.sort();
    assert_eq!(insights, ["nf-1", "nf-2", "nf-3"]);
    // Finalized only after every document published its insight.
    assert_eq!(waiter.await.unwrap(), 3);

    // Once per document run, and the batch scope itself once.
    assert_eq!(batch_board.closed_scopes(), 3);
    assert_eq!(batch_board.finalize_count(), 1);

    // A later run on the same orchestrator is observable too.
    let run_board = orchestrator.blackboard().scope();
    let mut late = run_board.subscribe();
    orchestrator
        .run_on(DocumentInput::new("nf-4", INVOICE), Arc::clone(&run_board))
        .await
        .unwrap();
    let mut stages = Vec::new();
    while let Some(envelope) = late.recv().await {
        stages.push(envelope.stage().to_string());
    }
    assert_eq!(stages.len(), 6);
    assert_eq!(stages.last().map(String::as_str), Some("insight"));
}

#[tokio::test]
async fn test_preflight_fallback_runs_no_agent() {
    let extractor = Arc::new(CountingExtractor::default());
    let agents = AgentSet::reference().with_extractor(extractor.clone());
    let orchestrator = orchestrator(agents, BudgetLimits::new(50)).shared();

    let inputs = vec![
        DocumentInput::new("nf-1", INVOICE).with_metadata("token_estimate", 1_000),
        DocumentInput::new("nf-2", INVOICE).with_metadata("token_estimate", 1_000),
    ];
    let outcome = orchestrator.run_batch(inputs).await;

    let BatchOutcome::Fallback {
        documents,
        violations,
        ..
    } = &outcome
    else {
        panic!("expected a fallback");
    };
    assert_eq!(documents, &["nf-1".to_string(), "nf-2".to_string()]);
    assert!(!violations.is_empty());
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(orchestrator.budget().remaining_total(), Some(50));
    assert!(orchestrator.blackboard().history().is_empty());

    let report = serde_json::to_value(outcome.report()).unwrap();
    assert_eq!(report["outcome"], "fallback");
}

#[tokio::test]
async fn test_failing_stage_still_finalizes_subscribers() {
    let agents = AgentSet::reference().with_auditor(Arc::new(FailingAuditor));
    let orchestrator = orchestrator(agents, BudgetLimits::unlimited());

    let board = orchestrator.blackboard().scope();
    let mut subscription = board.subscribe();
    let drain = tokio::spawn(async move {
        let mut kinds = Vec::new();
        while let Some(envelope) = subscription.recv().await {
            kinds.push(envelope.kind());
        }
        kinds
    });

    let err = orchestrator
        .run_on(DocumentInput::new("nf-1", INVOICE), Arc::clone(&board))
        .await
        .unwrap_err();
    match &err {
        PipelineError::Agent { stage, agent, .. } => {
            assert_eq!(*stage, Stage::Audit);
            assert_eq!(agent, "auditor");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("rules service unavailable"));

    let kinds = tokio::time::timeout(Duration::from_secs(5), drain)
        .await
        .expect("subscriber should be released")
        .unwrap();
    assert_eq!(kinds, [MessageKind::Raw]);
    assert_eq!(board.finalize_count(), 1);
    assert_eq!(orchestrator.blackboard().closed_scopes(), 1);
    assert!(orchestrator.blackboard().snapshot().insights.is_empty());
}

#[tokio::test]
async fn test_zero_totals_are_repaired_and_republished() {
    let orchestrator = orchestrator(AgentSet::reference(), BudgetLimits::unlimited());
    // No declared totals: the extracted grand total is zero.
    let content = "cfop: 5102\nCaneta azul | 10 | 2,50\nCaderno | 2 | 15,00\n";

    let result = orchestrator
        .run(DocumentInput::new("nf-zero", content))
        .await
        .unwrap();

    assert!(result.repaired);
    let totals = result.accounting.totals.unwrap();
    assert!((totals.items_total - 55.0).abs() < 1e-9);
    assert!((totals.grand_total - 55.0).abs() < 1e-9);
    assert!((result.document.totals.grand_total - 55.0).abs() < 1e-9);
    assert!(result
        .cross_validation
        .findings
        .iter()
        .all(|f| f.code != "GRAND_TOTAL_MISMATCH"));

    let snapshot = orchestrator.blackboard().snapshot();
    let accounting: Vec<_> = snapshot
        .summaries
        .iter()
        .filter(|e| e.payload.stage == "accounting")
        .collect();
    assert_eq!(accounting.len(), 2);
    assert!(accounting[0].payload.extra.get("repaired").is_none());
    assert_eq!(accounting[1].payload.extra["repaired"], true);
    assert_eq!(accounting[1].payload.extra["totals"]["grand_total"], 55.0);
}

#[tokio::test]
async fn test_guard_raises_timeout_of_slow_agent() {
    let config = PipelineConfig::from_toml(
        r#"
        default_timeout_ms = 1000

        [guard]
        max_timeout_ms = 5000
        timeout_step_ms = 500

        [guard.thresholds.default]
        latency_ms = 20.0
        "#,
    )
    .unwrap();
    let agents = AgentSet::reference().with_auditor(Arc::new(SlowAuditor(RuleAuditor::default())));
    let runtime = PipelineRuntime::from_config(&config, agents).unwrap();

    runtime
        .orchestrator
        .run(DocumentInput::new("nf-1", INVOICE))
        .await
        .unwrap();
    assert_eq!(runtime.controls.get("auditor").timeout_ms, 1_500);

    runtime
        .orchestrator
        .run(DocumentInput::new("nf-2", INVOICE))
        .await
        .unwrap();
    assert_eq!(runtime.controls.get("auditor").timeout_ms, 2_000);

    let export = runtime.metrics.export_payload();
    assert!(export.adjustments.contains_key("auditor"));
    assert!(runtime.progress.is_complete("nf-2"));
}
