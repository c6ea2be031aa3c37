use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coordination::blackboard::BlackboardSnapshot;
use coordination::budget::BudgetLimits;
use coordination::documents::DocumentInput;
use coordination::metrics::MetricsExport;
use coordination::prompt::DocumentPayload;
use docflow_agents::orchestrator::BatchReport;
use docflow_agents::progress::ProgressSnapshot;
use docflow_agents::query::{EchoResponder, LocalEmbedder};
use docflow_agents::{AgentSet, PipelineConfig, PipelineRuntime};
use serde::Serialize;
use tracing::info;

/// Multi-agent fiscal document pipeline
#[derive(Parser, Debug)]
#[command(name = "docflow")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the document pipeline over files
    Run {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Answer a query over files, reusing cached work
    Ask {
        query: String,

        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Skip every cache lookup
        #[arg(long)]
        force_refresh: bool,
    },
}

/// Everything `docflow run` prints.
#[derive(Serialize)]
struct RunOutput<'a> {
    batch: BatchReport<'a>,
    blackboard: BlackboardSnapshot,
    metrics: MetricsExport,
    progress: ProgressSnapshot,
    budget: BudgetLimits,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::load(cli.config.as_deref())?;
    let runtime = PipelineRuntime::from_config(&config, AgentSet::reference())?;

    match cli.command {
        Command::Run { files } => {
            let inputs = files
                .iter()
                .map(|path| read_input(path))
                .collect::<Result<Vec<_>>>()?;
            info!(documents = inputs.len(), "Running pipeline");

            let outcome = runtime.orchestrator.run_batch(inputs).await;
            let output = RunOutput {
                batch: outcome.report(),
                blackboard: runtime.blackboard.snapshot(),
                metrics: runtime.metrics.export_payload(),
                progress: runtime.progress.snapshot(),
                budget: runtime.budget.snapshot(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Ask {
            query,
            files,
            force_refresh,
        } => {
            let documents = files
                .iter()
                .map(|path| {
                    read_input(path)
                        .map(|input| DocumentPayload::new(input.document_id, input.content))
                })
                .collect::<Result<Vec<_>>>()?;
            let controller = runtime
                .query_controller(Arc::new(LocalEmbedder::default()), Arc::new(EchoResponder))?;
            let result = controller.run(&query, &documents, force_refresh).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

fn read_input(path: &Path) -> Result<DocumentInput> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let document_id = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let mut input = DocumentInput::new(document_id, content);
    if let Some(name) = path.file_name() {
        input = input.with_filename(name.to_string_lossy());
    }
    Ok(input)
}
