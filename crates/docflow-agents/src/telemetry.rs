//! Run telemetry.
//!
//! One [`RunRecord`] per document run, appended to a JSONL file so runs can
//! be analyzed offline. Write failures are logged and never fail a run.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::agents::Stage;
use crate::state_machine::TransitionRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Aborted by the budget before or during the run.
    Fallback,
    Failed,
}

/// Timing and cost of one stage call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub agent: String,
    pub latency_ms: f64,
    pub tokens: u64,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub document_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub stages: Vec<StageTiming>,
    pub tokens: u64,
    pub repaired: bool,
    pub transitions: Vec<TransitionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn new(run_id: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            document_id: document_id.into(),
            status: RunStatus::Completed,
            started_at: Utc::now(),
            elapsed_ms: 0,
            stages: Vec::new(),
            tokens: 0,
            repaired: false,
            transitions: Vec::new(),
            error: None,
        }
    }

    pub fn record_stage(&mut self, timing: StageTiming) {
        self.tokens += timing.tokens;
        self.stages.push(timing);
    }

    /// Emit this record as a structured tracing event.
    pub fn emit(&self) {
        info!(
            target: "docflow.telemetry",
            run_id = %self.run_id,
            document_id = %self.document_id,
            status = ?self.status,
            elapsed_ms = self.elapsed_ms,
            tokens = self.tokens,
            stages = self.stages.len(),
            repaired = self.repaired,
            "document_run_complete"
        );
    }
}

/// Append-only JSONL sink. Concurrent runs serialize their writes.
#[derive(Debug)]
pub struct TelemetrySink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TelemetrySink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &RunRecord) {
        let json = match serde_json::to_string(record) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize run record: {e}");
                return;
            }
        };

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{json}") {
                    warn!("Failed to append run telemetry: {e}");
                }
            }
            Err(e) => warn!(path = %self.path.display(), "Failed to open telemetry file: {e}"),
        }
    }

    /// Read every record from a JSONL file. Blank lines are skipped.
    pub fn read_all(path: &Path) -> std::io::Result<Vec<RunRecord>> {
        use std::io::{BufRead, BufReader};

        let file = std::fs::File::open(path)?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            records.push(record);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_stage_accumulates_tokens() {
        let mut record = RunRecord::new("run-1", "nf-1");
        for (stage, tokens) in [(Stage::Extraction, 100), (Stage::Audit, 70)] {
            record.record_stage(StageTiming {
                stage,
                agent: stage.agent().to_string(),
                latency_ms: 1.0,
                tokens,
                success: true,
            });
        }
        assert_eq!(record.tokens, 170);
        assert_eq!(record.stages.len(), 2);
    }

    #[test]
    fn test_append_and_read_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TelemetrySink::new(dir.path().join("runs.jsonl"));

        let mut failed = RunRecord::new("run-2", "nf-2");
        failed.status = RunStatus::Failed;
        failed.error = Some("accountant failed".into());

        sink.append(&RunRecord::new("run-1", "nf-1"));
        sink.append(&failed);

        let records = TelemetrySink::read_all(sink.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, RunStatus::Completed);
        assert_eq!(records[1].error.as_deref(), Some("accountant failed"));

        let raw = std::fs::read_to_string(sink.path()).unwrap();
        assert!(raw.lines().next().unwrap().contains("\"status\":\"completed\""));
    }

    #[test]
    fn test_unwritable_path_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TelemetrySink::new(dir.path().join("missing").join("runs.jsonl"));
        sink.append(&RunRecord::new("run-1", "nf-1"));
        assert!(!sink.path().exists());
    }
}
