//! Rolling per-agent execution statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Metadata;

/// One finished agent execution as observed by a hook.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSample {
    pub duration_ms: f64,
    pub success: bool,
    pub retries: u32,
    pub metadata: Metadata,
}

impl ExecutionSample {
    pub fn success(duration_ms: f64) -> Self {
        Self {
            duration_ms,
            success: true,
            retries: 0,
            metadata: Metadata::new(),
        }
    }

    pub fn failure(duration_ms: f64) -> Self {
        Self {
            success: false,
            ..Self::success(duration_ms)
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The agent's configured timeout at execution time, if reported.
    pub fn timeout_ms(&self) -> Option<u64> {
        match self.metadata.get("timeout_ms")? {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Aggregated metrics for one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSummary {
    pub agent: String,
    pub total_latency_ms: f64,
    pub executions: u64,
    pub successes: u64,
    pub errors: u64,
    pub throughput: u64,
    /// High-water mark of retries seen in any single execution.
    pub retries: u32,
    pub last_latency_ms: Option<f64>,
    pub last_updated: DateTime<Utc>,
    pub metadata: Metadata,
}

impl MetricSummary {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            total_latency_ms: 0.0,
            executions: 0,
            successes: 0,
            errors: 0,
            throughput: 0,
            retries: 0,
            last_latency_ms: None,
            last_updated: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    pub fn record(&mut self, sample: &ExecutionSample) {
        self.total_latency_ms += sample.duration_ms;
        self.executions += 1;
        self.throughput += 1;
        if sample.success {
            self.successes += 1;
        } else {
            self.errors += 1;
        }
        self.retries = self.retries.max(sample.retries);
        self.last_latency_ms = Some(sample.duration_ms);
        self.last_updated = Utc::now();
        for (key, value) in &sample.metadata {
            self.metadata.insert(key.clone(), normalize(value));
        }
    }

    /// `None` until the first execution is recorded.
    pub fn average_latency_ms(&self) -> Option<f64> {
        if self.executions == 0 {
            return None;
        }
        Some(self.total_latency_ms / self.executions as f64)
    }

    pub fn error_rate(&self) -> f64 {
        let completed = self.successes + self.errors;
        if completed == 0 {
            return 0.0;
        }
        self.errors as f64 / completed as f64
    }

    pub fn to_report(&self) -> MetricReport {
        MetricReport {
            agent: self.agent.clone(),
            average_latency_ms: self.average_latency_ms(),
            last_latency_ms: self.last_latency_ms,
            throughput: self.throughput,
            executions: self.executions,
            successes: self.successes,
            errors: self.errors,
            error_rate: self.error_rate(),
            retries: self.retries,
            last_updated: self.last_updated,
            metadata: self.metadata.clone(),
        }
    }
}

/// Serializable view of a [`MetricSummary`] including derived values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReport {
    pub agent: String,
    pub average_latency_ms: Option<f64>,
    pub last_latency_ms: Option<f64>,
    pub throughput: u64,
    pub executions: u64,
    pub successes: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub retries: u32,
    pub last_updated: DateTime<Utc>,
    pub metadata: Metadata,
}

// Metadata is kept scalar so reports stay flat.
fn normalize(value: &Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_summary_derivations() {
        let summary = MetricSummary::new("auditor");
        assert_eq!(summary.average_latency_ms(), None);
        assert_eq!(summary.error_rate(), 0.0);
    }

    #[test]
    fn test_record_accumulates() {
        let mut summary = MetricSummary::new("auditor");
        summary.record(&ExecutionSample::success(100.0).with_retries(2));
        summary.record(&ExecutionSample::failure(300.0).with_retries(1));

        assert_eq!(summary.executions, 2);
        assert_eq!(summary.throughput, 2);
        assert_eq!(summary.successes, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.average_latency_ms(), Some(200.0));
        assert_eq!(summary.error_rate(), 0.5);
        assert_eq!(summary.retries, 2, "retries is a high-water mark");
        assert_eq!(summary.last_latency_ms, Some(300.0));
    }

    #[test]
    fn test_metadata_is_normalized() {
        let mut summary = MetricSummary::new("a");
        summary.record(
            &ExecutionSample::success(1.0)
                .with_metadata("timeout_ms", 2000)
                .with_metadata("tags", json!(["x", "y"])),
        );

        assert_eq!(summary.metadata["timeout_ms"], json!(2000));
        assert_eq!(summary.metadata["tags"], json!("[\"x\",\"y\"]"));
    }

    #[test]
    fn test_timeout_from_metadata() {
        assert_eq!(
            ExecutionSample::success(1.0).with_metadata("timeout_ms", 2000).timeout_ms(),
            Some(2000)
        );
        assert_eq!(
            ExecutionSample::success(1.0).with_metadata("timeout_ms", "1500").timeout_ms(),
            Some(1500)
        );
        assert_eq!(
            ExecutionSample::success(1.0).with_metadata("timeout_ms", true).timeout_ms(),
            None
        );
        assert_eq!(ExecutionSample::success(1.0).timeout_ms(), None);
    }

    #[test]
    fn test_report_serializes_derived_fields() {
        let mut summary = MetricSummary::new("classifier");
        summary.record(&ExecutionSample::success(50.0));
        let value = serde_json::to_value(summary.to_report()).unwrap();

        assert_eq!(value["agent"], "classifier");
        assert_eq!(value["average_latency_ms"], 50.0);
        assert_eq!(value["error_rate"], 0.0);
    }
}
