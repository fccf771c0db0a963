use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::source::SourceName;
use crate::filter::FilteringStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Paused,
    Succeeded,
    Failed,
}

/// Per-source run state. The store enforces at most one active run per
/// source; the checkpoint payload is the resume contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub source: SourceName,
    pub status: RunStatus,
    #[serde(default)]
    pub current_chunk: u64,
    #[serde(default)]
    pub items_processed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ProgressRecord {
    pub fn idle(source: SourceName) -> Self {
        Self {
            source,
            status: RunStatus::Idle,
            current_chunk: 0,
            items_processed: 0,
            items_total: None,
            checkpoint: None,
            error: None,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

}

/// Terminal summary for one source run. Partial success is the common case
/// and is not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub source: SourceName,
    pub successful: u64,
    pub failed: u64,
    pub skipped: u64,
    #[serde(default)]
    pub sample_failed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filtering: Option<FilteringStats>,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn empty(source: SourceName) -> Self {
        Self {
            source,
            successful: 0,
            failed: 0,
            skipped: 0,
            sample_failed: Vec::new(),
            skipped_reason: None,
            error: None,
            filtering: None,
            duration_ms: 0,
        }
    }
}

impl RunSummary {
    pub fn success_rate(&self) -> f64 {
        let attempted = self.successful + self.failed;
        if attempted == 0 {
            return 1.0;
        }
        self.successful as f64 / attempted as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_handles_empty_runs() {
        let summary = RunSummary::empty(SourceName::Hgnc);
        assert!((summary.success_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn success_rate_counts_only_attempted_genes() {
        let summary = RunSummary {
            successful: 3,
            failed: 1,
            skipped: 10,
            sample_failed: vec!["PKD1".to_string()],
            duration_ms: 1500,
            ..RunSummary::empty(SourceName::Gnomad)
        };
        assert!((summary.success_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn idle_records_start_with_empty_counters() {
        let record = ProgressRecord::idle(SourceName::Pubtator);
        assert_eq!(record.status, RunStatus::Idle);
        assert_eq!(record.items_processed, 0);
        assert!(record.checkpoint.is_none());
    }
}
