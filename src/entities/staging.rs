use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::source::SourceName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingStatus {
    Pending,
    Approved,
    Rejected,
    AutoResolved,
}

/// One ranked resolution candidate for a staged mention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingCandidate {
    pub approved_symbol: String,
    pub hgnc_id: String,
    pub confidence: f64,
    /// "approved", "previous" or "alias" — how the candidate matched.
    pub match_kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chromosome: Option<String>,
}

/// Unresolved raw gene mention waiting for human review. Pending records
/// never block pipeline progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingRecord {
    pub id: u64,
    pub raw_text: String,
    pub source_hint: SourceName,
    pub candidates: Vec<StagingCandidate>,
    pub status: StagingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl StagingRecord {
    pub fn pending(
        id: u64,
        raw_text: impl Into<String>,
        source_hint: SourceName,
        mut candidates: Vec<StagingCandidate>,
    ) -> Self {
        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Self {
            id,
            raw_text: raw_text.into(),
            source_hint,
            candidates,
            status: StagingStatus::Pending,
            reviewer: None,
            reason: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn best_candidate(&self) -> Option<&StagingCandidate> {
        self.candidates.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(symbol: &str, confidence: f64) -> StagingCandidate {
        StagingCandidate {
            approved_symbol: symbol.to_string(),
            hgnc_id: format!("HGNC:{}", symbol.len()),
            confidence,
            match_kind: "alias".to_string(),
            chromosome: None,
        }
    }

    #[test]
    fn pending_ranks_candidates_by_confidence() {
        let record = StagingRecord::pending(
            1,
            "pkd",
            SourceName::Pubtator,
            vec![candidate("PKD2", 0.55), candidate("PKD1", 0.7)],
        );
        assert_eq!(
            record.best_candidate().map(|c| c.approved_symbol.as_str()),
            Some("PKD1")
        );
        assert_eq!(record.status, StagingStatus::Pending);
    }
}
