use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::gene::GeneId;
use super::source::SourceName;

/// Materialized per-gene projection combining evidence counts across
/// sources. Refreshed exactly once per pipeline run; consumed by the
/// external scoring layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneSummaryRow {
    pub gene_id: GeneId,
    pub approved_symbol: String,
    pub hgnc_id: String,
    #[serde(default)]
    pub evidence_counts: BTreeMap<SourceName, u64>,
    #[serde(default)]
    pub annotation_sources: Vec<SourceName>,
    #[serde(with = "time::serde::rfc3339")]
    pub refreshed_at: OffsetDateTime,
}

impl GeneSummaryRow {
    pub fn source_count(&self) -> usize {
        self.evidence_counts.len()
    }
}
