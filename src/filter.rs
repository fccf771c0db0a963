//! Minimum-threshold evidence filters shared by every ingestion source.
//!
//! Two flavors exist: an in-memory filter for merge-then-filter sources
//! (uploads, curated panels) and a store-level filter for streamed sources
//! (PubTator), where the complete dataset only exists in the store after the
//! last chunk. Both emit the same `FilteringStats` contract.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;

use crate::entities::SourceName;
use crate::error::IngestError;
use crate::store::{EvidenceStore, Store};

const SAMPLE_LIMIT: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilteringStats {
    pub source: SourceName,
    pub entity: String,
    pub threshold: u64,
    pub total_before: u64,
    pub total_after: u64,
    pub filtered_count: u64,
    pub filter_rate: f64,
    #[serde(default)]
    pub sample_filtered: Vec<String>,
    pub duration_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl FilteringStats {
    fn build(
        source: SourceName,
        entity: &str,
        threshold: u64,
        total_before: u64,
        total_after: u64,
        sample_filtered: Vec<String>,
        started: Instant,
    ) -> Self {
        let filtered_count = total_before.saturating_sub(total_after);
        let filter_rate = if total_before == 0 {
            0.0
        } else {
            filtered_count as f64 / total_before as f64
        };

        if filter_rate > 0.5 {
            warn!(
                source = source.as_str(),
                entity,
                threshold,
                filtered = filtered_count,
                total = total_before,
                "Filter removed more than half of the dataset; check source parsing and threshold"
            );
        }

        Self {
            source,
            entity: entity.to_string(),
            threshold,
            total_before,
            total_after,
            filtered_count,
            filter_rate,
            sample_filtered,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

fn count_of(record: &serde_json::Value, count_field: &str) -> u64 {
    record.get(count_field).and_then(|v| v.as_u64()).unwrap_or(0)
}

/// Filters a merged in-memory dataset, removing genes whose count field
/// falls below `threshold`. A threshold of 0 or 1 removes nothing (counts
/// below 1 are never written in the first place) but still emits stats.
pub fn filter_in_memory(
    source: SourceName,
    count_field: &str,
    threshold: u64,
    records: &mut HashMap<String, serde_json::Value>,
    enabled: bool,
) -> FilteringStats {
    let started = Instant::now();
    let total_before = records.len() as u64;

    let mut sample: Vec<String> = Vec::new();
    if enabled && threshold > 1 {
        let mut victims: Vec<String> = records
            .iter()
            .filter(|(_, record)| count_of(record, count_field) < threshold)
            .map(|(symbol, _)| symbol.clone())
            .collect();
        victims.sort();
        for symbol in &victims {
            records.remove(symbol);
        }
        sample = victims.into_iter().take(SAMPLE_LIMIT).collect();
    }

    FilteringStats::build(
        source,
        "gene_evidence",
        threshold,
        total_before,
        records.len() as u64,
        sample,
        started,
    )
}

/// Store-level filter for streamed sources: one delete over the complete
/// dataset, run only after the final chunk has been written.
pub async fn filter_in_store(
    store: &dyn Store,
    source: SourceName,
    threshold: u64,
    enabled: bool,
) -> Result<FilteringStats, IngestError> {
    let started = Instant::now();
    let count_field = source.count_field().ok_or_else(|| {
        IngestError::InvalidArgument(format!(
            "{source} is not an ingestion source and has no count field to filter on"
        ))
    })?;

    let total_before = store.count_evidence(source).await?;
    let victims = if enabled && threshold > 1 {
        store
            .delete_evidence_below_threshold(source, count_field, threshold)
            .await?
    } else {
        Vec::new()
    };
    let total_after = store.count_evidence(source).await?;

    let sample = victims.into_iter().take(SAMPLE_LIMIT).collect();
    Ok(FilteringStats::build(
        source,
        "gene_evidence",
        threshold,
        total_before,
        total_after,
        sample,
        started,
    ))
}
