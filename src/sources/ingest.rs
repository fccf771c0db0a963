//! The ingestion template shared by every evidence source:
//! fetch → parse → kidney filter → normalize → write evidence → merge →
//! threshold filter.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SourceConfig;
use crate::entities::{EvidenceProvenance, GeneEvidence, SourceName};
use crate::error::IngestError;
use crate::filter::FilteringStats;
use crate::normalize::{GeneNormalizer, Resolution};
use crate::store::{EvidenceStore, Store};

/// Shared run context handed to each ingester.
pub(crate) struct IngestContext<'a> {
    pub store: &'a dyn Store,
    pub normalizer: &'a GeneNormalizer,
    pub config: &'a SourceConfig,
    /// Cooperative pause: checked at chunk boundaries; the current chunk
    /// always completes.
    pub pause: CancellationToken,
}

#[derive(Debug, Clone)]
pub(crate) struct IngestReport {
    pub source: SourceName,
    pub genes_resolved: u64,
    pub genes_staged: u64,
    pub genes_rejected: u64,
    pub evidence_written: u64,
    pub filtering: Option<FilteringStats>,
}

impl IngestReport {
    pub(crate) fn new(source: SourceName) -> Self {
        Self {
            source,
            genes_resolved: 0,
            genes_staged: 0,
            genes_rejected: 0,
            evidence_written: 0,
            filtering: None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum IngestRun {
    Completed(IngestReport),
    /// Paused at a chunk boundary; the progress record carries the
    /// checkpoint to resume from.
    Paused(IngestReport),
}

#[async_trait]
pub(crate) trait DataSource: Send + Sync {
    fn source_name(&self) -> SourceName;

    async fn ingest(&self, ctx: &IngestContext<'_>) -> Result<IngestRun, IngestError>;
}

/// Normalizes a parsed `symbol → payload` map and writes evidence rows for
/// the resolved genes. Staged and rejected mentions are counted but never
/// block the run.
pub(crate) async fn write_evidence_batch(
    ctx: &IngestContext<'_>,
    source: SourceName,
    records: &HashMap<String, serde_json::Value>,
    provenance: &EvidenceProvenance,
    report: &mut IngestReport,
) -> Result<(), IngestError> {
    if records.is_empty() {
        return Ok(());
    }

    let mentions: Vec<String> = records.keys().cloned().collect();
    let resolutions = ctx
        .normalizer
        .normalize_batch(ctx.store, source, &mentions)
        .await?;

    for (symbol, payload) in records {
        match resolutions.get(symbol) {
            Some(Resolution::Resolved { gene }) => {
                let mut evidence =
                    GeneEvidence::new(gene.id, source, symbol.clone(), payload.clone());
                evidence.provenance = provenance.clone();
                match ctx.store.upsert_evidence(evidence).await {
                    Ok(()) => {
                        report.genes_resolved += 1;
                        report.evidence_written += 1;
                    }
                    Err(IngestError::InvalidArgument(reason)) => {
                        // Zero-count rows are dropped, not fatal.
                        debug!(
                            source = source.as_str(),
                            symbol = symbol.as_str(),
                            reason = reason.as_str(),
                            "Skipping evidence row"
                        );
                        report.genes_rejected += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
            Some(Resolution::Staged { staging_id }) => {
                debug!(
                    source = source.as_str(),
                    symbol = symbol.as_str(),
                    staging_id,
                    "Mention staged for review"
                );
                report.genes_staged += 1;
            }
            Some(Resolution::Rejected { reason }) => {
                debug!(
                    source = source.as_str(),
                    symbol = symbol.as_str(),
                    reason = reason.as_str(),
                    "Mention rejected"
                );
                report.genes_rejected += 1;
            }
            None => report.genes_rejected += 1,
        }
    }

    info!(
        source = source.as_str(),
        resolved = report.genes_resolved,
        staged = report.genes_staged,
        rejected = report.genes_rejected,
        "Evidence batch written"
    );
    Ok(())
}
