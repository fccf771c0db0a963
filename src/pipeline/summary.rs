use std::collections::BTreeMap;

use time::OffsetDateTime;
use tracing::info;

use crate::entities::{GeneSummaryRow, SourceName};
use crate::error::IngestError;
use crate::store::{AnnotationStore, EvidenceStore, GeneStore, Store, SummaryStore};

/// Rebuilds the materialized per-gene summary and replaces it atomically.
/// Called exactly once per pipeline run, after every source has finished;
/// refreshing per source would both tear the snapshot and multiply the
/// store load by the source count.
pub(crate) async fn refresh_summary(store: &dyn Store) -> Result<usize, IngestError> {
    let genes = store.all_active_genes().await?;
    let refreshed_at = OffsetDateTime::now_utc();

    let mut rows = Vec::with_capacity(genes.len());
    for gene in genes {
        let mut evidence_counts: BTreeMap<SourceName, u64> = BTreeMap::new();
        for evidence in store.evidence_for_gene(gene.id).await? {
            if let Some(count) = evidence.count() {
                let entry = evidence_counts.entry(evidence.source).or_insert(0);
                *entry = (*entry).max(count);
            }
        }

        let mut annotation_sources = Vec::new();
        for source in SourceName::ALL.iter().filter(|s| s.is_annotation()) {
            if store.get_annotation(gene.id, *source).await?.is_some() {
                annotation_sources.push(*source);
            }
        }

        // Genes with no surviving evidence still appear in the summary:
        // annotations may exist and the scorer decides what a zero means.
        rows.push(GeneSummaryRow {
            gene_id: gene.id,
            approved_symbol: gene.approved_symbol,
            hgnc_id: gene.hgnc_id,
            evidence_counts,
            annotation_sources,
            refreshed_at,
        });
    }

    let count = rows.len();
    store.replace_summary(rows).await?;
    info!(genes = count, "Summary projection refreshed");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{GeneAnnotation, GeneDraft, GeneEvidence};
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn summary_combines_counts_across_sources() {
        let store = MemoryStore::new();
        let gene = store
            .upsert_gene(GeneDraft {
                approved_symbol: "PKD1".into(),
                hgnc_id: "HGNC:9008".into(),
                ..Default::default()
            })
            .await
            .expect("gene");

        store
            .upsert_evidence(GeneEvidence::new(
                gene.id,
                SourceName::Pubtator,
                "PKD1",
                json!({"publication_count": 120, "pmids": []}),
            ))
            .await
            .expect("pubtator evidence");
        store
            .upsert_evidence(GeneEvidence::new(
                gene.id,
                SourceName::PanelappUk,
                "PKD1",
                json!({"panel_count": 4, "panels": []}),
            ))
            .await
            .expect("panel evidence");
        store
            .write_annotation(GeneAnnotation::new(
                gene.id,
                SourceName::Gnomad,
                json!({"pli": 1.0}),
                30,
            ))
            .await
            .expect("annotation");

        let count = refresh_summary(&store).await.expect("refresh");
        assert_eq!(count, 1);

        let summary = store.summary().await.expect("summary");
        assert_eq!(summary.len(), 1);
        let row = &summary[0];
        assert_eq!(row.evidence_counts[&SourceName::Pubtator], 120);
        assert_eq!(row.evidence_counts[&SourceName::PanelappUk], 4);
        assert_eq!(row.source_count(), 2);
        assert_eq!(row.annotation_sources, vec![SourceName::Gnomad]);
    }

    #[tokio::test]
    async fn refresh_replaces_the_previous_projection() {
        let store = MemoryStore::new();
        store
            .upsert_gene(GeneDraft {
                approved_symbol: "UMOD".into(),
                hgnc_id: "HGNC:12559".into(),
                ..Default::default()
            })
            .await
            .expect("gene");

        refresh_summary(&store).await.expect("first refresh");
        refresh_summary(&store).await.expect("second refresh");
        assert_eq!(store.summary().await.expect("summary").len(), 1);
    }
}
