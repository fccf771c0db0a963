use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::entities::{
    Gene, GeneAnnotation, GeneDraft, GeneEvidence, GeneId, GeneSummaryRow, ProgressRecord,
    RunStatus, SourceName, StagingCandidate, StagingRecord, StagingStatus,
};
use crate::error::IngestError;

use super::{
    AnnotationStore, EvidenceStore, GeneStore, ProgressStore, StagingStore, SummaryStore,
};

#[derive(Default)]
struct Inner {
    genes: HashMap<GeneId, Gene>,
    next_gene_id: u64,
    evidence: HashMap<(GeneId, SourceName, String), GeneEvidence>,
    annotations: HashMap<(GeneId, SourceName), GeneAnnotation>,
    staging: HashMap<u64, StagingRecord>,
    next_staging_id: u64,
    progress: HashMap<SourceName, ProgressRecord>,
    summary: Vec<GeneSummaryRow>,
}

/// In-memory store for tests and single-process runs. All methods take the
/// single lock briefly; there is no I/O under the lock.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn symbol_key(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

#[async_trait]
impl GeneStore for MemoryStore {
    async fn find_by_symbols(&self, symbols: &[String]) -> Result<Vec<Gene>, IngestError> {
        let wanted: Vec<String> = symbols.iter().map(|s| symbol_key(s)).collect();
        let inner = self.inner.read().await;
        let mut out: Vec<Gene> = Vec::new();
        for gene in inner.genes.values().filter(|g| g.active) {
            if wanted.iter().any(|w| gene.matches_symbol(w)) {
                out.push(gene.clone());
            }
        }
        out.sort_by_key(|g| g.id);
        Ok(out)
    }

    async fn find_by_hgnc_id(&self, hgnc_id: &str) -> Result<Option<Gene>, IngestError> {
        let inner = self.inner.read().await;
        Ok(inner
            .genes
            .values()
            .find(|g| g.hgnc_id == hgnc_id)
            .cloned())
    }

    async fn upsert_gene(&self, draft: GeneDraft) -> Result<Gene, IngestError> {
        let mut inner = self.inner.write().await;

        // Alias collisions across distinct genes route to staging instead
        // of silently re-pointing an existing symbol.
        for candidate in draft
            .aliases
            .iter()
            .chain(std::iter::once(&draft.approved_symbol))
        {
            let clash = inner
                .genes
                .values()
                .find(|g| g.hgnc_id != draft.hgnc_id && g.active && g.matches_symbol(candidate));
            if let Some(existing) = clash {
                return Err(IngestError::StagingConflict {
                    raw: candidate.clone(),
                    reason: format!(
                        "symbol already belongs to {} ({})",
                        existing.approved_symbol, existing.hgnc_id
                    ),
                });
            }
        }

        if let Some(existing) = inner
            .genes
            .values_mut()
            .find(|g| g.hgnc_id == draft.hgnc_id)
        {
            if existing.ensembl_gene_id.is_none() {
                existing.ensembl_gene_id = draft.ensembl_gene_id;
            }
            if existing.ncbi_gene_id.is_none() {
                existing.ncbi_gene_id = draft.ncbi_gene_id;
            }
            if existing.location.is_none() {
                existing.location = draft.location;
            }
            existing.aliases.extend(draft.aliases);
            return Ok(existing.clone());
        }

        inner.next_gene_id += 1;
        let id = GeneId(inner.next_gene_id);
        let mut gene = Gene::new(id, draft.approved_symbol, draft.hgnc_id);
        gene.ensembl_gene_id = draft.ensembl_gene_id;
        gene.ncbi_gene_id = draft.ncbi_gene_id;
        gene.location = draft.location;
        gene.aliases.extend(draft.aliases);
        inner.genes.insert(id, gene.clone());
        Ok(gene)
    }

    async fn all_active_genes(&self) -> Result<Vec<Gene>, IngestError> {
        let inner = self.inner.read().await;
        let mut out: Vec<Gene> = inner.genes.values().filter(|g| g.active).cloned().collect();
        out.sort_by_key(|g| g.id);
        Ok(out)
    }

    async fn get_gene(&self, id: GeneId) -> Result<Option<Gene>, IngestError> {
        let inner = self.inner.read().await;
        Ok(inner.genes.get(&id).cloned())
    }
}

#[async_trait]
impl EvidenceStore for MemoryStore {
    async fn upsert_evidence(&self, evidence: GeneEvidence) -> Result<(), IngestError> {
        match evidence.count() {
            Some(count) if count > 0 => {}
            _ => {
                return Err(IngestError::InvalidArgument(format!(
                    "evidence for '{}' from {} has a missing or zero count field",
                    evidence.identifier, evidence.source
                )));
            }
        }

        let mut inner = self.inner.write().await;
        let key = (
            evidence.gene_id,
            evidence.source,
            evidence.identifier.clone(),
        );
        match inner.evidence.get_mut(&key) {
            Some(existing) if !existing.deleted => {
                existing.merge_payload(&evidence.evidence_data);
                existing.recorded_at = evidence.recorded_at;
            }
            _ => {
                inner.evidence.insert(key, evidence);
            }
        }
        Ok(())
    }

    async fn count_evidence(&self, source: SourceName) -> Result<u64, IngestError> {
        let inner = self.inner.read().await;
        Ok(inner
            .evidence
            .values()
            .filter(|e| e.source == source && !e.deleted)
            .count() as u64)
    }

    async fn delete_evidence_below_threshold(
        &self,
        source: SourceName,
        count_field: &str,
        threshold: u64,
    ) -> Result<Vec<String>, IngestError> {
        let mut inner = self.inner.write().await;
        let victims: Vec<(GeneId, SourceName, String)> = inner
            .evidence
            .iter()
            .filter(|(_, e)| {
                e.source == source
                    && !e.deleted
                    && e.evidence_data
                        .get(count_field)
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0)
                        < threshold
            })
            .map(|(key, _)| key.clone())
            .collect();

        let mut identifiers: Vec<String> = victims.iter().map(|(_, _, id)| id.clone()).collect();
        identifiers.sort();
        for key in victims {
            inner.evidence.remove(&key);
        }
        Ok(identifiers)
    }

    async fn soft_delete_provider_evidence(
        &self,
        source: SourceName,
        provider: &str,
    ) -> Result<u64, IngestError> {
        let mut inner = self.inner.write().await;
        let mut deleted = 0u64;
        for evidence in inner.evidence.values_mut() {
            if evidence.source == source
                && !evidence.deleted
                && evidence.provenance.provider.as_deref() == Some(provider)
            {
                evidence.deleted = true;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn evidence_for_source(
        &self,
        source: SourceName,
    ) -> Result<Vec<GeneEvidence>, IngestError> {
        let inner = self.inner.read().await;
        let mut out: Vec<GeneEvidence> = inner
            .evidence
            .values()
            .filter(|e| e.source == source && !e.deleted)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(out)
    }

    async fn evidence_for_gene(&self, gene_id: GeneId) -> Result<Vec<GeneEvidence>, IngestError> {
        let inner = self.inner.read().await;
        let mut out: Vec<GeneEvidence> = inner
            .evidence
            .values()
            .filter(|e| e.gene_id == gene_id && !e.deleted)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.source);
        Ok(out)
    }
}

#[async_trait]
impl AnnotationStore for MemoryStore {
    async fn write_annotation(&self, annotation: GeneAnnotation) -> Result<(), IngestError> {
        let mut inner = self.inner.write().await;
        inner
            .annotations
            .insert((annotation.gene_id, annotation.source), annotation);
        Ok(())
    }

    async fn get_annotation(
        &self,
        gene_id: GeneId,
        source: SourceName,
    ) -> Result<Option<GeneAnnotation>, IngestError> {
        let inner = self.inner.read().await;
        Ok(inner.annotations.get(&(gene_id, source)).cloned())
    }

    async fn annotated_gene_ids(&self, source: SourceName) -> Result<Vec<GeneId>, IngestError> {
        let inner = self.inner.read().await;
        let mut out: Vec<GeneId> = inner
            .annotations
            .keys()
            .filter(|(_, s)| *s == source)
            .map(|(gene_id, _)| *gene_id)
            .collect();
        out.sort();
        Ok(out)
    }
}

#[async_trait]
impl StagingStore for MemoryStore {
    async fn add_staging(
        &self,
        raw_text: &str,
        source_hint: SourceName,
        candidates: Vec<StagingCandidate>,
    ) -> Result<StagingRecord, IngestError> {
        let mut inner = self.inner.write().await;

        // Re-staging the same raw text from the same source just refreshes
        // the candidate list of the pending record.
        let existing = inner.staging.values().find(|r| {
            r.raw_text == raw_text
                && r.source_hint == source_hint
                && r.status == StagingStatus::Pending
        });
        if let Some(existing) = existing {
            let id = existing.id;
            let record = StagingRecord {
                id,
                created_at: existing.created_at,
                ..StagingRecord::pending(id, raw_text, source_hint, candidates)
            };
            inner.staging.insert(id, record.clone());
            return Ok(record);
        }

        inner.next_staging_id += 1;
        let record = StagingRecord::pending(inner.next_staging_id, raw_text, source_hint, candidates);
        inner.staging.insert(record.id, record.clone());
        Ok(record)
    }

    async fn pending_staging(&self) -> Result<Vec<StagingRecord>, IngestError> {
        let inner = self.inner.read().await;
        let mut out: Vec<StagingRecord> = inner
            .staging
            .values()
            .filter(|r| r.status == StagingStatus::Pending)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    async fn resolve_staging(
        &self,
        id: u64,
        status: StagingStatus,
        reviewer: Option<String>,
        reason: Option<String>,
    ) -> Result<StagingRecord, IngestError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .staging
            .get_mut(&id)
            .ok_or_else(|| IngestError::Store(format!("no staging record with id {id}")))?;
        record.status = status;
        record.reviewer = reviewer;
        record.reason = reason;
        Ok(record.clone())
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn begin_run(&self, source: SourceName) -> Result<ProgressRecord, IngestError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .progress
            .entry(source)
            .or_insert_with(|| ProgressRecord::idle(source));

        if record.status == RunStatus::Running {
            return Err(IngestError::Store(format!(
                "a run for {source} is already active"
            )));
        }

        record.status = RunStatus::Running;
        record.error = None;
        record.updated_at = OffsetDateTime::now_utc();
        Ok(record.clone())
    }

    async fn put_progress(&self, record: ProgressRecord) -> Result<(), IngestError> {
        let mut inner = self.inner.write().await;
        inner.progress.insert(record.source, record);
        Ok(())
    }

    async fn get_progress(&self, source: SourceName) -> Result<ProgressRecord, IngestError> {
        let inner = self.inner.read().await;
        Ok(inner
            .progress
            .get(&source)
            .cloned()
            .unwrap_or_else(|| ProgressRecord::idle(source)))
    }

    async fn all_progress(&self) -> Result<Vec<ProgressRecord>, IngestError> {
        let inner = self.inner.read().await;
        let mut out: Vec<ProgressRecord> = inner.progress.values().cloned().collect();
        out.sort_by_key(|r| r.source);
        Ok(out)
    }
}

#[async_trait]
impl SummaryStore for MemoryStore {
    async fn replace_summary(&self, rows: Vec<GeneSummaryRow>) -> Result<(), IngestError> {
        let mut inner = self.inner.write().await;
        inner.summary = rows;
        Ok(())
    }

    async fn summary(&self) -> Result<Vec<GeneSummaryRow>, IngestError> {
        let inner = self.inner.read().await;
        Ok(inner.summary.clone())
    }
}
