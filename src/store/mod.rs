//! Persistence contracts. The relational storage engine is an external
//! collaborator; the pipeline only sees these traits. The bundled
//! [`MemoryStore`] backs tests and single-process runs.

use async_trait::async_trait;

use crate::entities::{
    Gene, GeneAnnotation, GeneDraft, GeneEvidence, GeneId, GeneSummaryRow, ProgressRecord,
    SourceName, StagingCandidate, StagingRecord, StagingStatus,
};
use crate::error::IngestError;

mod memory;

pub(crate) use memory::MemoryStore;

/// Canonical gene rows. Owned by the normalizer: evidence and annotation
/// writers only ever link to genes through [`GeneId`].
#[async_trait]
pub trait GeneStore: Send + Sync {
    /// Batched lookup by approved symbol or alias; one read for the whole
    /// batch. Keys are matched case-insensitively.
    async fn find_by_symbols(&self, symbols: &[String]) -> Result<Vec<Gene>, IngestError>;

    async fn find_by_hgnc_id(&self, hgnc_id: &str) -> Result<Option<Gene>, IngestError>;

    /// Creates the gene on first resolution or links to the existing row
    /// with the same `hgnc_id`, merging cross-references and aliases.
    /// An alias colliding with a different gene is a
    /// [`IngestError::StagingConflict`]; the caller routes it to staging.
    async fn upsert_gene(&self, draft: GeneDraft) -> Result<Gene, IngestError>;

    async fn all_active_genes(&self) -> Result<Vec<Gene>, IngestError>;

    async fn get_gene(&self, id: GeneId) -> Result<Option<Gene>, IngestError>;
}

#[async_trait]
pub trait EvidenceStore: Send + Sync {
    /// Inserts or merges on `(gene_id, source, identifier)`. Rows with a
    /// missing or zero count field are rejected.
    async fn upsert_evidence(&self, evidence: GeneEvidence) -> Result<(), IngestError>;

    async fn count_evidence(&self, source: SourceName) -> Result<u64, IngestError>;

    /// Single delete over the complete dataset; returns the identifiers of
    /// the removed rows so callers can sample them for logs.
    async fn delete_evidence_below_threshold(
        &self,
        source: SourceName,
        count_field: &str,
        threshold: u64,
    ) -> Result<Vec<String>, IngestError>;

    /// Soft-deletes prior rows for an upload provider (replace mode).
    async fn soft_delete_provider_evidence(
        &self,
        source: SourceName,
        provider: &str,
    ) -> Result<u64, IngestError>;

    async fn evidence_for_source(&self, source: SourceName) -> Result<Vec<GeneEvidence>, IngestError>;

    async fn evidence_for_gene(&self, gene_id: GeneId) -> Result<Vec<GeneEvidence>, IngestError>;
}

#[async_trait]
pub trait AnnotationStore: Send + Sync {
    /// Writes a validated annotation. Callers must have run the source's
    /// validity predicate first.
    async fn write_annotation(&self, annotation: GeneAnnotation) -> Result<(), IngestError>;

    async fn get_annotation(
        &self,
        gene_id: GeneId,
        source: SourceName,
    ) -> Result<Option<GeneAnnotation>, IngestError>;

    async fn annotated_gene_ids(&self, source: SourceName) -> Result<Vec<GeneId>, IngestError>;
}

#[async_trait]
pub trait StagingStore: Send + Sync {
    async fn add_staging(
        &self,
        raw_text: &str,
        source_hint: SourceName,
        candidates: Vec<StagingCandidate>,
    ) -> Result<StagingRecord, IngestError>;

    async fn pending_staging(&self) -> Result<Vec<StagingRecord>, IngestError>;

    async fn resolve_staging(
        &self,
        id: u64,
        status: StagingStatus,
        reviewer: Option<String>,
        reason: Option<String>,
    ) -> Result<StagingRecord, IngestError>;
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Transitions the source to `running`. Errors when a run is already
    /// active, enforcing the one-active-run-per-source invariant.
    async fn begin_run(&self, source: SourceName) -> Result<ProgressRecord, IngestError>;

    async fn put_progress(&self, record: ProgressRecord) -> Result<(), IngestError>;

    async fn get_progress(&self, source: SourceName) -> Result<ProgressRecord, IngestError>;

    async fn all_progress(&self) -> Result<Vec<ProgressRecord>, IngestError>;
}

#[async_trait]
pub trait SummaryStore: Send + Sync {
    /// Atomically replaces the materialized summary projection.
    async fn replace_summary(&self, rows: Vec<GeneSummaryRow>) -> Result<(), IngestError>;

    async fn summary(&self) -> Result<Vec<GeneSummaryRow>, IngestError>;
}

/// Everything the pipeline needs from persistence, as one object-safe
/// bundle.
pub trait Store:
    GeneStore + EvidenceStore + AnnotationStore + StagingStore + ProgressStore + SummaryStore
{
}

impl<T> Store for T where
    T: GeneStore + EvidenceStore + AnnotationStore + StagingStore + ProgressStore + SummaryStore
{
}
