//! Data contracts shared across the ingestion and annotation pipeline.

pub(crate) mod annotation;
pub(crate) mod evidence;
pub(crate) mod gene;
pub(crate) mod progress;
pub(crate) mod source;
pub(crate) mod staging;
pub(crate) mod summary;

pub(crate) use annotation::GeneAnnotation;
pub(crate) use evidence::{EvidenceProvenance, GeneEvidence};
pub(crate) use gene::{Gene, GeneDraft, GeneId};
pub(crate) use progress::{ProgressRecord, RunStatus, RunSummary};
pub(crate) use source::SourceName;
pub(crate) use staging::{StagingCandidate, StagingRecord, StagingStatus};
pub(crate) use summary::GeneSummaryRow;
