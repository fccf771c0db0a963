use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::entities::GeneId;
use crate::error::IngestError;

/// Bump when the checkpoint layout changes; older checkpoints refuse to
/// resume and force a full re-run.
pub(crate) const CHECKPOINT_VERSION: u32 = 1;

/// Resume contract for a paused annotation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AnnotationCheckpoint {
    pub schema_version: u32,
    pub current_source: String,
    pub processed_gene_ids: Vec<GeneId>,
    pub batch_index: u64,
    pub timestamp_unix: i64,
}

impl AnnotationCheckpoint {
    pub(crate) fn new(
        current_source: impl Into<String>,
        processed_gene_ids: Vec<GeneId>,
        batch_index: u64,
    ) -> Self {
        Self {
            schema_version: CHECKPOINT_VERSION,
            current_source: current_source.into(),
            processed_gene_ids,
            batch_index,
            timestamp_unix: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    pub(crate) fn to_value(&self) -> Result<serde_json::Value, IngestError> {
        Ok(serde_json::to_value(self)?)
    }

    pub(crate) fn parse(value: &serde_json::Value) -> Result<Self, IngestError> {
        let found = value
            .get("schema_version")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        if found != CHECKPOINT_VERSION {
            return Err(IngestError::CheckpointVersion {
                found,
                expected: CHECKPOINT_VERSION,
            });
        }
        Ok(serde_json::from_value(value.clone())?)
    }
}
