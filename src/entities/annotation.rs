use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use super::gene::GeneId;
use super::source::SourceName;

/// Per-source enrichment payload attached to a canonical gene. Stored only
/// after the source's validity predicate accepted the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneAnnotation {
    pub gene_id: GeneId,
    pub source: SourceName,
    pub annotations: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub retrieved_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ttl_expires_at: OffsetDateTime,
    #[serde(default)]
    pub from_cache: bool,
}

impl GeneAnnotation {
    pub fn new(
        gene_id: GeneId,
        source: SourceName,
        annotations: serde_json::Value,
        cache_ttl_days: u32,
    ) -> Self {
        let retrieved_at = OffsetDateTime::now_utc();
        Self {
            gene_id,
            source,
            annotations,
            retrieved_at,
            ttl_expires_at: retrieved_at + Duration::days(i64::from(cache_ttl_days)),
            from_cache: false,
        }
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.ttl_expires_at
    }
}
