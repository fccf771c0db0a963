use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::gene::GeneId;
use super::source::SourceName;

/// Provenance trail for one evidence row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceProvenance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// Per-source assertion linking a gene to one ingestion source.
/// `(gene_id, source, identifier)` is unique at the source's granularity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneEvidence {
    pub gene_id: GeneId,
    pub source: SourceName,
    pub identifier: String,
    pub evidence_data: serde_json::Value,
    #[serde(default)]
    pub provenance: EvidenceProvenance,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    #[serde(default)]
    pub deleted: bool,
}

impl GeneEvidence {
    pub fn new(
        gene_id: GeneId,
        source: SourceName,
        identifier: impl Into<String>,
        evidence_data: serde_json::Value,
    ) -> Self {
        Self {
            gene_id,
            source,
            identifier: identifier.into(),
            evidence_data,
            provenance: EvidenceProvenance::default(),
            recorded_at: OffsetDateTime::now_utc(),
            deleted: false,
        }
    }

    /// Reads the source's canonical count field out of `evidence_data`.
    /// Returns `None` when the field is missing or not a non-negative
    /// integer; such rows must never be written or cached.
    pub fn count(&self) -> Option<u64> {
        let field = self.source.count_field()?;
        self.evidence_data.get(field)?.as_u64()
    }

    /// Merges another payload for the same `(gene, source, identifier)`
    /// row: set-like arrays are unioned, counts take the maximum, and any
    /// remaining keys from `other` fill gaps. Count fields backed by an
    /// identifier array are then recomputed from the union, so chunked
    /// sources accumulate correctly across chunk boundaries.
    pub fn merge_payload(&mut self, other: &serde_json::Value) {
        let count_spec = self.source.count_field().zip(count_companion(self.source));
        let (Some(mine), Some(theirs)) = (self.evidence_data.as_object_mut(), other.as_object())
        else {
            return;
        };

        for (key, incoming) in theirs {
            match mine.get_mut(key) {
                Some(serde_json::Value::Array(existing)) => {
                    if let Some(new_items) = incoming.as_array() {
                        for item in new_items {
                            if !existing.contains(item) {
                                existing.push(item.clone());
                            }
                        }
                    }
                }
                Some(serde_json::Value::Number(existing)) => {
                    if let (Some(a), Some(b)) = (existing.as_u64(), incoming.as_u64()) {
                        mine.insert(key.clone(), serde_json::Value::from(a.max(b)));
                    }
                }
                Some(_) => {}
                None => {
                    mine.insert(key.clone(), incoming.clone());
                }
            }
        }

        if let Some((count_field, companion)) = count_spec {
            let union_size = mine.get(companion).and_then(|v| v.as_array()).map(Vec::len);
            if let Some(union_size) = union_size {
                mine.insert(
                    count_field.to_string(),
                    serde_json::Value::from(union_size as u64),
                );
            }
        }
    }
}

/// Identifier array backing a source's count field; the count is the
/// array's cardinality after a merge.
fn count_companion(source: SourceName) -> Option<&'static str> {
    match source {
        SourceName::Pubtator | SourceName::Literature => Some("pmids"),
        SourceName::PanelappUk | SourceName::PanelappAu | SourceName::DiagnosticPanels => {
            Some("panels")
        }
        SourceName::Gencc => Some("submitters"),
        _ => None,
    }
}
