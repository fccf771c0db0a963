//! PubTator3 streamed ingestion.
//!
//! Publications arrive in search pages; each page becomes one chunk of
//! per-gene accumulation. No threshold is applied per chunk — a gene can
//! cross `min_publications` only across chunks — so the filter runs once
//! over the complete dataset in the store after the final chunk.

use std::borrow::Cow;
use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::config::SourceConfig;
use crate::entities::{EvidenceProvenance, RunStatus, SourceName};
use crate::error::IngestError;
use crate::filter::filter_in_store;
use crate::sources::SourceClient;
use crate::sources::ingest::{DataSource, IngestContext, IngestReport, IngestRun, write_evidence_batch};
use crate::store::ProgressStore;

const PUBTATOR_BASE: &str = "https://www.ncbi.nlm.nih.gov/research/pubtator3-api";
const PUBTATOR_API: &str = "pubtator3";
const PUBTATOR_BASE_ENV: &str = "NEPHRO_PUBTATOR_BASE";

/// Chunk-boundary checkpoints; bump on layout changes.
const CHECKPOINT_VERSION: u32 = 1;

pub(crate) struct PubTatorSource {
    http: SourceClient,
    base: Cow<'static, str>,
    api_key: Option<String>,
    query: String,
}

impl PubTatorSource {
    pub(crate) fn new(config: &SourceConfig) -> Result<Self, IngestError> {
        Ok(Self {
            http: SourceClient::new(PUBTATOR_API, config, true)?,
            base: crate::sources::env_base(PUBTATOR_BASE, PUBTATOR_BASE_ENV),
            api_key: crate::sources::ncbi_api_key(),
            query: config.kidney_include.join(" OR "),
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(base: String, query: &str) -> Self {
        Self {
            http: SourceClient::new_for_test(PUBTATOR_API, 1),
            base: Cow::Owned(base),
            api_key: None,
            query: query.to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base.as_ref().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn search_page(&self, page: u32) -> Result<PubTatorSearchResponse, IngestError> {
        let url = self.endpoint("search/");
        let page_param = page.to_string();
        self.http
            .get_json(|| {
                let req = self
                    .http
                    .get(&url)
                    .query(&[("text", self.query.as_str()), ("page", page_param.as_str())]);
                crate::sources::append_ncbi_api_key(req, self.api_key.as_deref())
            })
            .await
    }

    async fn export_annotations(
        &self,
        pmids: &[u32],
    ) -> Result<PubTatorExportResponse, IngestError> {
        let url = self.endpoint("publications/export/biocjson");
        let joined = pmids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.http
            .get_json(|| {
                let req = self.http.get(&url).query(&[("pmids", joined.as_str())]);
                crate::sources::append_ncbi_api_key(req, self.api_key.as_deref())
            })
            .await
    }

    /// Accumulates one chunk: per gene symbol, the pmid set, mention list
    /// with scores, and NCBI identifiers seen in the chunk.
    fn accumulate_chunk(export: &PubTatorExportResponse) -> HashMap<String, serde_json::Value> {
        let mut per_gene: HashMap<String, ChunkAccumulator> = HashMap::new();

        for document in &export.documents {
            let Some(pmid) = document.pmid else { continue };
            for passage in &document.passages {
                for annotation in &passage.annotations {
                    let is_gene = annotation
                        .infons
                        .as_ref()
                        .and_then(|i| i.kind.as_deref())
                        .is_some_and(|kind| kind.eq_ignore_ascii_case("gene"));
                    if !is_gene {
                        continue;
                    }
                    let Some(text) = annotation.text.as_deref().map(str::trim) else {
                        continue;
                    };
                    if text.is_empty() {
                        continue;
                    }

                    let entry = per_gene.entry(text.to_ascii_uppercase()).or_default();
                    if !entry.pmids.contains(&pmid) {
                        entry.pmids.push(pmid);
                    }
                    if let Some(identifier) = annotation
                        .infons
                        .as_ref()
                        .and_then(|i| i.identifier.clone())
                        && !entry.identifiers.contains(&identifier)
                    {
                        entry.identifiers.push(identifier);
                    }
                    entry.mentions.push(json!({
                        "text": text,
                        "pmid": pmid,
                        "score": annotation.infons.as_ref().and_then(|i| i.score),
                    }));
                }
            }
        }

        per_gene
            .into_iter()
            .map(|(symbol, acc)| {
                let payload = json!({
                    "publication_count": acc.pmids.len(),
                    "pmids": acc.pmids,
                    "identifiers": acc.identifiers,
                    "mentions": acc.mentions,
                });
                (symbol, payload)
            })
            .collect()
    }
}

#[derive(Default)]
struct ChunkAccumulator {
    pmids: Vec<u32>,
    identifiers: Vec<String>,
    mentions: Vec<serde_json::Value>,
}

fn checkpoint(next_page: u32) -> serde_json::Value {
    json!({
        "schema_version": CHECKPOINT_VERSION,
        "next_page": next_page,
        "timestamp": OffsetDateTime::now_utc().unix_timestamp(),
    })
}

fn resume_page(progress_checkpoint: Option<&serde_json::Value>) -> Result<u32, IngestError> {
    let Some(checkpoint) = progress_checkpoint else {
        return Ok(1);
    };
    let found = checkpoint
        .get("schema_version")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32;
    if found != CHECKPOINT_VERSION {
        return Err(IngestError::CheckpointVersion {
            found,
            expected: CHECKPOINT_VERSION,
        });
    }
    Ok(checkpoint
        .get("next_page")
        .and_then(|v| v.as_u64())
        .unwrap_or(1) as u32)
}

#[async_trait]
impl DataSource for PubTatorSource {
    fn source_name(&self) -> SourceName {
        SourceName::Pubtator
    }

    async fn ingest(&self, ctx: &IngestContext<'_>) -> Result<IngestRun, IngestError> {
        let source = self.source_name();
        let mut report = IngestReport::new(source);
        let mut progress = ctx.store.get_progress(source).await?;
        let mut page = resume_page(progress.checkpoint.as_ref())?;
        if page > 1 {
            info!(source = source.as_str(), page, "Resuming from checkpoint");
        }

        loop {
            let search = self.search_page(page).await?;
            if search.results.is_empty() {
                break;
            }

            let pmids: Vec<u32> = search.results.iter().filter_map(|r| r.pmid).collect();
            if !pmids.is_empty() {
                let export = self.export_annotations(&pmids).await?;
                let records = Self::accumulate_chunk(&export);
                let provenance = EvidenceProvenance::default();
                write_evidence_batch(ctx, source, &records, &provenance, &mut report).await?;
            }

            progress.current_chunk = u64::from(page);
            progress.items_processed += pmids.len() as u64;
            progress.items_total = search.count;
            progress.checkpoint = Some(checkpoint(page + 1));
            progress.updated_at = OffsetDateTime::now_utc();
            ctx.store.put_progress(progress.clone()).await?;

            let last_page = search
                .total_pages
                .is_some_and(|total| u64::from(page) >= total);
            if last_page {
                break;
            }
            page += 1;

            if ctx.pause.is_cancelled() {
                progress.status = RunStatus::Paused;
                ctx.store.put_progress(progress.clone()).await?;
                warn!(
                    source = source.as_str(),
                    next_page = page,
                    "Paused at chunk boundary"
                );
                return Ok(IngestRun::Paused(report));
            }
        }

        // The deferred complete-dataset filter: one store-level delete.
        let stats = filter_in_store(
            ctx.store,
            source,
            ctx.config.min_threshold,
            ctx.config.min_threshold_enabled,
        )
        .await?;
        report.filtering = Some(stats);

        progress.checkpoint = None;
        progress.updated_at = OffsetDateTime::now_utc();
        ctx.store.put_progress(progress).await?;

        Ok(IngestRun::Completed(report))
    }
}

#[derive(Debug, Deserialize)]
struct PubTatorSearchResponse {
    #[serde(default)]
    results: Vec<PubTatorSearchResult>,
    #[serde(default)]
    count: Option<u64>,
    #[serde(default)]
    total_pages: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PubTatorSearchResult {
    pmid: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PubTatorExportResponse {
    #[serde(rename = "PubTator3", default)]
    pub documents: Vec<PubTatorDocument>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PubTatorDocument {
    pub pmid: Option<u32>,
    #[serde(default)]
    pub passages: Vec<PubTatorPassage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PubTatorPassage {
    #[serde(default)]
    pub annotations: Vec<PubTatorAnnotation>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PubTatorAnnotation {
    pub text: Option<String>,
    pub infons: Option<PubTatorAnnotationInfons>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PubTatorAnnotationInfons {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub identifier: Option<String>,
    pub score: Option<f64>,
}
