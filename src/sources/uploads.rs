//! Upload-backed ingestion: diagnostic panel lists and curated literature.
//!
//! The artifact is a tabular file (CSV/TSV/XLSX) with a gene symbol column
//! and a per-source identifier column (panel name, PMID). Uploads merge
//! into the source's existing evidence; the threshold filter runs over the
//! merged dataset, never over the upload alone.

use std::collections::HashMap;
use std::io::Cursor;

use async_trait::async_trait;
use calamine::{Data, DataType, Reader, Xlsx};
use serde_json::json;
use tracing::{info, warn};

use crate::entities::{EvidenceProvenance, SourceName};
use crate::error::IngestError;
use crate::filter::{filter_in_memory, filter_in_store};
use crate::sources::ingest::{DataSource, IngestContext, IngestReport, IngestRun, write_evidence_batch};
use crate::store::EvidenceStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UploadMode {
    Merge,
    Replace,
}

impl std::str::FromStr for UploadMode {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "merge" => Ok(Self::Merge),
            "replace" => Ok(Self::Replace),
            other => Err(IngestError::InvalidArgument(format!(
                "upload mode must be 'merge' or 'replace', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UploadKind {
    DiagnosticPanels,
    Literature,
}

impl UploadKind {
    fn source_name(self) -> SourceName {
        match self {
            Self::DiagnosticPanels => SourceName::DiagnosticPanels,
            Self::Literature => SourceName::Literature,
        }
    }

    fn count_field(self) -> &'static str {
        match self {
            Self::DiagnosticPanels => "panel_count",
            Self::Literature => "publication_count",
        }
    }

    fn companion_field(self) -> &'static str {
        match self {
            Self::DiagnosticPanels => "panels",
            Self::Literature => "pmids",
        }
    }

    fn symbol_columns(self) -> &'static [&'static str] {
        &["gene", "gene_symbol", "symbol", "approved_symbol"]
    }

    fn identifier_columns(self) -> &'static [&'static str] {
        match self {
            Self::DiagnosticPanels => &["panel", "panel_name", "panel_id"],
            Self::Literature => &["pmid", "pubmed_id", "pubmed"],
        }
    }
}

/// One upload ingestion run. Constructed per request by the CLI.
pub(crate) struct UploadSource {
    kind: UploadKind,
    file_name: String,
    bytes: Vec<u8>,
    mode: UploadMode,
    provider: Option<String>,
    upload_id: String,
}

impl UploadSource {
    pub(crate) fn new(
        kind: UploadKind,
        file_name: impl Into<String>,
        bytes: Vec<u8>,
        mode: UploadMode,
        provider: Option<String>,
        upload_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            file_name: file_name.into(),
            bytes,
            mode,
            provider,
            upload_id: upload_id.into(),
        }
    }

    fn parse_rows(&self) -> Result<Vec<(String, Option<String>)>, IngestError> {
        let lower = self.file_name.to_ascii_lowercase();
        if lower.ends_with(".xlsx") || lower.ends_with(".xls") {
            return self.parse_xlsx();
        }
        let delimiter = if lower.ends_with(".tsv") || lower.ends_with(".txt") {
            '\t'
        } else {
            ','
        };
        self.parse_delimited(delimiter)
    }

    fn parse_delimited(&self, delimiter: char) -> Result<Vec<(String, Option<String>)>, IngestError> {
        let text = String::from_utf8_lossy(&self.bytes);
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let header = lines.next().ok_or_else(|| IngestError::Parse {
            context: self.file_name.clone(),
            message: "upload has no header row".to_string(),
        })?;

        let headers: Vec<String> = split_delimited(header, delimiter)
            .into_iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .collect();
        let (symbol_idx, identifier_idx) = self.locate_columns(&headers)?;

        let mut rows = Vec::new();
        for line in lines {
            let fields = split_delimited(line, delimiter);
            let Some(symbol) = fields.get(symbol_idx).map(|s| s.trim()) else {
                continue;
            };
            if symbol.is_empty() {
                continue;
            }
            let identifier = identifier_idx
                .and_then(|idx| fields.get(idx))
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            rows.push((symbol.to_string(), identifier));
        }
        Ok(rows)
    }

    fn parse_xlsx(&self) -> Result<Vec<(String, Option<String>)>, IngestError> {
        let mut workbook =
            Xlsx::new(Cursor::new(self.bytes.clone())).map_err(calamine::Error::from)?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| IngestError::Parse {
                context: self.file_name.clone(),
                message: "workbook contains no worksheets".to_string(),
            })?
            .map_err(calamine::Error::from)?;

        let mut row_iter = range.rows();
        let header = row_iter.next().ok_or_else(|| IngestError::Parse {
            context: self.file_name.clone(),
            message: "worksheet is empty".to_string(),
        })?;
        let headers: Vec<String> = header
            .iter()
            .map(|cell| {
                cell.get_string()
                    .unwrap_or_default()
                    .trim()
                    .to_ascii_lowercase()
            })
            .collect();
        let (symbol_idx, identifier_idx) = self.locate_columns(&headers)?;

        let cell_text = |row: &[Data], idx: usize| -> Option<String> {
            let value = row.get(idx)?;
            let text = value
                .get_string()
                .map(str::to_string)
                .or_else(|| value.as_string())?;
            let text = text.trim().to_string();
            (!text.is_empty()).then_some(text)
        };

        let mut rows = Vec::new();
        for row in row_iter {
            let Some(symbol) = cell_text(row, symbol_idx) else {
                continue;
            };
            let identifier = identifier_idx.and_then(|idx| cell_text(row, idx));
            rows.push((symbol, identifier));
        }
        Ok(rows)
    }

    fn locate_columns(
        &self,
        headers: &[String],
    ) -> Result<(usize, Option<usize>), IngestError> {
        let find = |names: &[&str]| {
            headers
                .iter()
                .position(|h| names.iter().any(|n| h == n))
        };
        let symbol_idx = find(self.kind.symbol_columns()).ok_or_else(|| IngestError::Parse {
            context: self.file_name.clone(),
            message: format!(
                "no gene symbol column found (expected one of: {})",
                self.kind.symbol_columns().join(", ")
            ),
        })?;
        Ok((symbol_idx, find(self.kind.identifier_columns())))
    }

    /// Builds the per-gene payload map from parsed rows. Rows without an
    /// identifier column fall back to the provider name (a single-panel
    /// upload) or are dropped for literature (a PMID is the evidence).
    fn accumulate(
        &self,
        rows: Vec<(String, Option<String>)>,
    ) -> HashMap<String, serde_json::Value> {
        let mut per_gene: HashMap<String, Vec<serde_json::Value>> = HashMap::new();
        for (symbol, identifier) in rows {
            let value = match (self.kind, identifier) {
                (UploadKind::Literature, Some(id)) => match id.parse::<u64>() {
                    Ok(pmid) => json!(pmid),
                    Err(_) => {
                        warn!(file = self.file_name.as_str(), pmid = id.as_str(), "Skipping non-numeric PMID");
                        continue;
                    }
                },
                (UploadKind::Literature, None) => continue,
                (UploadKind::DiagnosticPanels, Some(id)) => json!(id),
                (UploadKind::DiagnosticPanels, None) => match self.provider.as_deref() {
                    Some(provider) => json!(provider),
                    None => continue,
                },
            };

            let entry = per_gene.entry(symbol.to_ascii_uppercase()).or_default();
            if !entry.contains(&value) {
                entry.push(value);
            }
        }

        per_gene
            .into_iter()
            .map(|(symbol, identifiers)| {
                let mut payload = serde_json::Map::new();
                payload.insert(
                    self.kind.count_field().to_string(),
                    json!(identifiers.len()),
                );
                payload.insert(self.kind.companion_field().to_string(), json!(identifiers));
                payload.insert("provider".to_string(), json!(self.provider));
                (symbol, serde_json::Value::Object(payload))
            })
            .collect()
    }
}

/// Merges an existing evidence payload into the upload's in-memory map so
/// the threshold sees the union, not the upload alone.
fn merge_existing(
    records: &mut HashMap<String, serde_json::Value>,
    symbol: &str,
    existing: &serde_json::Value,
    count_field: &str,
    companion_field: &str,
) {
    let entry = records.entry(symbol.to_ascii_uppercase()).or_insert_with(|| {
        let mut empty = serde_json::Map::new();
        empty.insert(count_field.to_string(), json!(0));
        empty.insert(companion_field.to_string(), json!([]));
        serde_json::Value::Object(empty)
    });

    let existing_items: Vec<serde_json::Value> = existing
        .get(companion_field)
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    if let Some(items) = entry
        .get_mut(companion_field)
        .and_then(|v| v.as_array_mut())
    {
        for item in existing_items {
            if !items.contains(&item) {
                items.push(item);
            }
        }
        let count = items.len();
        if let Some(map) = entry.as_object_mut() {
            map.insert(count_field.to_string(), json!(count));
        }
    }
}

#[async_trait]
impl DataSource for UploadSource {
    fn source_name(&self) -> SourceName {
        self.kind.source_name()
    }

    async fn ingest(&self, ctx: &IngestContext<'_>) -> Result<IngestRun, IngestError> {
        let source = self.source_name();
        let mut report = IngestReport::new(source);

        let rows = self.parse_rows()?;
        info!(
            source = source.as_str(),
            file = self.file_name.as_str(),
            rows = rows.len(),
            mode = ?self.mode,
            "Upload parsed"
        );
        let mut records = self.accumulate(rows);

        match self.mode {
            UploadMode::Replace => {
                if let Some(provider) = self.provider.as_deref() {
                    let deleted = ctx
                        .store
                        .soft_delete_provider_evidence(source, provider)
                        .await?;
                    info!(
                        source = source.as_str(),
                        provider,
                        deleted,
                        "Replace mode retired prior evidence"
                    );
                }
            }
            UploadMode::Merge => {
                for evidence in ctx.store.evidence_for_source(source).await? {
                    merge_existing(
                        &mut records,
                        &evidence.identifier,
                        &evidence.evidence_data,
                        self.kind.count_field(),
                        self.kind.companion_field(),
                    );
                }
            }
        }

        let stats = filter_in_memory(
            source,
            self.kind.count_field(),
            ctx.config.min_threshold,
            &mut records,
            ctx.config.min_threshold_enabled,
        );
        report.filtering = Some(stats);

        let provenance = EvidenceProvenance {
            upload_id: Some(self.upload_id.clone()),
            provider: self.provider.clone(),
            ..EvidenceProvenance::default()
        };
        write_evidence_batch(ctx, source, &records, &provenance, &mut report).await?;

        // Enforce the merged threshold against rows already in the store
        // (genes absent from this upload included).
        filter_in_store(
            ctx.store,
            source,
            ctx.config.min_threshold,
            ctx.config.min_threshold_enabled,
        )
        .await?;

        Ok(IngestRun::Completed(report))
    }
}

/// Minimal quote-aware field splitter: panel names carry commas.
fn split_delimited(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            c if c == delimiter && !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    fields.push(current);
    fields
}
