//! GenCC gene-disease validity submissions.
//!
//! One complete Excel export per run: parse, keep kidney diseases under
//! the precise predicate, drop refuted/disputed classifications, then
//! merge-and-filter in memory before writing evidence.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Cursor;

use async_trait::async_trait;
use calamine::{Data, DataType, Reader, Xlsx};
use serde_json::json;
use tracing::{info, warn};

use crate::config::SourceConfig;
use crate::entities::{EvidenceProvenance, SourceName};
use crate::error::IngestError;
use crate::filter::filter_in_memory;
use crate::sources::SourceClient;
use crate::sources::ingest::{DataSource, IngestContext, IngestReport, IngestRun, write_evidence_batch};
use crate::sources::kidney::KidneyPredicate;

const GENCC_BASE: &str = "https://search.thegencc.org";
const GENCC_API: &str = "gencc";
const GENCC_BASE_ENV: &str = "NEPHRO_GENCC_BASE";
const GENCC_TOKEN_ENV: &str = "NEPHRO_GENCC_TOKEN";

const EXPORT_PATH: &str = "download/action/submissions-export-xlsx";

pub(crate) struct GenccSource {
    http: SourceClient,
    base: Cow<'static, str>,
    token: Option<String>,
    kidney: KidneyPredicate,
}

impl GenccSource {
    pub(crate) fn new(config: &SourceConfig) -> Result<Self, IngestError> {
        Ok(Self {
            http: SourceClient::new(GENCC_API, config, true)?,
            base: crate::sources::env_base(GENCC_BASE, GENCC_BASE_ENV),
            token: std::env::var(GENCC_TOKEN_ENV)
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            kidney: KidneyPredicate::from_config(config)?,
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(base: String, config: &SourceConfig) -> Self {
        Self {
            http: SourceClient::new_for_test(GENCC_API, 1),
            base: Cow::Owned(base),
            token: None,
            kidney: KidneyPredicate::from_config(config).expect("kidney predicate"),
        }
    }

    async fn download_export(&self) -> Result<Vec<u8>, IngestError> {
        let url = format!("{}/{}", self.base.as_ref().trim_end_matches('/'), EXPORT_PATH);
        self.http
            .get_bytes(|| {
                let req = self.http.get(&url);
                match self.token.as_deref() {
                    Some(token) => req.bearer_auth(token),
                    None => req,
                }
            })
            .await
    }

    /// Parses the export into kidney-relevant submissions grouped per
    /// gene symbol.
    fn parse_export(&self, bytes: &[u8]) -> Result<HashMap<String, serde_json::Value>, IngestError> {
        let mut workbook =
            Xlsx::new(Cursor::new(bytes.to_vec())).map_err(calamine::Error::from)?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| IngestError::Parse {
                context: GENCC_API.to_string(),
                message: "export contains no worksheets".to_string(),
            })?
            .map_err(calamine::Error::from)?;

        let mut rows = range.rows();
        let header = rows.next().ok_or_else(|| IngestError::Parse {
            context: GENCC_API.to_string(),
            message: "export worksheet is empty".to_string(),
        })?;
        let columns = HeaderIndex::from_row(header)?;

        let mut per_gene: HashMap<String, Submissions> = HashMap::new();
        let mut total_rows = 0u64;
        for row in rows {
            total_rows += 1;
            let Some(symbol) = columns.cell(row, "gene_symbol") else {
                continue;
            };
            let Some(disease) = columns.cell(row, "disease_title") else {
                continue;
            };
            if !self.kidney.matches(&disease) {
                continue;
            }

            let classification = columns
                .cell(row, "classification_title")
                .unwrap_or_default();
            if is_negative_classification(&classification) {
                continue;
            }

            let entry = per_gene.entry(symbol.to_ascii_uppercase()).or_default();
            if let Some(hgnc_id) = columns.cell(row, "gene_curie") {
                entry.hgnc_id.get_or_insert(hgnc_id);
            }
            if let Some(submitter) = columns.cell(row, "submitter_title")
                && !entry.submitters.contains(&submitter)
            {
                entry.submitters.push(submitter);
            }
            if !entry.diseases.contains(&disease) {
                entry.diseases.push(disease);
            }
            if !classification.is_empty() && !entry.classifications.contains(&classification) {
                entry.classifications.push(classification);
            }
        }

        info!(
            source = GENCC_API,
            total_rows,
            kidney_genes = per_gene.len(),
            "Parsed GenCC export"
        );

        Ok(per_gene
            .into_iter()
            .map(|(symbol, s)| {
                let payload = json!({
                    "submission_count": s.submitters.len(),
                    "submitters": s.submitters,
                    "diseases": s.diseases,
                    "classifications": s.classifications,
                    "hgnc_id": s.hgnc_id,
                });
                (symbol, payload)
            })
            .collect())
    }
}

#[derive(Default)]
struct Submissions {
    hgnc_id: Option<String>,
    submitters: Vec<String>,
    diseases: Vec<String>,
    classifications: Vec<String>,
}

fn is_negative_classification(classification: &str) -> bool {
    let lower = classification.to_ascii_lowercase();
    lower.contains("refuted")
        || lower.contains("disputed")
        || lower.contains("no known disease relationship")
}

#[derive(Debug)]
struct HeaderIndex {
    by_name: HashMap<String, usize>,
}

impl HeaderIndex {
    fn from_row(header: &[Data]) -> Result<Self, IngestError> {
        let by_name: HashMap<String, usize> = header
            .iter()
            .enumerate()
            .filter_map(|(idx, cell)| {
                cell.get_string()
                    .map(|name| (name.trim().to_ascii_lowercase(), idx))
            })
            .collect();
        for required in ["gene_symbol", "disease_title"] {
            if !by_name.contains_key(required) {
                return Err(IngestError::Parse {
                    context: GENCC_API.to_string(),
                    message: format!("export is missing the '{required}' column"),
                });
            }
        }
        Ok(Self { by_name })
    }

    fn cell(&self, row: &[Data], name: &str) -> Option<String> {
        let idx = *self.by_name.get(name)?;
        let value = row.get(idx)?;
        let text = value
            .get_string()
            .map(str::to_string)
            .or_else(|| value.as_string())?;
        let text = text.trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

#[async_trait]
impl DataSource for GenccSource {
    fn source_name(&self) -> SourceName {
        SourceName::Gencc
    }

    async fn ingest(&self, ctx: &IngestContext<'_>) -> Result<IngestRun, IngestError> {
        let source = self.source_name();
        let mut report = IngestReport::new(source);

        let bytes = self.download_export().await?;
        let mut records = self.parse_export(&bytes)?;

        let stats = filter_in_memory(
            source,
            "submission_count",
            ctx.config.min_threshold,
            &mut records,
            ctx.config.min_threshold_enabled,
        );
        if stats.filtered_count > 0 {
            warn!(
                source = source.as_str(),
                filtered = stats.filtered_count,
                "Submissions below threshold dropped before write"
            );
        }
        report.filtering = Some(stats);

        let provenance = EvidenceProvenance::default();
        write_evidence_batch(ctx, source, &records, &provenance, &mut report).await?;
        Ok(IngestRun::Completed(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn source_for_test() -> GenccSource {
        let config = Config::default().source(SourceName::Gencc).clone();
        GenccSource::new_for_test("http://unused.invalid".to_string(), &config)
    }

    fn data_row(cells: &[&str]) -> Vec<Data> {
        cells.iter().map(|c| Data::String((*c).to_string())).collect()
    }

    #[test]
    fn negative_classifications_are_skipped() {
        assert!(is_negative_classification("Refuted Evidence"));
        assert!(is_negative_classification("Disputed Evidence"));
        assert!(is_negative_classification("No Known Disease Relationship"));
        assert!(!is_negative_classification("Definitive"));
        assert!(!is_negative_classification("Limited"));
    }

    #[test]
    fn header_index_requires_gene_and_disease_columns() {
        let err = HeaderIndex::from_row(&data_row(&["uuid", "submitter_title"]))
            .expect_err("missing required columns");
        assert!(err.to_string().contains("gene_symbol"));

        let ok = HeaderIndex::from_row(&data_row(&["gene_symbol", "disease_title"]));
        assert!(ok.is_ok());
    }

    #[test]
    fn parse_export_groups_kidney_rows_per_gene() {
        // Build a workbook in memory via raw XML is overkill; exercise the
        // row pipeline through the header index and predicate directly.
        let source = source_for_test();
        let header = data_row(&[
            "gene_curie",
            "gene_symbol",
            "disease_title",
            "classification_title",
            "submitter_title",
        ]);
        let columns = HeaderIndex::from_row(&header).expect("header");

        let kidney_row = data_row(&[
            "HGNC:9008",
            "PKD1",
            "Polycystic kidney disease",
            "Definitive",
            "Ambry Genetics",
        ]);
        assert_eq!(columns.cell(&kidney_row, "gene_symbol").as_deref(), Some("PKD1"));
        assert!(
            source
                .kidney
                .matches(&columns.cell(&kidney_row, "disease_title").expect("disease"))
        );

        let brain_row = data_row(&[
            "HGNC:20766",
            "TUBA1A",
            "Lissencephaly",
            "Definitive",
            "Orphanet",
        ]);
        assert!(
            !source
                .kidney
                .matches(&columns.cell(&brain_row, "disease_title").expect("disease"))
        );

        let adrenal_row = data_row(&[
            "HGNC:2600",
            "CYP21A2",
            "Congenital adrenal hyperplasia",
            "Definitive",
            "Orphanet",
        ]);
        assert!(
            !source
                .kidney
                .matches(&columns.cell(&adrenal_row, "disease_title").expect("disease"))
        );
    }
}
