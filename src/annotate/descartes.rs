use std::borrow::Cow;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::SourceConfig;
use crate::entities::{Gene, SourceName};
use crate::error::IngestError;
use crate::sources::SourceClient;

const DESCARTES_BASE: &str = "https://descartes.brotmanbaty.org/api";
const DESCARTES_API: &str = "descartes";
const DESCARTES_BASE_ENV: &str = "NEPHRO_DESCARTES_BASE";

/// Fetal cell-atlas expression from Descartes. Like GTEx, this consumes
/// the Ensembl cross-reference from the HGNC pass.
pub(crate) struct DescartesAnnotator {
    http: SourceClient,
    base: Cow<'static, str>,
    cache_ttl_days: u32,
}

impl DescartesAnnotator {
    pub(crate) fn new(config: &SourceConfig) -> Result<Self, IngestError> {
        Ok(Self {
            http: SourceClient::new(DESCARTES_API, config, true)?,
            base: crate::sources::env_base(DESCARTES_BASE, DESCARTES_BASE_ENV),
            cache_ttl_days: config.cache_ttl_days,
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(base: String) -> Self {
        Self {
            http: SourceClient::new_for_test(DESCARTES_API, 1),
            base: Cow::Owned(base),
            cache_ttl_days: 30,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CellTypeResponse {
    #[serde(default)]
    cell_types: Vec<CellTypeRow>,
}

#[derive(Debug, Deserialize)]
struct CellTypeRow {
    #[serde(default)]
    cell_type: Option<String>,
    #[serde(default)]
    tissue: Option<String>,
    #[serde(default)]
    expression: Option<f64>,
}

#[async_trait]
impl super::AnnotationSource for DescartesAnnotator {
    fn source_name(&self) -> SourceName {
        SourceName::Descartes
    }

    fn version(&self) -> &'static str {
        "descartes-fetal-v1"
    }

    fn cache_ttl_days(&self) -> u32 {
        self.cache_ttl_days
    }

    async fn fetch_annotation(&self, gene: &Gene) -> Result<serde_json::Value, IngestError> {
        let ensembl_gene_id =
            gene.ensembl_gene_id
                .clone()
                .ok_or_else(|| IngestError::DependencyUnmet {
                    source_name: SourceName::Descartes.to_string(),
                    dependency: SourceName::Hgnc.to_string(),
                })?;

        let url = format!(
            "{}/gene/{ensembl_gene_id}/cell-types",
            self.base.as_ref().trim_end_matches('/')
        );
        let resp: CellTypeResponse = self
            .http
            .get_json_opt(|| self.http.get(&url))
            .await?
            .unwrap_or_default();

        let cell_types: Vec<serde_json::Value> = resp
            .cell_types
            .iter()
            .filter_map(|row| {
                Some(json!({
                    "cell_type": row.cell_type.as_deref()?,
                    "tissue": row.tissue,
                    "expression": row.expression,
                }))
            })
            .collect();
        let kidney_cell_types: Vec<&serde_json::Value> = cell_types
            .iter()
            .filter(|row| {
                row.get("tissue")
                    .and_then(|t| t.as_str())
                    .is_some_and(|t| t.eq_ignore_ascii_case("kidney"))
            })
            .collect();

        Ok(json!({
            "gene_symbol": gene.approved_symbol,
            "ensembl_gene_id": ensembl_gene_id,
            "cell_types": cell_types,
            "kidney_cell_type_count": kidney_cell_types.len(),
        }))
    }

    fn is_valid(&self, annotation: &serde_json::Value) -> bool {
        let has_symbol = annotation
            .get("gene_symbol")
            .and_then(|v| v.as_str())
            .is_some_and(|s| !s.is_empty());
        let has_ensembl = annotation
            .get("ensembl_gene_id")
            .and_then(|v| v.as_str())
            .is_some_and(|s| !s.is_empty());
        has_symbol && has_ensembl && annotation.get("cell_types").is_some_and(|v| v.is_array())
    }
}

#[cfg(test)]
mod tests {
    use super::super::AnnotationSource;
    use super::*;
    use crate::entities::GeneId;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn counts_kidney_cell_types() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gene/ENSG00000008710/cell-types"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "cell_types": [
                    {"cell_type": "Metanephric cells", "tissue": "Kidney", "expression": 4.2},
                    {"cell_type": "Excitatory neurons", "tissue": "Cerebrum", "expression": 0.1}
                ]
            })))
            .mount(&server)
            .await;

        let annotator = DescartesAnnotator::new_for_test(server.uri());
        let mut gene = Gene::new(GeneId(1), "PKD1", "HGNC:9008");
        gene.ensembl_gene_id = Some("ENSG00000008710".to_string());

        let payload = annotator.fetch_annotation(&gene).await.expect("fetch");
        assert!(annotator.is_valid(&payload));
        assert_eq!(payload["kidney_cell_type_count"], json!(1));
    }

    #[tokio::test]
    async fn requires_the_hgnc_pass_to_have_run() {
        let server = MockServer::start().await;
        let annotator = DescartesAnnotator::new_for_test(server.uri());
        let gene = Gene::new(GeneId(1), "PKD1", "HGNC:9008");
        let err = annotator
            .fetch_annotation(&gene)
            .await
            .expect_err("missing Ensembl xref");
        assert!(matches!(err, IngestError::DependencyUnmet { .. }));
    }
}
