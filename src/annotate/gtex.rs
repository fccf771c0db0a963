use std::borrow::Cow;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::SourceConfig;
use crate::entities::{Gene, SourceName};
use crate::error::IngestError;
use crate::sources::SourceClient;

const GTEX_BASE: &str = "https://gtexportal.org/api/v2";
const GTEX_API: &str = "gtex";
const GTEX_BASE_ENV: &str = "NEPHRO_GTEX_BASE";

const DATASET_ID: &str = "gtex_v8";
const KIDNEY_TISSUES: [&str; 2] = ["Kidney_Cortex", "Kidney_Medulla"];

/// Median tissue expression from the GTEx portal. Consumes the Ensembl
/// cross-reference written by the HGNC pass; genes without one fail with
/// a dependency-unmet error rather than a guessed identifier.
pub(crate) struct GtexAnnotator {
    http: SourceClient,
    base: Cow<'static, str>,
    cache_ttl_days: u32,
}

impl GtexAnnotator {
    pub(crate) fn new(config: &SourceConfig) -> Result<Self, IngestError> {
        Ok(Self {
            http: SourceClient::new(GTEX_API, config, true)?,
            base: crate::sources::env_base(GTEX_BASE, GTEX_BASE_ENV),
            cache_ttl_days: config.cache_ttl_days,
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(base: String) -> Self {
        Self {
            http: SourceClient::new_for_test(GTEX_API, 1),
            base: Cow::Owned(base),
            cache_ttl_days: 30,
        }
    }

    fn require_ensembl_id(&self, gene: &Gene) -> Result<String, IngestError> {
        gene.ensembl_gene_id
            .clone()
            .ok_or_else(|| IngestError::DependencyUnmet {
                source_name: SourceName::Gtex.to_string(),
                dependency: SourceName::Hgnc.to_string(),
            })
    }
}

#[derive(Debug, Default, Deserialize)]
struct MedianExpressionResponse {
    #[serde(default)]
    data: Vec<MedianExpressionRow>,
}

#[derive(Debug, Deserialize)]
struct MedianExpressionRow {
    #[serde(rename = "tissueSiteDetailId")]
    tissue: Option<String>,
    median: Option<f64>,
}

#[async_trait]
impl super::AnnotationSource for GtexAnnotator {
    fn source_name(&self) -> SourceName {
        SourceName::Gtex
    }

    fn version(&self) -> &'static str {
        "gtex-v8"
    }

    fn cache_ttl_days(&self) -> u32 {
        self.cache_ttl_days
    }

    async fn fetch_annotation(&self, gene: &Gene) -> Result<serde_json::Value, IngestError> {
        let ensembl_gene_id = self.require_ensembl_id(gene)?;
        let url = format!(
            "{}/expression/medianGeneExpression",
            self.base.as_ref().trim_end_matches('/')
        );
        let resp: MedianExpressionResponse = self
            .http
            .get_json_opt(|| {
                self.http.get(&url).query(&[
                    ("gencodeId", ensembl_gene_id.as_str()),
                    ("datasetId", DATASET_ID),
                ])
            })
            .await?
            .unwrap_or_default();

        let tissues: Vec<serde_json::Value> = resp
            .data
            .iter()
            .filter_map(|row| {
                let tissue = row.tissue.as_deref()?;
                Some(json!({"tissue": tissue, "median_tpm": row.median}))
            })
            .collect();
        let kidney: Vec<serde_json::Value> = resp
            .data
            .iter()
            .filter(|row| {
                row.tissue
                    .as_deref()
                    .is_some_and(|t| KIDNEY_TISSUES.contains(&t))
            })
            .filter_map(|row| {
                Some(json!({"tissue": row.tissue.as_deref()?, "median_tpm": row.median}))
            })
            .collect();

        Ok(json!({
            "gene_symbol": gene.approved_symbol,
            "ensembl_gene_id": ensembl_gene_id,
            "tissues": tissues,
            "kidney_expression": kidney,
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
        has_symbol && has_ensembl && annotation.get("tissues").is_some_and(|v| v.is_array())
    }
}

#[cfg(test)]
mod tests {
    use super::super::AnnotationSource;
    use super::*;
    use crate::entities::GeneId;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn collects_tissue_rows_and_kidney_subset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/expression/medianGeneExpression"))
            .and(query_param("gencodeId", "ENSG00000008710"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"tissueSiteDetailId": "Kidney_Cortex", "median": 32.1},
                    {"tissueSiteDetailId": "Liver", "median": 1.4}
                ]
            })))
            .mount(&server)
            .await;

        let annotator = GtexAnnotator::new_for_test(server.uri());
        let mut gene = Gene::new(GeneId(1), "PKD1", "HGNC:9008");
        gene.ensembl_gene_id = Some("ENSG00000008710".to_string());

        let payload = annotator.fetch_annotation(&gene).await.expect("fetch");
        assert!(annotator.is_valid(&payload));
        assert_eq!(payload["tissues"].as_array().map(Vec::len), Some(2));
        assert_eq!(
            payload["kidney_expression"],
            json!([{"tissue": "Kidney_Cortex", "median_tpm": 32.1}])
        );
    }

    #[tokio::test]
    async fn missing_ensembl_xref_is_dependency_unmet() {
        let server = MockServer::start().await;
        let annotator = GtexAnnotator::new_for_test(server.uri());
        let gene = Gene::new(GeneId(1), "PKD1", "HGNC:9008");

        let err = annotator
            .fetch_annotation(&gene)
            .await
            .expect_err("no Ensembl id");
        assert!(matches!(err, IngestError::DependencyUnmet { .. }));
    }
}
