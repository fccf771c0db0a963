use std::borrow::Cow;
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::SourceConfig;
use crate::entities::{Gene, SourceName};
use crate::error::IngestError;
use crate::sources::SourceClient;

const EUTILS_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
const CLINVAR_API: &str = "clinvar";
const CLINVAR_BASE_ENV: &str = "NEPHRO_EUTILS_BASE";

/// How many variant summaries to aggregate per gene. ClinVar genes can
/// carry tens of thousands of variants; the classification tally is a
/// bounded sample on top of the exact total.
const ESUMMARY_MAX_IDS: usize = 500;

/// ClinVar variant aggregate via NCBI E-utilities (esearch + esummary).
/// The NCBI budget without an API key is 3 req/s; the rate limiter
/// enforces it across both calls.
pub(crate) struct ClinvarAnnotator {
    http: SourceClient,
    base: Cow<'static, str>,
    api_key: Option<String>,
    cache_ttl_days: u32,
}

impl ClinvarAnnotator {
    pub(crate) fn new(config: &SourceConfig) -> Result<Self, IngestError> {
        Ok(Self {
            http: SourceClient::new(CLINVAR_API, config, false)?,
            base: crate::sources::env_base(EUTILS_BASE, CLINVAR_BASE_ENV),
            api_key: crate::sources::ncbi_api_key(),
            cache_ttl_days: config.cache_ttl_days,
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(base: String) -> Self {
        Self {
            http: SourceClient::new_for_test(CLINVAR_API, 1),
            base: Cow::Owned(base),
            api_key: None,
            cache_ttl_days: 30,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base.as_ref().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn esearch(&self, symbol: &str) -> Result<EsearchResult, IngestError> {
        let url = self.endpoint("esearch.fcgi");
        let term = format!("{symbol}[gene]");
        let retmax = ESUMMARY_MAX_IDS.to_string();
        let resp: EsearchResponse = self
            .http
            .get_json(|| {
                let req = self.http.get(&url).query(&[
                    ("db", "clinvar"),
                    ("term", term.as_str()),
                    ("retmode", "json"),
                    ("retmax", retmax.as_str()),
                ]);
                crate::sources::append_ncbi_api_key(req, self.api_key.as_deref())
            })
            .await?;
        Ok(resp.esearchresult)
    }

    async fn esummary(&self, ids: &[String]) -> Result<EsummaryResult, IngestError> {
        let url = self.endpoint("esummary.fcgi");
        let joined = ids.join(",");
        let resp: EsummaryResponse = self
            .http
            .get_json(|| {
                let req = self.http.get(&url).query(&[
                    ("db", "clinvar"),
                    ("id", joined.as_str()),
                    ("retmode", "json"),
                ]);
                crate::sources::append_ncbi_api_key(req, self.api_key.as_deref())
            })
            .await?;
        Ok(resp.result)
    }
}

#[derive(Debug, Deserialize)]
struct EsearchResponse {
    esearchresult: EsearchResult,
}

#[derive(Debug, Default, Deserialize)]
struct EsearchResult {
    /// NCBI returns the count as a decimal string.
    #[serde(default)]
    count: Option<String>,
    #[serde(default)]
    idlist: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EsummaryResponse {
    result: EsummaryResult,
}

#[derive(Debug, Default, Deserialize)]
struct EsummaryResult {
    #[serde(default)]
    uids: Vec<String>,
    #[serde(flatten)]
    entries: BTreeMap<String, serde_json::Value>,
}

fn classification_of(entry: &serde_json::Value) -> Option<String> {
    let description = entry
        .get("germline_classification")
        .and_then(|c| c.get("description"))
        .and_then(|d| d.as_str())
        .or_else(|| {
            entry
                .get("clinical_significance")
                .and_then(|c| c.get("description"))
                .and_then(|d| d.as_str())
        })?;
    let normalized = description.trim().to_ascii_lowercase().replace(' ', "_");
    (!normalized.is_empty()).then_some(normalized)
}

#[async_trait]
impl super::AnnotationSource for ClinvarAnnotator {
    fn source_name(&self) -> SourceName {
        SourceName::Clinvar
    }

    fn version(&self) -> &'static str {
        "eutils-2.0"
    }

    fn cache_ttl_days(&self) -> u32 {
        self.cache_ttl_days
    }

    async fn fetch_annotation(&self, gene: &Gene) -> Result<serde_json::Value, IngestError> {
        let search = self.esearch(&gene.approved_symbol).await?;
        let total_variants: u64 = search
            .count
            .as_deref()
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| IngestError::Api {
                api: CLINVAR_API.to_string(),
                message: "esearch response is missing a numeric count".to_string(),
            })?;

        let mut classifications: BTreeMap<String, u64> = BTreeMap::new();
        if !search.idlist.is_empty() {
            let summary = self.esummary(&search.idlist).await?;
            for uid in &summary.uids {
                if let Some(entry) = summary.entries.get(uid)
                    && let Some(classification) = classification_of(entry)
                {
                    *classifications.entry(classification).or_insert(0) += 1;
                }
            }
        }

        Ok(json!({
            "gene_symbol": gene.approved_symbol,
            "total_variants": total_variants,
            "classifications": classifications,
            "sampled_variants": search.idlist.len(),
        }))
    }

    /// A zero-variant result is a valid annotation of "no variants"; a
    /// payload missing the total or symbol is not.
    fn is_valid(&self, annotation: &serde_json::Value) -> bool {
        let has_symbol = annotation
            .get("gene_symbol")
            .and_then(|v| v.as_str())
            .is_some_and(|s| !s.is_empty());
        let has_total = annotation
            .get("total_variants")
            .is_some_and(|v| v.as_u64().is_some());
        has_symbol && has_total
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
    async fn aggregates_search_count_and_classification_tallies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .and(query_param("term", "PKD1[gene]"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "esearchresult": {"count": "3", "idlist": ["1", "2", "3"]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/esummary.fcgi"))
            .and(query_param("id", "1,2,3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {
                    "uids": ["1", "2", "3"],
                    "1": {"germline_classification": {"description": "Pathogenic"}},
                    "2": {"germline_classification": {"description": "Pathogenic"}},
                    "3": {"germline_classification": {"description": "Uncertain significance"}}
                }
            })))
            .mount(&server)
            .await;

        let annotator = ClinvarAnnotator::new_for_test(server.uri());
        let gene = Gene::new(GeneId(1), "PKD1", "HGNC:9008");
        let payload = annotator.fetch_annotation(&gene).await.expect("fetch");

        assert!(annotator.is_valid(&payload));
        assert_eq!(payload["total_variants"], json!(3));
        assert_eq!(payload["classifications"]["pathogenic"], json!(2));
        assert_eq!(payload["classifications"]["uncertain_significance"], json!(1));
    }

    #[tokio::test]
    async fn zero_variants_is_a_valid_annotation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "esearchresult": {"count": "0", "idlist": []}
            })))
            .mount(&server)
            .await;

        let annotator = ClinvarAnnotator::new_for_test(server.uri());
        let gene = Gene::new(GeneId(1), "UMOD", "HGNC:12559");
        let payload = annotator.fetch_annotation(&gene).await.expect("fetch");
        assert!(annotator.is_valid(&payload), "no variants is still valid");
        assert_eq!(payload["total_variants"], json!(0));
    }

    #[tokio::test]
    async fn missing_count_is_an_error_not_a_zero() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "esearchresult": {"idlist": []}
            })))
            .mount(&server)
            .await;

        let annotator = ClinvarAnnotator::new_for_test(server.uri());
        let gene = Gene::new(GeneId(1), "UMOD", "HGNC:12559");
        let err = annotator
            .fetch_annotation(&gene)
            .await
            .expect_err("missing count must not default to zero");
        assert!(err.to_string().contains("missing a numeric count"));
    }

    #[test]
    fn classification_parser_handles_both_response_generations() {
        let new_style = json!({"germline_classification": {"description": "Likely pathogenic"}});
        assert_eq!(
            classification_of(&new_style).as_deref(),
            Some("likely_pathogenic")
        );
        let old_style = json!({"clinical_significance": {"description": "Benign"}});
        assert_eq!(classification_of(&old_style).as_deref(), Some("benign"));
        assert_eq!(classification_of(&json!({})), None);
    }
}
