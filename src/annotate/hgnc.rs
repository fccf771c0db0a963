use std::borrow::Cow;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::SourceConfig;
use crate::entities::{Gene, GeneDraft, SourceName};
use crate::error::IngestError;
use crate::sources::SourceClient;
use crate::store::{GeneStore, Store};
use crate::utils::serde::StringOrVec;

const HGNC_BASE: &str = "https://rest.genenames.org";
const HGNC_API: &str = "hgnc";
const HGNC_BASE_ENV: &str = "NEPHRO_HGNC_BASE";

/// Identity authority for human genes. The normalizer resolves raw
/// symbols through it and the annotation pass records the full
/// nomenclature payload (with Ensembl/NCBI cross-references that GTEx
/// and Descartes depend on).
pub(crate) struct HgncClient {
    http: SourceClient,
    base: Cow<'static, str>,
}

impl HgncClient {
    pub(crate) fn new(config: &SourceConfig) -> Result<Self, IngestError> {
        Ok(Self {
            http: SourceClient::new(HGNC_API, config, true)?,
            base: crate::sources::env_base(HGNC_BASE, HGNC_BASE_ENV),
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(base: String) -> Self {
        Self {
            http: SourceClient::new_for_test(HGNC_API, 1),
            base: Cow::Owned(base),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base.as_ref().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn fetch_field(&self, field: &str, value: &str) -> Result<Vec<HgncRecord>, IngestError> {
        let url = self.endpoint(&format!("fetch/{field}/{value}"));
        let resp: Option<HgncFetchResponse> = self
            .http
            .get_json_opt(|| self.http.get(&url).header("Accept", "application/json"))
            .await?;
        Ok(resp.map(|r| r.response.docs).unwrap_or_default())
    }

    pub(crate) async fn fetch_by_symbol(
        &self,
        symbol: &str,
    ) -> Result<Option<HgncRecord>, IngestError> {
        Ok(self.fetch_field("symbol", symbol).await?.into_iter().next())
    }

    /// Resolution candidates for a cleaned symbol, ranked by match tier:
    /// exact approved match 1.0, previous symbol 0.8, alias 0.6.
    pub(crate) async fn resolve(&self, symbol: &str) -> Result<Vec<HgncCandidate>, IngestError> {
        let approved = self.fetch_field("symbol", symbol).await?;
        if !approved.is_empty() {
            return Ok(approved
                .into_iter()
                .map(|record| HgncCandidate {
                    record,
                    confidence: 1.0,
                    match_kind: "approved",
                })
                .collect());
        }

        let mut candidates: Vec<HgncCandidate> = Vec::new();
        for record in self.fetch_field("prev_symbol", symbol).await? {
            candidates.push(HgncCandidate {
                record,
                confidence: 0.8,
                match_kind: "previous",
            });
        }
        for record in self.fetch_field("alias_symbol", symbol).await? {
            let duplicate = candidates
                .iter()
                .any(|c| c.record.hgnc_id == record.hgnc_id);
            if !duplicate {
                candidates.push(HgncCandidate {
                    record,
                    confidence: 0.6,
                    match_kind: "alias",
                });
            }
        }
        Ok(candidates)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct HgncCandidate {
    pub record: HgncRecord,
    pub confidence: f64,
    pub match_kind: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct HgncRecord {
    pub symbol: String,
    pub hgnc_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub alias_symbol: StringOrVec,
    #[serde(default)]
    pub prev_symbol: StringOrVec,
    #[serde(default)]
    pub ensembl_gene_id: Option<String>,
    #[serde(default)]
    pub entrez_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl HgncRecord {
    pub(crate) fn to_draft(&self) -> GeneDraft {
        let mut aliases: Vec<String> = self.alias_symbol.clone().into_vec();
        aliases.extend(self.prev_symbol.clone().into_vec());
        GeneDraft {
            approved_symbol: self.symbol.clone(),
            hgnc_id: self.hgnc_id.clone(),
            ensembl_gene_id: self.ensembl_gene_id.clone(),
            ncbi_gene_id: self.entrez_id.clone(),
            location: self.location.clone(),
            aliases,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HgncFetchResponse {
    response: HgncDocs,
}

#[derive(Debug, Deserialize)]
struct HgncDocs {
    #[serde(default)]
    docs: Vec<HgncRecord>,
}

/// HGNC as an annotation source. Must run before GTEx/Descartes: its
/// side effect writes the Ensembl/NCBI cross-references onto the gene.
pub(crate) struct HgncAnnotator {
    client: HgncClient,
    cache_ttl_days: u32,
}

impl HgncAnnotator {
    pub(crate) fn new(config: &SourceConfig) -> Result<Self, IngestError> {
        Ok(Self {
            client: HgncClient::new(config)?,
            cache_ttl_days: config.cache_ttl_days,
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(base: String) -> Self {
        Self {
            client: HgncClient::new_for_test(base),
            cache_ttl_days: 90,
        }
    }
}

#[async_trait]
impl super::AnnotationSource for HgncAnnotator {
    fn source_name(&self) -> SourceName {
        SourceName::Hgnc
    }

    fn version(&self) -> &'static str {
        "rest-v1"
    }

    fn cache_ttl_days(&self) -> u32 {
        self.cache_ttl_days
    }

    async fn fetch_annotation(&self, gene: &Gene) -> Result<serde_json::Value, IngestError> {
        let record = self
            .client
            .fetch_by_symbol(&gene.approved_symbol)
            .await?
            .ok_or_else(|| IngestError::Api {
                api: HGNC_API.to_string(),
                message: format!("no approved record for symbol '{}'", gene.approved_symbol),
            })?;

        Ok(json!({
            "gene_symbol": record.symbol,
            "hgnc_id": record.hgnc_id,
            "name": record.name,
            "location": record.location,
            "ensembl_gene_id": record.ensembl_gene_id,
            "entrez_id": record.entrez_id,
            "alias_symbol": record.alias_symbol.clone().into_vec(),
            "prev_symbol": record.prev_symbol.clone().into_vec(),
        }))
    }

    fn is_valid(&self, annotation: &serde_json::Value) -> bool {
        let has = |key: &str| {
            annotation
                .get(key)
                .and_then(|v| v.as_str())
                .is_some_and(|s| !s.is_empty())
        };
        has("gene_symbol") && has("hgnc_id")
    }

    async fn apply_side_effects(
        &self,
        store: &dyn Store,
        gene: &Gene,
        annotation: &serde_json::Value,
    ) -> Result<(), IngestError> {
        let string_at = |key: &str| {
            annotation
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        store
            .upsert_gene(GeneDraft {
                approved_symbol: gene.approved_symbol.clone(),
                hgnc_id: gene.hgnc_id.clone(),
                ensembl_gene_id: string_at("ensembl_gene_id"),
                ncbi_gene_id: string_at("entrez_id"),
                location: string_at("location"),
                aliases: Vec::new(),
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn doc(symbol: &str, hgnc_id: &str) -> serde_json::Value {
        json!({
            "symbol": symbol,
            "hgnc_id": hgnc_id,
            "name": "polycystin 1",
            "location": "16p13.3",
            "alias_symbol": ["PBP"],
            "ensembl_gene_id": "ENSG00000008710",
            "entrez_id": "5310",
            "status": "Approved"
        })
    }

    fn fetch_body(docs: serde_json::Value) -> serde_json::Value {
        json!({"response": {"numFound": docs.as_array().map(|a| a.len()).unwrap_or(0), "docs": docs}})
    }

    #[tokio::test]
    async fn resolve_prefers_approved_matches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fetch/symbol/PKD1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(fetch_body(json!([doc("PKD1", "HGNC:9008")]))),
            )
            .mount(&server)
            .await;

        let client = HgncClient::new_for_test(server.uri());
        let candidates = client.resolve("PKD1").await.expect("resolve");
        assert_eq!(candidates.len(), 1);
        assert!((candidates[0].confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(candidates[0].match_kind, "approved");
    }

    #[tokio::test]
    async fn resolve_falls_back_to_previous_and_alias_tiers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fetch/symbol/NPHP2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(fetch_body(json!([]))))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fetch/prev_symbol/NPHP2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(fetch_body(json!([doc("INVS", "HGNC:17870")]))),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/fetch/alias_symbol/NPHP2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(fetch_body(json!([doc("INVS", "HGNC:17870")]))),
            )
            .mount(&server)
            .await;

        let client = HgncClient::new_for_test(server.uri());
        let candidates = client.resolve("NPHP2").await.expect("resolve");
        // Previous-symbol and alias hits for the same record dedupe to the
        // higher tier.
        assert_eq!(candidates.len(), 1);
        assert!((candidates[0].confidence - 0.8).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn annotation_payload_passes_validity_and_updates_xrefs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fetch/symbol/PKD1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(fetch_body(json!([doc("PKD1", "HGNC:9008")]))),
            )
            .mount(&server)
            .await;

        let annotator = HgncAnnotator::new_for_test(server.uri());
        let gene = Gene::new(crate::entities::GeneId(1), "PKD1", "HGNC:9008");

        use super::super::AnnotationSource;
        let payload = annotator.fetch_annotation(&gene).await.expect("fetch");
        assert!(annotator.is_valid(&payload));
        assert_eq!(payload["ensembl_gene_id"], "ENSG00000008710");

        let store = crate::store::MemoryStore::new();
        store
            .upsert_gene(GeneDraft {
                approved_symbol: "PKD1".into(),
                hgnc_id: "HGNC:9008".into(),
                ..GeneDraft::default()
            })
            .await
            .expect("seed gene");
        annotator
            .apply_side_effects(&store, &gene, &payload)
            .await
            .expect("side effects");
        let updated = store
            .find_by_hgnc_id("HGNC:9008")
            .await
            .expect("read")
            .expect("gene");
        assert_eq!(updated.ensembl_gene_id.as_deref(), Some("ENSG00000008710"));
        assert_eq!(updated.ncbi_gene_id.as_deref(), Some("5310"));
    }

    #[tokio::test]
    async fn missing_record_is_an_api_error_not_a_panic() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fetch/symbol/NOPE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(fetch_body(json!([]))))
            .mount(&server)
            .await;

        let annotator = HgncAnnotator::new_for_test(server.uri());
        let gene = Gene::new(crate::entities::GeneId(1), "NOPE", "HGNC:0");
        use super::super::AnnotationSource;
        let err = annotator.fetch_annotation(&gene).await.expect_err("absent");
        assert!(err.to_string().contains("no approved record"));
    }
}
