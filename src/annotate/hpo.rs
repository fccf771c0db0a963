use std::borrow::Cow;
use std::collections::HashSet;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::cache::CacheService;
use crate::config::SourceConfig;
use crate::entities::{Gene, SourceName};
use crate::error::IngestError;
use crate::sources::SourceClient;

use super::hpo_classify::{
    Classification, ClinicalGroup, DescendantSets, TermGroup, classify,
};

const HPO_BASE: &str = "https://ontology.jax.org/api";
const HPO_API: &str = "hpo";
const HPO_BASE_ENV: &str = "NEPHRO_HPO_BASE";

/// Cache namespace for ontology descendant closures, refreshed daily.
const ONTOLOGY_NAMESPACE: &str = "hpo_ontology";
const ONTOLOGY_TTL_SECONDS: u64 = 24 * 60 * 60;

/// Clinical-group signature roots with weights. Each root expands to its
/// descendant closure at run start.
const CLINICAL_ROOTS: [(&str, f64, &str); 7] = [
    ("complement", 1.0, "HP:0005575"),
    ("cakut", 1.0, "HP:0010935"),
    ("glomerulopathy", 1.0, "HP:0100820"),
    ("cyst_cilio", 1.0, "HP:0000107"),
    ("tubulopathy", 1.0, "HP:0000091"),
    ("nephrolithiasis", 1.0, "HP:0000787"),
    ("cancer", 1.0, "HP:0009726"),
];

const ONSET_ROOTS: [(&str, &str); 6] = [
    ("antenatal", "HP:0030674"),
    ("congenital", "HP:0003577"),
    ("infantile", "HP:0003593"),
    ("childhood", "HP:0011463"),
    ("juvenile", "HP:0003621"),
    ("adult", "HP:0003581"),
];

const SYNDROMIC_ROOTS: [(&str, &str); 4] = [
    ("growth", "HP:0001507"),
    ("skeletal", "HP:0000924"),
    ("neurologic", "HP:0000707"),
    ("head_neck", "HP:0000152"),
];

/// Phenotype and disease associations from the JAX HPO service, plus the
/// kidney classification computed over the gene's term set.
pub(crate) struct HpoAnnotator {
    http: SourceClient,
    base: Cow<'static, str>,
    cache: CacheService,
    cache_ttl_days: u32,
    descendant_sets: OnceCell<DescendantSets>,
}

impl HpoAnnotator {
    pub(crate) fn new(config: &SourceConfig, cache: CacheService) -> Result<Self, IngestError> {
        Ok(Self {
            http: SourceClient::new(HPO_API, config, true)?,
            base: crate::sources::env_base(HPO_BASE, HPO_BASE_ENV),
            cache,
            cache_ttl_days: config.cache_ttl_days,
            descendant_sets: OnceCell::new(),
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(base: String, cache: CacheService) -> Self {
        Self {
            http: SourceClient::new_for_test(HPO_API, 1),
            base: Cow::Owned(base),
            cache,
            cache_ttl_days: 30,
            descendant_sets: OnceCell::new(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base.as_ref().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn gene_annotations(&self, ncbi_gene_id: &str) -> Result<HpoGeneAnnotations, IngestError> {
        let url = self.endpoint(&format!("network/annotation/NCBIGene:{ncbi_gene_id}"));
        self.http
            .get_json_opt(|| self.http.get(&url))
            .await?
            .ok_or_else(|| IngestError::Api {
                api: HPO_API.to_string(),
                message: format!("no annotation network entry for NCBIGene:{ncbi_gene_id}"),
            })
    }

    async fn search_gene_id(&self, symbol: &str) -> Result<Option<String>, IngestError> {
        let url = self.endpoint("network/search/gene");
        let resp: Option<HpoGeneSearch> = self
            .http
            .get_json_opt(|| self.http.get(&url).query(&[("q", symbol)]))
            .await?;
        Ok(resp.and_then(|r| {
            r.results.into_iter().find_map(|hit| {
                (hit.name.as_deref() == Some(symbol))
                    .then(|| hit.id.trim_start_matches("NCBIGene:").to_string())
            })
        }))
    }

    /// Descendant closure for one root term, via the daily ontology cache.
    async fn descendants_of(&self, root: &str) -> Result<HashSet<String>, IngestError> {
        let key = json!(root);
        if let Some(cached) = self.cache.get(&key, ONTOLOGY_NAMESPACE).await?
            && let Some(ids) = cached.get("ids").and_then(|v| v.as_array())
        {
            return Ok(ids
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect());
        }

        let url = self.endpoint(&format!("hp/terms/{root}/descendants"));
        let terms: Vec<HpoTerm> = self
            .http
            .get_json_opt(|| self.http.get(&url))
            .await?
            .unwrap_or_default();

        // The closure includes the root itself: a phenotype annotated
        // directly to the root term belongs to the group.
        let mut ids: HashSet<String> = terms.into_iter().map(|t| t.id).collect();
        ids.insert(root.to_string());

        let payload = json!({"root": root, "ids": ids.iter().collect::<Vec<_>>()});
        self.cache
            .set(&key, payload, ONTOLOGY_NAMESPACE, ONTOLOGY_TTL_SECONDS)
            .await?;
        debug!(root, count = ids.len(), "Descendant closure fetched");
        Ok(ids)
    }

    async fn load_descendant_sets(&self) -> Result<DescendantSets, IngestError> {
        let mut clinical = Vec::with_capacity(CLINICAL_ROOTS.len());
        for (key, weight, root) in CLINICAL_ROOTS {
            clinical.push(ClinicalGroup {
                key,
                weight,
                terms: self.descendants_of(root).await?,
            });
        }
        let mut onset = Vec::with_capacity(ONSET_ROOTS.len());
        for (key, root) in ONSET_ROOTS {
            onset.push(TermGroup {
                key,
                terms: self.descendants_of(root).await?,
            });
        }
        let mut syndromic = Vec::with_capacity(SYNDROMIC_ROOTS.len());
        for (key, root) in SYNDROMIC_ROOTS {
            syndromic.push(TermGroup {
                key,
                terms: self.descendants_of(root).await?,
            });
        }
        Ok(DescendantSets {
            clinical,
            onset,
            syndromic,
        })
    }

    async fn classification_for(
        &self,
        phenotype_ids: &[String],
    ) -> Result<Classification, IngestError> {
        let sets = self
            .descendant_sets
            .get_or_try_init(|| self.load_descendant_sets())
            .await?;
        Ok(classify(phenotype_ids, sets))
    }
}

#[derive(Debug, Default, Deserialize)]
struct HpoGeneAnnotations {
    #[serde(default)]
    phenotypes: Vec<HpoTerm>,
    #[serde(default)]
    diseases: Vec<HpoDisease>,
}

#[derive(Debug, Clone, Deserialize)]
struct HpoTerm {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct HpoDisease {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HpoGeneSearch {
    #[serde(default)]
    results: Vec<HpoGeneHit>,
}

#[derive(Debug, Deserialize)]
struct HpoGeneHit {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

#[async_trait]
impl super::AnnotationSource for HpoAnnotator {
    fn source_name(&self) -> SourceName {
        SourceName::Hpo
    }

    fn version(&self) -> &'static str {
        "jax-ontology-v2"
    }

    fn cache_ttl_days(&self) -> u32 {
        self.cache_ttl_days
    }

    async fn fetch_annotation(&self, gene: &Gene) -> Result<serde_json::Value, IngestError> {
        let ncbi_gene_id = match gene.ncbi_gene_id.clone() {
            Some(id) => id,
            None => self
                .search_gene_id(&gene.approved_symbol)
                .await?
                .ok_or_else(|| IngestError::Api {
                    api: HPO_API.to_string(),
                    message: format!("gene '{}' not found in HPO", gene.approved_symbol),
                })?,
        };

        let annotations = self.gene_annotations(&ncbi_gene_id).await?;
        let phenotype_ids: Vec<String> =
            annotations.phenotypes.iter().map(|p| p.id.clone()).collect();
        let classification = self.classification_for(&phenotype_ids).await?;

        Ok(json!({
            "gene_symbol": gene.approved_symbol,
            "ncbi_gene_id": ncbi_gene_id,
            "phenotypes": annotations
                .phenotypes
                .iter()
                .map(|p| json!({"id": p.id, "name": p.name}))
                .collect::<Vec<_>>(),
            "diseases": annotations
                .diseases
                .iter()
                .map(|d| json!({"id": d.id, "name": d.name}))
                .collect::<Vec<_>>(),
            "classification": serde_json::to_value(&classification)?,
        }))
    }

    /// A gene with no phenotypes yet is a valid annotation; a payload
    /// missing the arrays entirely is not.
    fn is_valid(&self, annotation: &serde_json::Value) -> bool {
        let has_symbol = annotation
            .get("gene_symbol")
            .and_then(|v| v.as_str())
            .is_some_and(|s| !s.is_empty());
        let has_arrays = annotation.get("phenotypes").is_some_and(|v| v.is_array())
            && annotation.get("diseases").is_some_and(|v| v.is_array());
        has_symbol && has_arrays
    }
}

#[cfg(test)]
mod tests {
    use super::super::AnnotationSource;
    use super::*;
    use crate::entities::GeneId;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn scratch_cache() -> (tempfile::TempDir, CacheService) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = CacheService::open(&dir.path().join("cache.redb")).expect("cache");
        (dir, cache)
    }

    async fn mock_descendants(server: &MockServer, root: &str, ids: &[&str]) {
        let terms: Vec<serde_json::Value> = ids.iter().map(|id| json!({"id": id})).collect();
        Mock::given(method("GET"))
            .and(path(format!("/hp/terms/{root}/descendants")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(terms)))
            .mount(server)
            .await;
    }

    /// Mounts empty descendant closures for every root not listed in
    /// `except`; tests mount their own closures for those first.
    async fn mock_roots_except(server: &MockServer, except: &[&str]) {
        for (_, _, root) in CLINICAL_ROOTS {
            if !except.contains(&root) {
                mock_descendants(server, root, &[]).await;
            }
        }
        for (_, root) in ONSET_ROOTS {
            if !except.contains(&root) {
                mock_descendants(server, root, &[]).await;
            }
        }
        for (_, root) in SYNDROMIC_ROOTS {
            if !except.contains(&root) {
                mock_descendants(server, root, &[]).await;
            }
        }
    }

    #[tokio::test]
    async fn alport_like_gene_is_syndromic_via_head_neck() {
        let server = MockServer::start().await;
        // Glomerulopathy signature plus the head/neck subtree carrying
        // sensorineural hearing loss.
        mock_descendants(&server, "HP:0100820", &["HP:0000093", "HP:0003774"]).await;
        mock_descendants(&server, "HP:0000152", &["HP:0000407"]).await;
        mock_roots_except(&server, &["HP:0100820", "HP:0000152"]).await;

        Mock::given(method("GET"))
            .and(path("/network/annotation/NCBIGene:1287"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "phenotypes": [
                    {"id": "HP:0000093", "name": "Proteinuria"},
                    {"id": "HP:0003774", "name": "Stage 5 chronic kidney disease"},
                    {"id": "HP:0000407", "name": "Sensorineural hearing impairment"}
                ],
                "diseases": [{"id": "OMIM:301050", "name": "Alport syndrome"}]
            })))
            .mount(&server)
            .await;

        let (_dir, cache) = scratch_cache();
        let annotator = HpoAnnotator::new_for_test(server.uri(), cache);
        let mut gene = Gene::new(GeneId(1), "COL4A5", "HGNC:2207");
        gene.ncbi_gene_id = Some("1287".to_string());

        let payload = annotator.fetch_annotation(&gene).await.expect("fetch");
        assert!(annotator.is_valid(&payload));

        let classification = &payload["classification"];
        assert_eq!(classification["is_syndromic"], json!(true));
        assert!(
            classification["syndromic_category_scores"]["head_neck"]
                .as_f64()
                .expect("score")
                > 0.0
        );
        assert_eq!(
            classification["primary_clinical_group"],
            json!("glomerulopathy")
        );
    }

    #[tokio::test]
    async fn cystic_gene_with_only_renal_terms_stays_isolated() {
        let server = MockServer::start().await;
        mock_descendants(&server, "HP:0000107", &["HP:0000107", "HP:0005562"]).await;
        mock_roots_except(&server, &["HP:0000107"]).await;

        Mock::given(method("GET"))
            .and(path("/network/annotation/NCBIGene:5310"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "phenotypes": [
                    {"id": "HP:0000107", "name": "Renal cyst"},
                    {"id": "HP:0005562", "name": "Multiple renal cysts"}
                ],
                "diseases": [{"id": "OMIM:173900", "name": "Polycystic kidney disease 1"}]
            })))
            .mount(&server)
            .await;

        let (_dir, cache) = scratch_cache();
        let annotator = HpoAnnotator::new_for_test(server.uri(), cache);
        let mut gene = Gene::new(GeneId(1), "PKD1", "HGNC:9008");
        gene.ncbi_gene_id = Some("5310".to_string());

        let payload = annotator.fetch_annotation(&gene).await.expect("fetch");
        let classification = &payload["classification"];
        assert_eq!(classification["is_syndromic"], json!(false));
        assert_eq!(classification["primary_clinical_group"], json!("cyst_cilio"));
    }

    #[tokio::test]
    async fn empty_phenotype_arrays_are_still_valid() {
        let server = MockServer::start().await;
        mock_roots_except(&server, &[]).await;
        Mock::given(method("GET"))
            .and(path("/network/annotation/NCBIGene:999"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "phenotypes": [],
                "diseases": []
            })))
            .mount(&server)
            .await;

        let (_dir, cache) = scratch_cache();
        let annotator = HpoAnnotator::new_for_test(server.uri(), cache);
        let mut gene = Gene::new(GeneId(1), "NEWGENE", "HGNC:999");
        gene.ncbi_gene_id = Some("999".to_string());

        let payload = annotator.fetch_annotation(&gene).await.expect("fetch");
        assert!(annotator.is_valid(&payload));
        assert_eq!(
            payload["classification"]["confidence"],
            json!("insufficient")
        );
    }

    #[tokio::test]
    async fn descendant_closures_are_cached_across_fetches() {
        let server = MockServer::start().await;
        for (_, _, root) in CLINICAL_ROOTS {
            let terms = json!([{"id": "HP:0000001"}]);
            Mock::given(method("GET"))
                .and(path(format!("/hp/terms/{root}/descendants")))
                .respond_with(ResponseTemplate::new(200).set_body_json(terms))
                .expect(1)
                .mount(&server)
                .await;
        }
        for (_, root) in ONSET_ROOTS {
            mock_descendants(&server, root, &[]).await;
        }
        for (_, root) in SYNDROMIC_ROOTS {
            mock_descendants(&server, root, &[]).await;
        }

        let (_dir, cache) = scratch_cache();
        let annotator = HpoAnnotator::new_for_test(server.uri(), cache.clone());
        annotator
            .classification_for(&["HP:0000001".to_string()])
            .await
            .expect("first");
        annotator
            .classification_for(&["HP:0000001".to_string()])
            .await
            .expect("second uses the OnceCell");

        // A fresh annotator over the same cache reads the persisted
        // closures instead of refetching (expect(1) above enforces it).
        let annotator2 = HpoAnnotator::new_for_test(server.uri(), cache);
        annotator2
            .classification_for(&["HP:0000001".to_string()])
            .await
            .expect("third uses the persistent cache");
    }
}
