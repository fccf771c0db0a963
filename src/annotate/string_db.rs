use std::borrow::Cow;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::SourceConfig;
use crate::entities::{Gene, SourceName};
use crate::error::IngestError;
use crate::sources::SourceClient;

const STRING_BASE: &str = "https://string-db.org/api";
const STRING_API: &str = "string-db";
const STRING_BASE_ENV: &str = "NEPHRO_STRING_BASE";

const HUMAN_TAXON: &str = "9606";
const NETWORK_LIMIT: &str = "50";

/// Protein-protein interaction partners from STRING.
pub(crate) struct StringDbAnnotator {
    http: SourceClient,
    base: Cow<'static, str>,
    cache_ttl_days: u32,
}

impl StringDbAnnotator {
    pub(crate) fn new(config: &SourceConfig) -> Result<Self, IngestError> {
        Ok(Self {
            http: SourceClient::new(STRING_API, config, true)?,
            base: crate::sources::env_base(STRING_BASE, STRING_BASE_ENV),
            cache_ttl_days: config.cache_ttl_days,
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(base: String) -> Self {
        Self {
            http: SourceClient::new_for_test(STRING_API, 1),
            base: Cow::Owned(base),
            cache_ttl_days: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct StringInteraction {
    #[serde(rename = "preferredName_A", alias = "preferredNameA")]
    preferred_name_a: Option<String>,
    #[serde(rename = "preferredName_B", alias = "preferredNameB")]
    preferred_name_b: Option<String>,
    score: Option<f64>,
}

#[async_trait]
impl super::AnnotationSource for StringDbAnnotator {
    fn source_name(&self) -> SourceName {
        SourceName::StringDb
    }

    fn version(&self) -> &'static str {
        "string-v12"
    }

    fn cache_ttl_days(&self) -> u32 {
        self.cache_ttl_days
    }

    async fn fetch_annotation(&self, gene: &Gene) -> Result<serde_json::Value, IngestError> {
        let url = format!(
            "{}/json/network",
            self.base.as_ref().trim_end_matches('/')
        );
        let interactions: Vec<StringInteraction> = self
            .http
            .get_json_opt(|| {
                self.http.get(&url).query(&[
                    ("identifiers", gene.approved_symbol.as_str()),
                    ("species", HUMAN_TAXON),
                    ("limit", NETWORK_LIMIT),
                ])
            })
            .await?
            .unwrap_or_default();

        // Partner = whichever endpoint is not the queried gene.
        let partners: Vec<serde_json::Value> = interactions
            .iter()
            .filter_map(|row| {
                let a = row.preferred_name_a.as_deref()?;
                let b = row.preferred_name_b.as_deref()?;
                let partner = if a.eq_ignore_ascii_case(&gene.approved_symbol) {
                    b
                } else {
                    a
                };
                Some(json!({"partner": partner, "score": row.score}))
            })
            .collect();

        Ok(json!({
            "gene_symbol": gene.approved_symbol,
            "interaction_count": partners.len(),
            "interactions": partners,
        }))
    }

    fn is_valid(&self, annotation: &serde_json::Value) -> bool {
        annotation
            .get("gene_symbol")
            .and_then(|v| v.as_str())
            .is_some_and(|s| !s.is_empty())
            && annotation
                .get("interactions")
                .is_some_and(|v| v.is_array())
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
    async fn maps_interactions_to_partners() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json/network"))
            .and(query_param("identifiers", "PKD1"))
            .and(query_param("species", "9606"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"preferredName_A": "PKD1", "preferredName_B": "PKD2", "score": 0.999},
                {"preferredName_A": "PKHD1", "preferredName_B": "PKD1", "score": 0.92}
            ])))
            .mount(&server)
            .await;

        let annotator = StringDbAnnotator::new_for_test(server.uri());
        let gene = Gene::new(GeneId(1), "PKD1", "HGNC:9008");
        let payload = annotator.fetch_annotation(&gene).await.expect("fetch");

        assert!(annotator.is_valid(&payload));
        assert_eq!(payload["interaction_count"], json!(2));
        assert_eq!(payload["interactions"][0]["partner"], json!("PKD2"));
        assert_eq!(payload["interactions"][1]["partner"], json!("PKHD1"));
    }

    #[tokio::test]
    async fn empty_network_is_valid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json/network"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let annotator = StringDbAnnotator::new_for_test(server.uri());
        let gene = Gene::new(GeneId(1), "LONELY1", "HGNC:1");
        let payload = annotator.fetch_annotation(&gene).await.expect("fetch");
        assert!(annotator.is_valid(&payload));
        assert_eq!(payload["interaction_count"], json!(0));
    }
}
