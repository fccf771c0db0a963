use std::borrow::Cow;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::SourceConfig;
use crate::entities::{Gene, SourceName};
use crate::error::IngestError;
use crate::sources::SourceClient;

const ALLIANCE_BASE: &str = "https://www.alliancegenome.org/api";
const MGI_API: &str = "mgi";
const MGI_BASE_ENV: &str = "NEPHRO_MGI_BASE";

const PHENOTYPE_PAGE_LIMIT: u32 = 200;

/// Mouse ortholog phenotypes (MPO terms) via the Alliance of Genome
/// Resources gene endpoint, keyed by HGNC id.
pub(crate) struct MgiAnnotator {
    http: SourceClient,
    base: Cow<'static, str>,
    cache_ttl_days: u32,
}

impl MgiAnnotator {
    pub(crate) fn new(config: &SourceConfig) -> Result<Self, IngestError> {
        Ok(Self {
            http: SourceClient::new(MGI_API, config, true)?,
            base: crate::sources::env_base(ALLIANCE_BASE, MGI_BASE_ENV),
            cache_ttl_days: config.cache_ttl_days,
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(base: String) -> Self {
        Self {
            http: SourceClient::new_for_test(MGI_API, 1),
            base: Cow::Owned(base),
            cache_ttl_days: 30,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PhenotypePage {
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    results: Vec<PhenotypeRow>,
}

#[derive(Debug, Deserialize)]
struct PhenotypeRow {
    #[serde(default)]
    phenotype: Option<String>,
}

#[async_trait]
impl super::AnnotationSource for MgiAnnotator {
    fn source_name(&self) -> SourceName {
        SourceName::Mgi
    }

    fn version(&self) -> &'static str {
        "alliance-v7"
    }

    fn cache_ttl_days(&self) -> u32 {
        self.cache_ttl_days
    }

    async fn fetch_annotation(&self, gene: &Gene) -> Result<serde_json::Value, IngestError> {
        let url = format!(
            "{}/gene/{}/phenotypes",
            self.base.as_ref().trim_end_matches('/'),
            gene.hgnc_id
        );
        let limit = PHENOTYPE_PAGE_LIMIT.to_string();
        let page: Option<PhenotypePage> = self
            .http
            .get_json_opt(|| self.http.get(&url).query(&[("limit", limit.as_str())]))
            .await?;

        // 404 means the Alliance knows no ortholog for this gene; that is
        // a valid "no mouse data" annotation, not a failure.
        let page = page.unwrap_or_default();
        let phenotypes: Vec<String> = page
            .results
            .into_iter()
            .filter_map(|row| row.phenotype)
            .collect();

        Ok(json!({
            "gene_symbol": gene.approved_symbol,
            "hgnc_id": gene.hgnc_id,
            "ortholog_phenotypes": phenotypes,
            "total": page.total,
        }))
    }

    fn is_valid(&self, annotation: &serde_json::Value) -> bool {
        let has_symbol = annotation
            .get("gene_symbol")
            .and_then(|v| v.as_str())
            .is_some_and(|s| !s.is_empty());
        has_symbol
            && annotation
                .get("ortholog_phenotypes")
                .is_some_and(|v| v.is_array())
    }
}
