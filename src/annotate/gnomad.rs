use std::borrow::Cow;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::SourceConfig;
use crate::entities::{Gene, SourceName};
use crate::error::IngestError;
use crate::sources::SourceClient;

const GNOMAD_BASE: &str = "https://gnomad.broadinstitute.org/api";
const GNOMAD_API: &str = "gnomad";
const GNOMAD_BASE_ENV: &str = "NEPHRO_GNOMAD_BASE";

const CONSTRAINT_QUERY: &str = r#"
query GeneConstraint($symbol: String!, $referenceGenome: ReferenceGenomeId!) {
  gene(gene_symbol: $symbol, reference_genome: $referenceGenome) {
    gene_id
    symbol
    gnomad_constraint {
      pli
      oe_lof
      oe_lof_upper
      lof_z
      mis_z
      syn_z
    }
  }
}
"#;

/// Loss-of-function constraint metrics from the gnomAD GraphQL endpoint.
pub(crate) struct GnomadAnnotator {
    http: SourceClient,
    base: Cow<'static, str>,
    cache_ttl_days: u32,
}

impl GnomadAnnotator {
    pub(crate) fn new(config: &SourceConfig) -> Result<Self, IngestError> {
        Ok(Self {
            http: SourceClient::new(GNOMAD_API, config, false)?,
            base: crate::sources::env_base(GNOMAD_BASE, GNOMAD_BASE_ENV),
            cache_ttl_days: config.cache_ttl_days,
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(base: String) -> Self {
        Self {
            http: SourceClient::new_for_test(GNOMAD_API, 1),
            base: Cow::Owned(base),
            cache_ttl_days: 30,
        }
    }
}

#[derive(Debug, Serialize)]
struct GraphQlRequest {
    query: &'static str,
    variables: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<GnomadData>,
    #[serde(default)]
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GnomadData {
    gene: Option<GnomadGene>,
}

#[derive(Debug, Deserialize)]
struct GnomadGene {
    symbol: Option<String>,
    gnomad_constraint: Option<GnomadConstraint>,
}

#[derive(Debug, Default, Deserialize)]
struct GnomadConstraint {
    pli: Option<f64>,
    oe_lof: Option<f64>,
    oe_lof_upper: Option<f64>,
    lof_z: Option<f64>,
    mis_z: Option<f64>,
    syn_z: Option<f64>,
}

#[async_trait]
impl super::AnnotationSource for GnomadAnnotator {
    fn source_name(&self) -> SourceName {
        SourceName::Gnomad
    }

    fn version(&self) -> &'static str {
        "gnomad-v4"
    }

    fn cache_ttl_days(&self) -> u32 {
        self.cache_ttl_days
    }

    async fn fetch_annotation(&self, gene: &Gene) -> Result<serde_json::Value, IngestError> {
        let url = format!("{}/graphql", self.base.as_ref().trim_end_matches('/'));
        let body = GraphQlRequest {
            query: CONSTRAINT_QUERY,
            variables: json!({
                "symbol": gene.approved_symbol,
                "referenceGenome": "GRCh38",
            }),
        };

        let resp: GraphQlResponse = self.http.post_json(&body, || self.http.post(&url)).await?;

        if let Some(errors) = resp.errors {
            let message = errors
                .into_iter()
                .filter_map(|e| e.message)
                .collect::<Vec<_>>()
                .join("; ");
            if !message.is_empty() {
                return Err(IngestError::Api {
                    api: GNOMAD_API.to_string(),
                    message,
                });
            }
        }

        let hit = resp.data.and_then(|d| d.gene).ok_or_else(|| IngestError::Api {
            api: GNOMAD_API.to_string(),
            message: format!("no gnomAD gene for symbol '{}'", gene.approved_symbol),
        })?;
        let constraint = hit.gnomad_constraint.unwrap_or_default();

        Ok(json!({
            "gene_symbol": hit.symbol.unwrap_or_else(|| gene.approved_symbol.clone()),
            "pli": constraint.pli,
            "oe_lof": constraint.oe_lof,
            "oe_lof_upper": constraint.oe_lof_upper,
            "lof_z": constraint.lof_z,
            "mis_z": constraint.mis_z,
            "syn_z": constraint.syn_z,
        }))
    }

    /// At least one constraint field must be non-null; an all-null
    /// response is upstream noise and must never be cached.
    fn is_valid(&self, annotation: &serde_json::Value) -> bool {
        let has_symbol = annotation
            .get("gene_symbol")
            .and_then(|v| v.as_str())
            .is_some_and(|s| !s.is_empty());
        let any_constraint = ["pli", "oe_lof", "oe_lof_upper", "lof_z", "mis_z", "syn_z"]
            .iter()
            .any(|key| annotation.get(*key).is_some_and(|v| !v.is_null()));
        has_symbol && any_constraint
    }
}
