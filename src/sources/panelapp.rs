//! PanelApp (Genomics England / Australian Genomics) panel ingestion.
//!
//! Panels come from a paginated listing; kidney relevance is decided by
//! the two-stage predicate (keyword candidates, then per-panel fields).
//! GREEN and AMBER memberships count as evidence, RED never does.

use std::borrow::Cow;
use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::SourceConfig;
use crate::entities::{EvidenceProvenance, SourceName};
use crate::error::IngestError;
use crate::filter::filter_in_memory;
use crate::sources::SourceClient;
use crate::sources::ingest::{DataSource, IngestContext, IngestReport, IngestRun, write_evidence_batch};
use crate::sources::kidney::KidneyPredicate;
use crate::utils::serde::StringOrVec;

const PANELAPP_UK_BASE: &str = "https://panelapp.genomicsengland.co.uk/api/v1";
const PANELAPP_AU_BASE: &str = "https://panelapp-aus.org/api/v1";
const PANELAPP_UK_BASE_ENV: &str = "NEPHRO_PANELAPP_UK_BASE";
const PANELAPP_AU_BASE_ENV: &str = "NEPHRO_PANELAPP_AU_BASE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PanelAppRegion {
    Uk,
    Australia,
}

impl PanelAppRegion {
    fn source_name(self) -> SourceName {
        match self {
            Self::Uk => SourceName::PanelappUk,
            Self::Australia => SourceName::PanelappAu,
        }
    }

    fn api(self) -> &'static str {
        match self {
            Self::Uk => "panelapp-uk",
            Self::Australia => "panelapp-au",
        }
    }

    fn default_base(self) -> (&'static str, &'static str) {
        match self {
            Self::Uk => (PANELAPP_UK_BASE, PANELAPP_UK_BASE_ENV),
            Self::Australia => (PANELAPP_AU_BASE, PANELAPP_AU_BASE_ENV),
        }
    }
}

pub(crate) struct PanelAppSource {
    region: PanelAppRegion,
    http: SourceClient,
    base: Cow<'static, str>,
    kidney: KidneyPredicate,
}

impl PanelAppSource {
    pub(crate) fn new(region: PanelAppRegion, config: &SourceConfig) -> Result<Self, IngestError> {
        let (default_base, env_var) = region.default_base();
        Ok(Self {
            region,
            http: SourceClient::new(region.api(), config, true)?,
            base: crate::sources::env_base(default_base, env_var),
            kidney: KidneyPredicate::from_config(config)?,
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(
        region: PanelAppRegion,
        base: String,
        config: &SourceConfig,
    ) -> Self {
        Self {
            region,
            http: SourceClient::new_for_test(region.api(), 1),
            base: Cow::Owned(base),
            kidney: KidneyPredicate::from_config(config).expect("kidney predicate"),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base.as_ref().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Walks the paginated panel listing to the end.
    async fn list_panels(&self) -> Result<Vec<PanelSummary>, IngestError> {
        let mut panels = Vec::new();
        let mut page = 1u32;
        loop {
            let url = self.endpoint("panels/");
            let page_param = page.to_string();
            let response: PanelPage = self
                .http
                .get_json(|| self.http.get(&url).query(&[("page", page_param.as_str())]))
                .await?;
            panels.extend(response.results);
            if response.next.is_none() {
                break;
            }
            page += 1;
        }
        Ok(panels)
    }

    async fn panel_genes(&self, panel_id: u64) -> Result<Vec<PanelGene>, IngestError> {
        let url = self.endpoint(&format!("panels/{panel_id}/"));
        let detail: PanelDetail = self.http.get_json(|| self.http.get(&url)).await?;
        Ok(detail.genes)
    }
}

#[derive(Debug, Deserialize)]
struct PanelPage {
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    results: Vec<PanelSummary>,
}

#[derive(Debug, Clone, Deserialize)]
struct PanelSummary {
    id: u64,
    name: String,
    #[serde(default)]
    disease_group: Option<String>,
    #[serde(default)]
    relevant_disorders: StringOrVec,
}

#[derive(Debug, Deserialize)]
struct PanelDetail {
    #[serde(default)]
    genes: Vec<PanelGene>,
}

#[derive(Debug, Deserialize)]
struct PanelGene {
    #[serde(default)]
    entity_name: Option<String>,
    #[serde(default)]
    confidence_level: Option<String>,
    #[serde(default)]
    gene_data: Option<PanelGeneData>,
}

#[derive(Debug, Deserialize)]
struct PanelGeneData {
    #[serde(default)]
    gene_symbol: Option<String>,
    #[serde(default)]
    hgnc_id: Option<String>,
}

#[derive(Default)]
struct PanelAccumulator {
    hgnc_id: Option<String>,
    panels: Vec<(u64, String)>,
    ratings: HashMap<String, String>,
}

impl PanelGene {
    fn symbol(&self) -> Option<&str> {
        self.gene_data
            .as_ref()
            .and_then(|d| d.gene_symbol.as_deref())
            .or(self.entity_name.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// GREEN (3) and AMBER (2) memberships are evidence; RED (1) and
    /// anything unrated are not.
    fn rating(&self) -> Option<&'static str> {
        match self.confidence_level.as_deref().map(str::trim) {
            Some("3") => Some("GREEN"),
            Some("2") => Some("AMBER"),
            _ => None,
        }
    }
}

#[async_trait]
impl DataSource for PanelAppSource {
    fn source_name(&self) -> SourceName {
        self.region.source_name()
    }

    async fn ingest(&self, ctx: &IngestContext<'_>) -> Result<IngestRun, IngestError> {
        let source = self.source_name();
        let mut report = IngestReport::new(source);

        let panels = self.list_panels().await?;
        let kidney_panels: Vec<&PanelSummary> = panels
            .iter()
            .filter(|panel| {
                let disorders = panel.relevant_disorders.clone().into_vec();
                self.kidney
                    .matches_panel(&panel.name, panel.disease_group.as_deref(), &disorders)
            })
            .collect();
        info!(
            source = source.as_str(),
            total = panels.len(),
            kidney = kidney_panels.len(),
            "Panel listing filtered"
        );

        let mut memberships: HashMap<String, PanelAccumulator> = HashMap::new();
        for panel in &kidney_panels {
            let genes = self.panel_genes(panel.id).await?;
            for gene in &genes {
                let Some(rating) = gene.rating() else {
                    continue;
                };
                let Some(symbol) = gene.symbol() else {
                    continue;
                };

                let entry = memberships.entry(symbol.to_ascii_uppercase()).or_default();
                if !entry.panels.iter().any(|(id, _)| *id == panel.id) {
                    entry.panels.push((panel.id, panel.name.clone()));
                    entry.ratings.insert(panel.id.to_string(), rating.to_string());
                }
                if let Some(hgnc_id) = gene.gene_data.as_ref().and_then(|d| d.hgnc_id.as_deref()) {
                    entry.hgnc_id.get_or_insert_with(|| hgnc_id.to_string());
                }
            }
            debug!(
                source = source.as_str(),
                panel = panel.name.as_str(),
                genes = genes.len(),
                "Panel processed"
            );
        }

        let mut records: HashMap<String, serde_json::Value> = memberships
            .into_iter()
            .map(|(symbol, acc)| {
                let panels: Vec<serde_json::Value> = acc
                    .panels
                    .iter()
                    .map(|(id, name)| json!({"id": id, "name": name}))
                    .collect();
                let payload = json!({
                    "panel_count": panels.len(),
                    "panels": panels,
                    "ratings": acc.ratings,
                    "hgnc_id": acc.hgnc_id,
                });
                (symbol, payload)
            })
            .collect();

        let stats = filter_in_memory(
            source,
            "panel_count",
            ctx.config.min_threshold,
            &mut records,
            ctx.config.min_threshold_enabled,
        );
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
    use crate::entities::GeneDraft;
    use crate::normalize::GeneNormalizer;
    use crate::store::{EvidenceStore, GeneStore, MemoryStore};
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn panel_gene(symbol: &str, confidence: &str) -> serde_json::Value {
        json!({
            "entity_name": symbol,
            "confidence_level": confidence,
            "gene_data": {"gene_symbol": symbol, "hgnc_id": format!("HGNC:{}", symbol.len())}
        })
    }

    #[tokio::test]
    async fn kidney_panels_produce_evidence_and_others_do_not() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/panels/"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "next": null,
                "results": [
                    {"id": 1, "name": "Renal tubulopathies", "disease_group": "Renal and urinary tract disorders", "relevant_disorders": []},
                    {"id": 2, "name": "Cerebral malformation", "disease_group": "Neurology and neurodevelopmental disorders", "relevant_disorders": []}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/panels/1/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "genes": [panel_gene("SLC12A3", "3")]
            })))
            .expect(1)
            .mount(&server)
            .await;
        // Panel 2 must never be fetched: it fails the kidney predicate.
        Mock::given(method("GET"))
            .and(path("/panels/2/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "genes": [panel_gene("TUBA1A", "3")]
            })))
            .expect(0)
            .mount(&server)
            .await;

        let store = MemoryStore::new();
        for (symbol, hgnc) in [("SLC12A3", "HGNC:10912"), ("TUBA1A", "HGNC:20766")] {
            store
                .upsert_gene(GeneDraft {
                    approved_symbol: symbol.into(),
                    hgnc_id: hgnc.into(),
                    ..Default::default()
                })
                .await
                .expect("seed");
        }

        let config = Config::default().source(SourceName::PanelappUk).clone();
        let normalizer = GeneNormalizer::new_for_test(server.uri());
        let ctx = IngestContext {
            store: &store,
            normalizer: &normalizer,
            config: &config,
            pause: CancellationToken::new(),
        };

        let source =
            PanelAppSource::new_for_test(PanelAppRegion::Uk, server.uri(), &config);
        source.ingest(&ctx).await.expect("ingest");

        let rows = store
            .evidence_for_source(SourceName::PanelappUk)
            .await
            .expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].identifier, "SLC12A3");
        assert_eq!(rows[0].evidence_data["panel_count"], json!(1));
        // TUBA1A has no evidence at all for this source.
        assert!(rows.iter().all(|r| r.identifier != "TUBA1A"));
    }

    #[tokio::test]
    async fn red_genes_are_excluded_from_panel_counts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/panels/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "next": null,
                "results": [
                    {"id": 7, "name": "Cystic kidney disease", "disease_group": null, "relevant_disorders": []}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/panels/7/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "genes": [
                    panel_gene("PKD1", "3"),
                    panel_gene("PKD2", "2"),
                    panel_gene("DSTYK", "1")
                ]
            })))
            .mount(&server)
            .await;

        let store = MemoryStore::new();
        for (symbol, hgnc) in [
            ("PKD1", "HGNC:9008"),
            ("PKD2", "HGNC:9009"),
            ("DSTYK", "HGNC:29043"),
        ] {
            store
                .upsert_gene(GeneDraft {
                    approved_symbol: symbol.into(),
                    hgnc_id: hgnc.into(),
                    ..Default::default()
                })
                .await
                .expect("seed");
        }

        let config = Config::default().source(SourceName::PanelappUk).clone();
        let normalizer = GeneNormalizer::new_for_test(server.uri());
        let ctx = IngestContext {
            store: &store,
            normalizer: &normalizer,
            config: &config,
            pause: CancellationToken::new(),
        };

        let source =
            PanelAppSource::new_for_test(PanelAppRegion::Uk, server.uri(), &config);
        source.ingest(&ctx).await.expect("ingest");

        let rows = store
            .evidence_for_source(SourceName::PanelappUk)
            .await
            .expect("rows");
        let identifiers: Vec<&str> = rows.iter().map(|r| r.identifier.as_str()).collect();
        assert_eq!(identifiers, vec!["PKD1", "PKD2"]);
    }

    #[tokio::test]
    async fn pagination_follows_next_links() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/panels/"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "next": format!("{}/panels/?page=2", server.uri()),
                "results": [
                    {"id": 1, "name": "Renal panel A", "relevant_disorders": []}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/panels/"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "next": null,
                "results": [
                    {"id": 2, "name": "Renal panel B", "relevant_disorders": []}
                ]
            })))
            .mount(&server)
            .await;

        let config = Config::default().source(SourceName::PanelappAu).clone();
        let source =
            PanelAppSource::new_for_test(PanelAppRegion::Australia, server.uri(), &config);
        let panels = source.list_panels().await.expect("panels");
        assert_eq!(panels.len(), 2);
        assert_eq!(panels[1].name, "Renal panel B");
    }
}
