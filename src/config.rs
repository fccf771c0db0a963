//! Declarative per-source configuration registry.
//!
//! Defaults live in code; an optional JSON file overrides individual keys
//! per source. The registry is immutable once built — "reload" means
//! constructing a new registry and rebuilding source instances from it.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::entities::SourceName;
use crate::error::IngestError;

/// Normalizer disposition thresholds (see the gene normalizer).
pub const AUTO_ACCEPT_CONFIDENCE: f64 = 0.9;
pub const REJECT_CONFIDENCE: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub source: SourceName,
    pub requests_per_second: f64,
    pub max_retries: u32,
    pub cache_ttl_days: u32,
    pub min_threshold: u64,
    pub min_threshold_enabled: bool,
    pub circuit_breaker_threshold: u32,
    pub circuit_recovery_secs: u64,
    /// Inclusion terms for the kidney predicate. These are matched as
    /// whole regex alternatives, never bare substrings.
    pub kidney_include: Vec<String>,
    pub kidney_exclude: Vec<String>,
}

impl SourceConfig {
    pub fn defaults_for(source: SourceName) -> Self {
        let (requests_per_second, cache_ttl_days, min_threshold) = match source {
            // NCBI budget without an API key is 3 req/s.
            SourceName::Pubtator => (3.0, 7, 3),
            SourceName::Clinvar => (3.0, 30, 1),
            SourceName::Gencc => (1.0, 7, 1),
            SourceName::PanelappUk | SourceName::PanelappAu => (5.0, 7, 1),
            SourceName::DiagnosticPanels => (1.0, 7, 2),
            SourceName::Literature => (1.0, 7, 2),
            SourceName::Hgnc => (10.0, 90, 1),
            SourceName::Gnomad => (5.0, 30, 1),
            SourceName::Hpo => (5.0, 30, 1),
            SourceName::Mgi => (3.0, 30, 1),
            SourceName::StringDb => (3.0, 30, 1),
            SourceName::Gtex => (2.0, 30, 1),
            SourceName::Descartes => (2.0, 30, 1),
        };

        Self {
            source,
            requests_per_second,
            max_retries: 3,
            cache_ttl_days,
            min_threshold,
            min_threshold_enabled: true,
            circuit_breaker_threshold: 5,
            circuit_recovery_secs: 60,
            kidney_include: vec![
                "kidney".to_string(),
                "renal".to_string(),
                "nephro".to_string(),
            ],
            kidney_exclude: vec!["adrenal".to_string()],
        }
    }

    /// Minimum gap between two outbound requests for this source.
    pub fn min_request_interval(&self) -> Duration {
        if self.requests_per_second <= 0.0 {
            return Duration::from_secs(1);
        }
        Duration::from_secs_f64(1.0 / self.requests_per_second)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceOverride {
    requests_per_second: Option<f64>,
    max_retries: Option<u32>,
    cache_ttl_days: Option<u32>,
    /// Accepts any JSON value; coerced to an integer >= 1 with a warning
    /// on anything else.
    min_threshold: Option<serde_json::Value>,
    min_threshold_enabled: Option<bool>,
    circuit_breaker_threshold: Option<u32>,
    circuit_recovery_secs: Option<u64>,
    kidney_include: Option<Vec<String>>,
    kidney_exclude: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    sources: BTreeMap<String, SourceOverride>,
    annotation_parallelism: Option<usize>,
    pause_check_interval: Option<u64>,
}

/// Validated process-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    sources: BTreeMap<SourceName, SourceConfig>,
    /// Bound on concurrently running sources (semaphore width).
    pub annotation_parallelism: usize,
    /// Pause flag is checked every this many genes.
    pub pause_check_interval: u64,
}

impl Default for Config {
    fn default() -> Self {
        let sources = SourceName::ALL
            .iter()
            .map(|source| (*source, SourceConfig::defaults_for(*source)))
            .collect();
        Self {
            sources,
            annotation_parallelism: 3,
            pause_check_interval: 50,
        }
    }
}

impl Config {
    /// Loads defaults, then applies overrides from `path` when given.
    /// Unknown source names refuse to start; malformed thresholds coerce
    /// to safe values with a warning.
    pub fn load(path: Option<&Path>) -> Result<Self, IngestError> {
        let mut config = Self::default();
        let Some(path) = path else {
            return Ok(config);
        };

        let raw = std::fs::read_to_string(path)?;
        let file: ConfigFile = serde_json::from_str(&raw)
            .map_err(|err| IngestError::Config(format!("{}: {err}", path.display())))?;
        config.apply(file)?;
        Ok(config)
    }

    fn apply(&mut self, file: ConfigFile) -> Result<(), IngestError> {
        for (name, over) in file.sources {
            let source = SourceName::from_str(&name)?;
            let entry = self
                .sources
                .get_mut(&source)
                .ok_or_else(|| IngestError::Config(format!("no defaults for source {source}")))?;

            if let Some(rps) = over.requests_per_second {
                if rps > 0.0 && rps.is_finite() {
                    entry.requests_per_second = rps;
                } else {
                    warn!(
                        source = source.as_str(),
                        value = rps,
                        "Ignoring non-positive requests_per_second override"
                    );
                }
            }
            if let Some(max_retries) = over.max_retries {
                entry.max_retries = max_retries;
            }
            if let Some(ttl) = over.cache_ttl_days {
                entry.cache_ttl_days = ttl;
            }
            if let Some(raw_threshold) = over.min_threshold {
                entry.min_threshold = coerce_threshold(source, &raw_threshold);
            }
            if let Some(enabled) = over.min_threshold_enabled {
                entry.min_threshold_enabled = enabled;
            }
            if let Some(threshold) = over.circuit_breaker_threshold {
                if threshold == 0 {
                    warn!(
                        source = source.as_str(),
                        "circuit_breaker_threshold 0 would trip permanently; using 1"
                    );
                    entry.circuit_breaker_threshold = 1;
                } else {
                    entry.circuit_breaker_threshold = threshold;
                }
            }
            if let Some(secs) = over.circuit_recovery_secs {
                entry.circuit_recovery_secs = secs;
            }
            if let Some(include) = over.kidney_include {
                validate_kidney_terms(source, &include)?;
                entry.kidney_include = include;
            }
            if let Some(exclude) = over.kidney_exclude {
                entry.kidney_exclude = exclude;
            }
        }

        if let Some(parallelism) = file.annotation_parallelism {
            self.annotation_parallelism = parallelism.clamp(1, 8);
        }
        if let Some(interval) = file.pause_check_interval {
            self.pause_check_interval = interval.max(1);
        }
        Ok(())
    }

    pub fn source(&self, source: SourceName) -> &SourceConfig {
        // Every SourceName has a default entry; Default::default fills the map.
        &self.sources[&source]
    }
}

/// Thresholds must be integers >= 1; anything else coerces to 1 with a
/// warning so a typo in config never silently disables filtering.
fn coerce_threshold(source: SourceName, raw: &serde_json::Value) -> u64 {
    match raw.as_u64() {
        Some(value) if value >= 1 => value,
        _ => {
            warn!(
                source = source.as_str(),
                value = %raw,
                "Invalid min_threshold (must be an integer >= 1); using 1"
            );
            1
        }
    }
}

/// Bare short substrings as inclusion terms reproduce the historical
/// false-positive matching (brain genes via "tubul"); refuse them outright.
fn validate_kidney_terms(source: SourceName, terms: &[String]) -> Result<(), IngestError> {
    for term in terms {
        let trimmed = term.trim();
        if trimmed.len() < 4 {
            return Err(IngestError::Config(format!(
                "kidney_include term '{trimmed}' for {source} is too short; \
                 broad substrings are not allowed as inclusion terms"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_source() {
        let config = Config::default();
        for source in SourceName::ALL {
            let entry = config.source(source);
            assert!(entry.requests_per_second > 0.0);
            assert!(entry.min_threshold >= 1);
        }
    }

    #[test]
    fn clinvar_defaults_respect_ncbi_rate_budget() {
        let config = Config::default();
        assert!(config.source(SourceName::Clinvar).requests_per_second <= 3.0);
        assert!(
            config
                .source(SourceName::Clinvar)
                .min_request_interval()
                .as_millis()
                >= 333
        );
    }

    #[test]
    fn apply_coerces_bad_thresholds_to_one() {
        let mut config = Config::default();
        let file: ConfigFile = serde_json::from_str(
            r#"{"sources": {"pubtator": {"min_threshold": 2.5}, "literature": {"min_threshold": -4}}}"#,
        )
        .expect("parse");
        config.apply(file).expect("apply");
        assert_eq!(config.source(SourceName::Pubtator).min_threshold, 1);
        assert_eq!(config.source(SourceName::Literature).min_threshold, 1);
    }

    #[test]
    fn apply_rejects_unknown_source_names() {
        let mut config = Config::default();
        let file: ConfigFile =
            serde_json::from_str(r#"{"sources": {"omim": {"max_retries": 2}}}"#).expect("parse");
        let err = config.apply(file).expect_err("unknown source");
        assert!(err.to_string().contains("omim"));
    }

    #[test]
    fn apply_rejects_short_kidney_inclusion_terms() {
        let mut config = Config::default();
        let file: ConfigFile = serde_json::from_str(
            r#"{"sources": {"panelapp_uk": {"kidney_include": ["tub"]}}}"#,
        )
        .expect("parse");
        let err = config.apply(file).expect_err("short term");
        assert!(err.to_string().contains("too short"));
    }

    #[test]
    fn apply_keeps_valid_overrides() {
        let mut config = Config::default();
        let file: ConfigFile = serde_json::from_str(
            r#"{
                "sources": {"pubtator": {"min_threshold": 5, "requests_per_second": 10.0}},
                "annotation_parallelism": 2
            }"#,
        )
        .expect("parse");
        config.apply(file).expect("apply");
        assert_eq!(config.source(SourceName::Pubtator).min_threshold, 5);
        assert!((config.source(SourceName::Pubtator).requests_per_second - 10.0).abs() < 1e-9);
        assert_eq!(config.annotation_parallelism, 2);
    }

    #[test]
    fn zero_circuit_threshold_coerces_to_one() {
        let mut config = Config::default();
        let file: ConfigFile = serde_json::from_str(
            r#"{"sources": {"gnomad": {"circuit_breaker_threshold": 0}}}"#,
        )
        .expect("parse");
        config.apply(file).expect("apply");
        assert_eq!(config.source(SourceName::Gnomad).circuit_breaker_threshold, 1);
    }
}
