#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum IngestError {
    #[error("HTTP client initialization failed: {0}")]
    HttpClientInit(reqwest::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    #[error("API error from {api}: {message}")]
    Api { api: String, message: String },

    #[error("API JSON error from {api}: {source}")]
    ApiJson {
        api: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Circuit open for {api}: failing fast until the recovery window elapses")]
    CircuitOpen { api: String },

    #[error("Dependency unmet: {source_name} requires {dependency} to complete first")]
    DependencyUnmet {
        source_name: String,
        dependency: String,
    },

    #[error("Invalid annotation from {api} for gene '{gene}': {reason}")]
    InvalidAnnotation {
        api: String,
        gene: String,
        reason: String,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(
        "Checkpoint schema version {found} is not supported (expected {expected}); a full re-run is required"
    )]
    CheckpointVersion { found: u32, expected: u32 },

    #[error("Staging conflict for '{raw}': {reason}")]
    StagingConflict { raw: String, reason: String },

    #[error("Parse error in {context}: {message}")]
    Parse { context: String, message: String },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Excel error: {0}")]
    Excel(#[from] calamine::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Transient failures are retried with backoff; everything else is
    /// surfaced immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(err) => err.is_timeout() || err.is_connect(),
            Self::HttpMiddleware(err) => {
                matches!(err, reqwest_middleware::Error::Reqwest(e) if e.is_timeout() || e.is_connect())
            }
            Self::Api { message, .. } => {
                ["429", "500", "502", "503", "504"]
                    .iter()
                    .any(|code| message.contains(code))
            }
            _ => false,
        }
    }
}

impl From<redb::Error> for IngestError {
    fn from(err: redb::Error) -> Self {
        Self::Cache(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::IngestError;

    #[test]
    fn circuit_open_display_names_the_api() {
        let err = IngestError::CircuitOpen {
            api: "gnomad".to_string(),
        };
        assert!(err.to_string().contains("gnomad"));
        assert!(err.to_string().contains("failing fast"));
    }

    #[test]
    fn dependency_unmet_display_names_both_sources() {
        let err = IngestError::DependencyUnmet {
            source_name: "gtex".to_string(),
            dependency: "hgnc".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("gtex"));
        assert!(msg.contains("hgnc"));
    }

    #[test]
    fn checkpoint_version_display_includes_versions() {
        let err = IngestError::CheckpointVersion {
            found: 9,
            expected: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains('9'));
        assert!(msg.contains("full re-run"));
    }

    #[test]
    fn invalid_annotation_display_includes_gene_and_reason() {
        let err = IngestError::InvalidAnnotation {
            api: "gnomad".to_string(),
            gene: "PKD1".to_string(),
            reason: "all constraint fields null".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("PKD1"));
        assert!(msg.contains("all constraint fields null"));
    }

    #[test]
    fn api_status_errors_are_transient_for_retryable_codes() {
        let transient = IngestError::Api {
            api: "panelapp".to_string(),
            message: "HTTP 503: upstream restarting".to_string(),
        };
        assert!(transient.is_transient());

        let permanent = IngestError::Api {
            api: "panelapp".to_string(),
            message: "HTTP 404: no such panel".to_string(),
        };
        assert!(!permanent.is_transient());
    }
}
