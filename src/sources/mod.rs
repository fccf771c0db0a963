//! Shared HTTP substrate and evidence ingestion sources.
//!
//! Every upstream client goes through one [`SourceClient`]: rate limiting,
//! retry with backoff, a circuit breaker, and an optional disk-backed HTTP
//! cache, all configured per source from [`crate::config::SourceConfig`].

use std::borrow::Cow;
use std::time::Duration;

use http_cache_reqwest::{
    CACacheManager, Cache, CacheMode, CacheOptions, HttpCache, HttpCacheOptions,
};
use reqwest::StatusCode;
use reqwest::header::{CACHE_CONTROL, HeaderMap, HeaderValue};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::config::SourceConfig;
use crate::error::IngestError;

pub(crate) mod circuit;
pub(crate) mod gencc;
pub(crate) mod ingest;
pub(crate) mod kidney;
pub(crate) mod panelapp;
pub(crate) mod pubtator;
pub(crate) mod rate_limit;
pub(crate) mod retry;
pub(crate) mod uploads;

pub(crate) use circuit::CircuitBreaker;
pub(crate) use rate_limit::RateLimiter;
pub(crate) use retry::RetryPolicy;

const ERROR_BODY_MAX_BYTES: usize = 2048;
pub(crate) const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Outer timeout for any single HTTP request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) fn env_base(default: &'static str, env_var: &str) -> Cow<'static, str> {
    std::env::var(env_var)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(Cow::Owned)
        .unwrap_or_else(|| Cow::Borrowed(default))
}

pub(crate) fn ncbi_api_key() -> Option<String> {
    std::env::var("NCBI_API_KEY")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn append_ncbi_api_key(req: RequestBuilder, api_key: Option<&str>) -> RequestBuilder {
    if let Some(key) = api_key {
        return req.query(&[("api_key", key)]);
    }
    req
}

fn http_cache_dir() -> std::path::PathBuf {
    match dirs::cache_dir() {
        Some(dir) => dir.join("nephro-ingest").join("http-cacache"),
        None => std::env::temp_dir().join("nephro-ingest").join("http-cacache"),
    }
}

/// Builds the middleware client for one source. With `use_http_cache`,
/// GET responses are cached on disk keyed by URL + params; only success
/// responses are written, and `max-stale=86400` makes header-less upstream
/// responses usable for 24h.
fn build_client(use_http_cache: bool) -> Result<ClientWithMiddleware, IngestError> {
    let mut default_headers = HeaderMap::new();
    default_headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-stale=86400"));

    let base_client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("nephro-ingest/", env!("CARGO_PKG_VERSION")))
        .default_headers(default_headers)
        .build()
        .map_err(IngestError::HttpClientInit)?;

    if !use_http_cache {
        return Ok(ClientBuilder::new(base_client).build());
    }

    let cache_path = http_cache_dir();
    std::fs::create_dir_all(&cache_path)?;

    let cache_options = HttpCacheOptions {
        cache_options: Some(CacheOptions {
            // Shared-cache semantics: never store private/authenticated responses.
            shared: true,
            ..CacheOptions::default()
        }),
        ..HttpCacheOptions::default()
    };

    Ok(ClientBuilder::new(base_client)
        .with(Cache(HttpCache {
            mode: CacheMode::Default,
            manager: CACacheManager { path: cache_path },
            options: cache_options,
        }))
        .build())
}

/// One rate-limited, retrying, circuit-broken HTTP client instance.
/// Ingestion and annotation sources each own one.
pub(crate) struct SourceClient {
    api: &'static str,
    client: ClientWithMiddleware,
    retry: RetryPolicy,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
}

impl SourceClient {
    pub(crate) fn new(
        api: &'static str,
        config: &SourceConfig,
        use_http_cache: bool,
    ) -> Result<Self, IngestError> {
        Ok(Self {
            api,
            client: build_client(use_http_cache)?,
            retry: RetryPolicy::with_max_retries(config.max_retries),
            limiter: RateLimiter::new(config.requests_per_second),
            breaker: CircuitBreaker::new(
                api,
                config.circuit_breaker_threshold,
                Duration::from_secs(config.circuit_recovery_secs),
            ),
        })
    }

    /// Uncached, unjittered variant for tests: deterministic timing, no
    /// disk cache.
    #[cfg(test)]
    pub(crate) fn new_for_test(api: &'static str, max_retries: u32) -> Self {
        let base_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("test client");
        Self {
            api,
            client: ClientBuilder::new(base_client).build(),
            retry: RetryPolicy {
                max_retries,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                exponential_base: 2.0,
                jitter: false,
            },
            limiter: RateLimiter::new(1000.0),
            breaker: CircuitBreaker::new(api, 5, Duration::from_secs(60)),
        }
    }

    pub(crate) fn get(&self, url: &str) -> RequestBuilder {
        self.client.get(url)
    }

    pub(crate) fn post(&self, url: &str) -> RequestBuilder {
        self.client.post(url)
    }

    /// Sends with rate limiting, retry-with-backoff and the circuit
    /// breaker. `build_request` is invoked per attempt so request bodies
    /// can be reconstructed. Returns the terminal response status plus
    /// body; non-retryable statuses are returned to the caller undecoded.
    pub(crate) async fn send_with_retry<F>(
        &self,
        build_request: F,
    ) -> Result<(StatusCode, Option<HeaderValue>, Vec<u8>), IngestError>
    where
        F: Fn() -> RequestBuilder,
    {
        let total_attempts = self.retry.max_retries.saturating_add(1);
        let mut last_err: Option<IngestError> = None;

        for attempt in 0..total_attempts {
            // Re-check per attempt: once the breaker opens, remaining
            // retries are suppressed and fail fast.
            self.breaker.check().await?;
            self.limiter.acquire().await;

            match build_request().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if retry::is_retryable_status(status) {
                        let retry_after = retry::parse_retry_after(resp.headers());
                        self.breaker.record_failure().await;
                        last_err = Some(IngestError::Api {
                            api: self.api.to_string(),
                            message: format!("HTTP {status}"),
                        });
                        if attempt + 1 < total_attempts {
                            tokio::time::sleep(self.retry.delay_for(attempt, retry_after)).await;
                        }
                        continue;
                    }

                    let content_type = resp.headers().get(reqwest::header::CONTENT_TYPE).cloned();
                    let bytes = read_limited_body(resp, self.api).await?;
                    if status.is_success() {
                        self.breaker.record_success().await;
                    }
                    return Ok((status, content_type, bytes));
                }
                Err(err) => {
                    let transient = matches!(
                        &err,
                        reqwest_middleware::Error::Reqwest(e) if e.is_timeout() || e.is_connect()
                    );
                    if !transient {
                        return Err(err.into());
                    }
                    self.breaker.record_failure().await;
                    last_err = Some(err.into());
                    if attempt + 1 < total_attempts {
                        tokio::time::sleep(self.retry.delay_for(attempt, None)).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| IngestError::Api {
            api: self.api.to_string(),
            message: format!("All retry attempts exhausted after {total_attempts} attempts"),
        }))
    }

    /// GET + JSON decode. Non-success statuses are errors.
    pub(crate) async fn get_json<T, F>(&self, build_request: F) -> Result<T, IngestError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        match self.get_json_opt(build_request).await? {
            Some(value) => Ok(value),
            None => Err(IngestError::Api {
                api: self.api.to_string(),
                message: "HTTP 404".to_string(),
            }),
        }
    }

    /// GET + JSON decode, mapping 404 to `None`. Annotation sources use
    /// this to distinguish a valid not-found from a transient failure.
    pub(crate) async fn get_json_opt<T, F>(&self, build_request: F) -> Result<Option<T>, IngestError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let (status, content_type, bytes) = self.send_with_retry(build_request).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let excerpt = body_excerpt(&bytes);
            return Err(IngestError::Api {
                api: self.api.to_string(),
                message: format!("HTTP {status}: {excerpt}"),
            });
        }
        ensure_json_content_type(self.api, content_type.as_ref(), &bytes)?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| IngestError::ApiJson {
                api: self.api.to_string(),
                source,
            })
    }

    /// POST a JSON body and decode the JSON response (GraphQL endpoints).
    pub(crate) async fn post_json<T, B, F>(&self, body: &B, build_request: F) -> Result<T, IngestError>
    where
        T: DeserializeOwned,
        B: Serialize,
        F: Fn() -> RequestBuilder,
    {
        let payload = serde_json::to_value(body)?;
        let (status, content_type, bytes) = self
            .send_with_retry(|| build_request().json(&payload))
            .await?;
        if !status.is_success() {
            let excerpt = body_excerpt(&bytes);
            return Err(IngestError::Api {
                api: self.api.to_string(),
                message: format!("HTTP {status}: {excerpt}"),
            });
        }
        ensure_json_content_type(self.api, content_type.as_ref(), &bytes)?;
        serde_json::from_slice(&bytes).map_err(|source| IngestError::ApiJson {
            api: self.api.to_string(),
            source,
        })
    }

    /// GET raw bytes (Excel exports, tabular downloads).
    pub(crate) async fn get_bytes<F>(&self, build_request: F) -> Result<Vec<u8>, IngestError>
    where
        F: Fn() -> RequestBuilder,
    {
        let (status, _, bytes) = self.send_with_retry(build_request).await?;
        if !status.is_success() {
            let excerpt = body_excerpt(&bytes);
            return Err(IngestError::Api {
                api: self.api.to_string(),
                message: format!("HTTP {status}: {excerpt}"),
            });
        }
        Ok(bytes)
    }
}

pub(crate) fn body_excerpt(bytes: &[u8]) -> String {
    let full = String::from_utf8_lossy(bytes);

    let truncated: &str = if full.len() > ERROR_BODY_MAX_BYTES {
        let mut end = ERROR_BODY_MAX_BYTES;
        while end > 0 && !full.is_char_boundary(end) {
            end -= 1;
        }
        &full[..end]
    } else {
        full.as_ref()
    };

    let mut s = truncated.trim().replace(['\n', '\r', '\t'], " ");
    if full.len() > ERROR_BODY_MAX_BYTES {
        s.push_str(" …");
    }
    s
}

pub(crate) fn ensure_json_content_type(
    api: &str,
    content_type: Option<&HeaderValue>,
    body: &[u8],
) -> Result<(), IngestError> {
    let Some(content_type) = content_type else {
        return Ok(());
    };

    let raw = match content_type.to_str() {
        Ok(v) => v.trim(),
        Err(_) => {
            warn!(
                source = api,
                "Response content-type header was not valid UTF-8; attempting JSON parse"
            );
            return Ok(());
        }
    };
    if raw.is_empty() {
        return Ok(());
    }

    let media_type = raw
        .split(';')
        .next()
        .map(str::trim)
        .unwrap_or_default()
        .to_ascii_lowercase();
    let is_html = matches!(media_type.as_str(), "text/html" | "application/xhtml+xml");
    if is_html {
        return Err(IngestError::Api {
            api: api.to_string(),
            message: format!(
                "Unexpected HTML response (content-type: {raw}): {}",
                body_excerpt(body)
            ),
        });
    }

    let is_json = media_type == "application/json"
        || media_type == "text/json"
        || media_type.ends_with("+json");
    if !is_json {
        warn!(
            source = api,
            content_type = raw,
            "Unexpected non-JSON content type; attempting JSON parse for compatibility"
        );
    }

    Ok(())
}

pub(crate) async fn read_limited_body(
    mut resp: reqwest::Response,
    api: &str,
) -> Result<Vec<u8>, IngestError> {
    let mut body: Vec<u8> = Vec::new();

    while let Some(chunk) = resp.chunk().await? {
        let next_len = body.len().saturating_add(chunk.len());
        if next_len > DEFAULT_MAX_BODY_BYTES {
            return Err(IngestError::Api {
                api: api.to_string(),
                message: format!("Response body exceeded {DEFAULT_MAX_BODY_BYTES} bytes"),
            });
        }
        body.extend_from_slice(&chunk);
    }

    Ok(body)
}
