//! HTTP plumbing shared by source adapters and the enrichment client.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
pub use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

/// Whether a failed source-listing fetch is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Campaign sites throttle with 429 and flap with 5xx during deploys; both are
/// retried. Any other non-success status ends the page fetch.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Timeouts and connection failures are retried; decode and builder errors are not.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Retry budget for one listing-page request made through [`HttpFetcher`].
///
/// The enrichment client keeps its own key-rotation pacing and does not use this.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Retries after the first request, so a page costs at most `max_retries + 1` requests.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Pause before retry `retry` (zero-based): `base_delay * 2^retry`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, retry: usize) -> Duration {
        let factor = 1u32.checked_shl(retry as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// GET request description: URL, query pairs and extra headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
}

/// One HTTP attempt. Non-success statuses come back as responses, not errors;
/// callers own their retry and status policy.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError>;
}

/// reqwest-backed transport with a concurrency cap.
#[derive(Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let mut builder = self.client.get(&request.url).query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

/// Retrying JSON fetcher used by the source adapters.
#[derive(Clone)]
pub struct HttpFetcher {
    transport: Arc<dyn HttpTransport>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(&config)?;
        Ok(Self::with_transport(Arc::new(transport), config.backoff))
    }

    pub fn with_transport(transport: Arc<dyn HttpTransport>, backoff: BackoffPolicy) -> Self {
        Self { transport, backoff }
    }

    pub fn transport(&self) -> Arc<dyn HttpTransport> {
        self.transport.clone()
    }

    /// Fetch and decode JSON, retrying transient failures with exponential backoff.
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        run_id: Uuid,
        source_id: &str,
        request: &HttpRequest,
    ) -> Result<T, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url = %request.url);

        async {
            let mut attempt = 0usize;
            loop {
                match self.transport.send(request).await {
                    Ok(resp) if resp.status.is_success() => return resp.json(),
                    Ok(resp) => {
                        if classify_status(resp.status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(status = resp.status.as_u16(), attempt, "retryable status");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::HttpStatus {
                            status: resp.status.as_u16(),
                            url: resp.final_url,
                        });
                    }
                    Err(FetchError::Request(err))
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries =>
                    {
                        warn!(error = %err, attempt, "retryable request failure");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }
}
