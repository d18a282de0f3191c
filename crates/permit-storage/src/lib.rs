//! Incremental state storage + the shared HTTP client used by every collector.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use permit_core::FailureKind;
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod sqlite;
mod state;

pub use sqlite::SqliteStateStore;
pub use state::{ArchiveFilter, ArchiveWrite, MemoryStateStore, StateError, StateStore};

pub const CRATE_NAME: &str = "permit-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Budget for a single buffered request. Streaming bodies are bounded by the
    /// caller's own deadline instead.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http client is shutting down")]
    Shutdown,
}

impl FetchError {
    /// Throttling, server errors and transport problems clear up on their own;
    /// any other 4xx means the endpoint or query no longer matches.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            FetchError::Request(_) | FetchError::Shutdown => FailureKind::Transient,
            FetchError::HttpStatus { status, .. } => {
                let retryable = StatusCode::from_u16(*status)
                    .map(|s| classify_status(s) == RetryDisposition::Retryable)
                    .unwrap_or(false);
                if retryable {
                    FailureKind::Transient
                } else {
                    FailureKind::Structural
                }
            }
        }
    }
}

/// A successful response whose body is read incrementally. Holds the
/// concurrency permits until dropped.
#[derive(Debug)]
pub struct StreamingResponse {
    pub final_url: String,
    response: reqwest::Response,
    _global: OwnedSemaphorePermit,
    _source: OwnedSemaphorePermit,
}

impl StreamingResponse {
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        Ok(self.response.chunk().await?.map(|bytes| bytes.to_vec()))
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            timeout: config.timeout,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    async fn permits(
        &self,
        source_id: &str,
    ) -> Result<(OwnedSemaphorePermit, OwnedSemaphorePermit), FetchError> {
        let global = self
            .global_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Shutdown)?;
        let source = self
            .per_source_semaphore(source_id)
            .await
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Shutdown)?;
        Ok((global, source))
    }

    /// Sends GET with retry/backoff and returns the first successful response.
    async fn send_with_retry(
        &self,
        url: &Url,
        per_request_timeout: Option<Duration>,
    ) -> Result<reqwest::Response, FetchError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.get(url.clone());
            if let Some(timeout) = per_request_timeout {
                request = request.timeout(timeout);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying after status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &Url,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url = %url);
        async {
            let (_global, _source) = self.permits(source_id).await?;
            let resp = self.send_with_retry(url, Some(self.timeout)).await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    /// Opens a response for chunked reading. Only connection setup is retried;
    /// a failure mid-body surfaces from [`StreamingResponse::next_chunk`].
    pub async fn open_stream(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &Url,
    ) -> Result<StreamingResponse, FetchError> {
        let span = info_span!("http_stream", %run_id, source_id, url = %url);
        async {
            let (global, source) = self.permits(source_id).await?;
            let response = self.send_with_retry(url, None).await?;
            Ok(StreamingResponse {
                final_url: response.url().to_string(),
                response,
                _global: global,
                _source: source,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn status_classification_drives_failure_kind() {
        let throttled = FetchError::HttpStatus {
            status: 429,
            url: "https://example.test".into(),
        };
        let outage = FetchError::HttpStatus {
            status: 503,
            url: "https://example.test".into(),
        };
        let gone = FetchError::HttpStatus {
            status: 404,
            url: "https://example.test".into(),
        };
        assert_eq!(throttled.failure_kind(), FailureKind::Transient);
        assert_eq!(outage.failure_kind(), FailureKind::Transient);
        assert_eq!(gone.failure_kind(), FailureKind::Structural);
        assert_eq!(FetchError::Shutdown.failure_kind(), FailureKind::Transient);
    }

    #[test]
    fn fetcher_builds_with_defaults() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agent: Some("permit-bot/0.1".into()),
            ..Default::default()
        });
        assert!(fetcher.is_ok());
    }
}
