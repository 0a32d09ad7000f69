// Fetching of raw XML feeds from providers, with retry on transient failures

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ProviderConfig, RetryConfig};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("provider {provider} unavailable after {attempts} attempt(s): {reason}")]
    Transient {
        provider: String,
        reason: String,
        attempts: u32,
    },

    #[error("provider {provider} rejected the request: {reason}")]
    Permanent {
        provider: String,
        status: Option<u16>,
        reason: String,
    },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }

    pub fn provider(&self) -> &str {
        match self {
            FetchError::Transient { provider, .. } | FetchError::Permanent { provider, .. } => provider,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    InvalidUrl,
    Other,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

/// A single GET with a deadline. Retries live above this seam.
#[async_trait]
pub trait HttpTransport: Send + Sync + 'static {
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, TransportError>;
}

/// Anything that can hand back the raw XML document of a provider.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, provider: &ProviderConfig) -> Result<String, FetchError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(transport_error)?;

        Ok(HttpResponse { status, body })
    }
}

fn transport_error(err: reqwest::Error) -> TransportError {
    let kind = if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else if err.is_builder() {
        TransportErrorKind::InvalidUrl
    } else {
        TransportErrorKind::Other
    };
    TransportError::new(kind, err.to_string())
}

#[derive(Debug, Default)]
pub struct ClientStats {
    pub requests_sent: AtomicUsize,
    pub requests_retried: AtomicUsize,
    pub requests_failed: AtomicUsize,
}

// Outcome of one attempt, before the retry loop decides what to do with it
enum Attempt {
    Transient(String),
    Permanent { status: Option<u16>, reason: String },
}

pub struct ProviderClient<T: HttpTransport = ReqwestTransport> {
    transport: T,
    retry: RetryConfig,
    pub stats: ClientStats,
}

impl ProviderClient<ReqwestTransport> {
    pub fn new(retry: RetryConfig) -> Self {
        Self::with_transport(ReqwestTransport::new(), retry)
    }
}

impl<T: HttpTransport> ProviderClient<T> {
    pub fn with_transport(transport: T, retry: RetryConfig) -> Self {
        Self {
            transport,
            retry,
            stats: ClientStats::default(),
        }
    }

    // Exponential backoff with jitter so concurrent workers don't retry in lockstep
    pub fn calculate_backoff(retry_attempt: u32, config: &RetryConfig) -> Duration {
        let base_backoff_ms = (config.initial_backoff_ms as f64
            * config.backoff_multiplier.powf(retry_attempt as f64))
        .min(config.max_backoff_ms as f64);

        let jitter = rand::random::<f64>() * config.jitter_factor * base_backoff_ms;
        let backoff_ms = base_backoff_ms * (1.0 - config.jitter_factor / 2.0) + jitter;

        Duration::from_millis(backoff_ms as u64)
    }

    async fn attempt(&self, provider: &ProviderConfig) -> Result<String, Attempt> {
        let response = match self.transport.get(&provider.url, provider.timeout()).await {
            Ok(response) => response,
            Err(err) => {
                return Err(match err.kind {
                    TransportErrorKind::InvalidUrl => Attempt::Permanent {
                        status: None,
                        reason: err.to_string(),
                    },
                    _ => Attempt::Transient(err.to_string()),
                })
            }
        };

        match response.status {
            200..=299 => String::from_utf8(response.body.to_vec()).map_err(|e| Attempt::Permanent {
                status: Some(response.status),
                reason: format!("response body is not valid UTF-8: {e}"),
            }),
            429 | 500..=599 => Err(Attempt::Transient(format!("HTTP {}", response.status))),
            status => Err(Attempt::Permanent {
                status: Some(status),
                reason: format!("HTTP {status}"),
            }),
        }
    }
}

#[async_trait]
impl<T: HttpTransport> FeedSource for ProviderClient<T> {
    async fn fetch(&self, provider: &ProviderConfig) -> Result<String, FetchError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            self.stats.requests_sent.fetch_add(1, Ordering::Relaxed);
            debug!(provider = %provider.name, url = %provider.url, attempt = attempts, "fetching feed");

            match self.attempt(provider).await {
                Ok(body) => {
                    info!(provider = %provider.name, bytes = body.len(), attempts, "feed fetched");
                    return Ok(body);
                }
                Err(Attempt::Permanent { status, reason }) => {
                    self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(provider = %provider.name, %reason, "feed request rejected");
                    return Err(FetchError::Permanent {
                        provider: provider.name.clone(),
                        status,
                        reason,
                    });
                }
                Err(Attempt::Transient(reason)) if attempts > self.retry.max_retries => {
                    self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(provider = %provider.name, %reason, attempts, "giving up on feed");
                    return Err(FetchError::Transient {
                        provider: provider.name.clone(),
                        reason,
                        attempts,
                    });
                }
                Err(Attempt::Transient(reason)) => {
                    let backoff = Self::calculate_backoff(attempts - 1, &self.retry);
                    self.stats.requests_retried.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        provider = %provider.name,
                        %reason,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient fetch failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}
