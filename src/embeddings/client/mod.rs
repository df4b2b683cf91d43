
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};
use url::Url;

use crate::config::ProviderConfig;

const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const EXPONENTIAL_BACKOFF_BASE: u64 = 2;

/// Typed failure surface of the embedding provider. The pool escalates
/// `RateLimited`; everything else stays a per-job failure.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("fatal provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    #[inline]
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ProviderError::RateLimited(_))
    }
}

/// HTTP client for an OpenAI-compatible embeddings endpoint.
#[derive(Debug, Clone)]
pub struct EmbeddingClient {
    base_url: Url,
    model: String,
    api_key: Option<String>,
    agent: ureq::Agent,
    retry_attempts: u32,
    requests_per_minute: u32,
    tokens_per_minute: u64,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Debug, Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

impl EmbeddingClient {
    #[inline]
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let base_url = config
            .endpoint_url()
            .context("Failed to parse embedding provider endpoint")?;

        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_seconds)))
            .build()
            .into();

        Ok(Self {
            base_url,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            agent,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            requests_per_minute: config.requests_per_minute,
            tokens_per_minute: config.tokens_per_minute,
        })
    }

    #[inline]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// The provider's published limits, as configured.
    #[inline]
    pub fn rate_limits(&self) -> (u32, u64) {
        (self.requests_per_minute, self.tokens_per_minute)
    }

    /// Verify the provider is reachable before the pool starts.
    #[inline]
    pub fn health_check(&self) -> Result<(), ProviderError> {
        let url = self
            .base_url
            .join("/v1/models")
            .map_err(|e| ProviderError::Fatal(format!("Failed to build health check URL: {e}")))?;

        debug!("Checking embedding provider at {}", url);

        self.request_with_retry(|| {
            let mut request = self.agent.get(url.as_str());
            if let Some(key) = &self.api_key {
                request = request.header("Authorization", &format!("Bearer {key}"));
            }
            request
                .call()
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        debug!("Embedding provider health check passed");
        Ok(())
    }

    /// Generate the embedding vector for one chunk of text.
    #[inline]
    pub fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        debug!("Requesting embedding for text of {} chars", text.len());

        let url = self
            .base_url
            .join("/v1/embeddings")
            .map_err(|e| ProviderError::Fatal(format!("Failed to build embeddings URL: {e}")))?;

        let request = EmbedRequest {
            model: &self.model,
            input: text,
        };
        let request_json = serde_json::to_string(&request)
            .map_err(|e| ProviderError::Fatal(format!("Failed to serialize request: {e}")))?;

        let response_text = self.request_with_retry(|| {
            let mut request = self
                .agent
                .post(url.as_str())
                .header("Content-Type", "application/json");
            if let Some(key) = &self.api_key {
                request = request.header("Authorization", &format!("Bearer {key}"));
            }
            request
                .send(&request_json)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        let response: EmbedResponse = serde_json::from_str(&response_text)
            .map_err(|e| ProviderError::Fatal(format!("Failed to parse embedding response: {e}")))?;

        let vector = response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| {
                ProviderError::Fatal("Embedding response contained no vectors".to_string())
            })?;

        debug!("Received embedding with {} dimensions", vector.len());
        Ok(vector)
    }

    fn request_with_retry<F>(&self, mut request_fn: F) -> Result<String, ProviderError>
    where
        F: FnMut() -> Result<String, ureq::Error>,
    {
        let mut last_error = None;

        for attempt in 1..=self.retry_attempts {
            match request_fn() {
                Ok(response_text) => return Ok(response_text),
                Err(ureq::Error::StatusCode(429)) => {
                    // Retrying would burn the limit window; surface immediately
                    warn!("Provider returned 429 rate_limit_exceeded");
                    return Err(ProviderError::RateLimited(
                        "HTTP 429: rate_limit_exceeded".to_string(),
                    ));
                }
                Err(ureq::Error::StatusCode(status)) if status >= 500 => {
                    warn!(
                        "Provider server error (status {}), attempt {}/{}",
                        status, attempt, self.retry_attempts
                    );
                    last_error = Some(ProviderError::Transient(format!("HTTP {status}")));
                }
                Err(ureq::Error::StatusCode(status)) => {
                    warn!("Provider client error (status {}), not retrying", status);
                    return Err(ProviderError::Fatal(format!("HTTP {status}")));
                }
                Err(
                    error @ (ureq::Error::ConnectionFailed
                    | ureq::Error::HostNotFound
                    | ureq::Error::Timeout(_)
                    | ureq::Error::Io(_)),
                ) => {
                    warn!(
                        "Provider transport error: {}, attempt {}/{}",
                        error, attempt, self.retry_attempts
                    );
                    last_error = Some(ProviderError::Transient(error.to_string()));
                }
                Err(error) => {
                    return Err(ProviderError::Fatal(error.to_string()));
                }
            }

            if attempt < self.retry_attempts {
                let delay_ms = EXPONENTIAL_BACKOFF_BASE.pow(attempt - 1) * 1000;
                debug!("Waiting {}ms before retry", delay_ms);
                std::thread::sleep(Duration::from_millis(delay_ms));
            }
        }

        error!("All retry attempts failed for request to {}", self.base_url);

        Err(last_error
            .unwrap_or_else(|| ProviderError::Transient("Request failed after retries".to_string())))
    }
}
