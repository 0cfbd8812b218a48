//! Embedding Client
//!
//! Turns text into vectors through an OpenAI-style `/embeddings` HTTP API,
//! with batching, rate-limit backoff and timeout retries.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{EmbeddingConfig, MAX_EMBEDDING_BATCH};
use crate::metrics::{EMBEDDING_REQUESTS_TOTAL, EMBEDDING_RETRIES_TOTAL};

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("authentication failed: {0}")]
    AuthFailure(String),
    #[error("rate limited, gave up after {attempts} attempts: {message}")]
    RateLimited { attempts: u32, message: String },
    #[error("request timed out, gave up after {attempts} attempts")]
    Timeout { attempts: u32 },
    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl EmbeddingError {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, EmbeddingError::AuthFailure(_))
    }
}

/// Anything that can turn text into embedding vectors.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `texts`, returning one vector per input in the same order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::InvalidResponse("no embedding returned for query".to_string()))
    }
}

/// Backoff settings for a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per request, including the first one.
    pub max_retries: u32,
    /// Used when a 429 response carries no `Retry-After` header.
    pub default_retry_after: Duration,
    /// Upper bound on a single rate-limit wait.
    pub max_backoff: Duration,
    /// Timeout retry `n` waits `n * timeout_step`.
    pub timeout_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            default_retry_after: Duration::from_secs(10),
            max_backoff: Duration::from_secs(120),
            timeout_step: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Exponential wait after the `retries_so_far`-th rate-limit response (0-based).
    pub fn rate_limit_wait(&self, retry_after: Option<Duration>, retries_so_far: u32) -> Duration {
        let base = retry_after.unwrap_or(self.default_retry_after);
        let factor = 2u32.saturating_pow(retries_so_far);
        base.checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Linear wait before timeout retry `retry` (1-based).
    pub fn timeout_wait(&self, retry: u32) -> Duration {
        self.timeout_step.saturating_mul(retry)
    }
}

/// Outcome of a credential probe that did not prove the key invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyCheck {
    Valid,
    /// The probe neither succeeded nor returned 401; the key may still work.
    Inconclusive(String),
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: EmbeddingInput<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<u32>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum EmbeddingInput<'a> {
    Single(&'a str),
    Batch(&'a [String]),
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Option<Vec<EmbeddingData>>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// HTTP embedding client
pub struct HttpEmbeddingClient {
    client: Client,
    api_key: String,
    model: String,
    api_base: String,
    dimensions: Option<u32>,
    batch_size: usize,
    request_delay: Duration,
    retry: RetryPolicy,
}

impl HttpEmbeddingClient {
    /// Build a client from configuration. Fails with `ConfigMissing` when no API key is set.
    pub fn new(config: &EmbeddingConfig) -> crate::Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                crate::Error::ConfigMissing(
                    "embedding API key (rag.embedding.api_key or EMBEDDING_API_KEY)".to_string(),
                )
            })?;

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| crate::Error::Internal(format!("failed to build HTTP client: {}", e)))?;

        let batch_size = config.batch_size.clamp(1, MAX_EMBEDDING_BATCH);
        if batch_size != config.batch_size {
            warn!(
                "Embedding batch size {} adjusted to {} (provider limit is {})",
                config.batch_size, batch_size, MAX_EMBEDDING_BATCH
            );
        }

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            api_base: config.api_base.clone(),
            dimensions: config.dimensions,
            batch_size,
            request_delay: config.request_delay,
            retry: RetryPolicy {
                max_retries: config.max_retries.max(1),
                ..RetryPolicy::default()
            },
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = RetryPolicy {
            max_retries: retry.max_retries.max(1),
            ..retry
        };
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn post(&self, input: EmbeddingInput<'_>) -> Result<reqwest::Response, reqwest::Error> {
        let payload = EmbeddingRequest {
            model: &self.model,
            input,
            dimensions: self.dimensions,
        };

        EMBEDDING_REQUESTS_TOTAL.inc();
        self.client
            .post(&self.api_base)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
    }

    /// Count a timed-out attempt and return the wait before the next one, or
    /// `Timeout` once the retry budget is spent.
    fn timeout_backoff(
        &self,
        retries: &mut u32,
        batch_num: usize,
        total_batches: usize,
    ) -> Result<Duration, EmbeddingError> {
        *retries += 1;
        if *retries >= self.retry.max_retries {
            return Err(EmbeddingError::Timeout { attempts: *retries });
        }
        let wait = self.retry.timeout_wait(*retries);
        warn!(
            "Embedding batch {}/{} timed out, retrying in {:?} ({}/{})",
            batch_num, total_batches, wait, retries, self.retry.max_retries
        );
        EMBEDDING_RETRIES_TOTAL.with_label_values(&["timeout"]).inc();
        Ok(wait)
    }

    /// Send one batch, retrying rate limits and timeouts per the retry policy.
    async fn embed_batch(
        &self,
        batch: &[String],
        batch_num: usize,
        total_batches: usize,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut retries = 0u32;

        loop {
            let input = if batch.len() == 1 {
                EmbeddingInput::Single(&batch[0])
            } else {
                EmbeddingInput::Batch(batch)
            };

            let response = match self.post(input).await {
                Ok(response) => response,
                Err(e) if e.is_timeout() => {
                    let wait = self.timeout_backoff(&mut retries, batch_num, total_batches)?;
                    tokio::time::sleep(wait).await;
                    continue;
                }
                Err(e) => return Err(EmbeddingError::Transport(e.to_string())),
            };

            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = parse_retry_after(&response);
                let message = error_message(response).await;
                let wait = self.retry.rate_limit_wait(retry_after, retries);
                retries += 1;
                if retries >= self.retry.max_retries {
                    return Err(EmbeddingError::RateLimited {
                        attempts: retries,
                        message,
                    });
                }
                warn!(
                    "Embedding batch {}/{} rate limited ({}), retrying in {:?} ({}/{})",
                    batch_num, total_batches, message, wait, retries, self.retry.max_retries
                );
                EMBEDDING_RETRIES_TOTAL.with_label_values(&["rate_limited"]).inc();
                tokio::time::sleep(wait).await;
                continue;
            }

            if status == StatusCode::UNAUTHORIZED {
                return Err(EmbeddingError::AuthFailure(error_message(response).await));
            }

            if !status.is_success() {
                return Err(EmbeddingError::Api {
                    status: status.as_u16(),
                    message: error_message(response).await,
                });
            }

            // The client timeout also covers reading the body.
            let body: EmbeddingResponse = match response.json().await {
                Ok(body) => body,
                Err(e) if e.is_timeout() => {
                    let wait = self.timeout_backoff(&mut retries, batch_num, total_batches)?;
                    tokio::time::sleep(wait).await;
                    continue;
                }
                Err(e) => {
                    return Err(EmbeddingError::InvalidResponse(format!(
                        "failed to decode body: {}",
                        e
                    )))
                }
            };

            return into_vectors(body, batch.len());
        }
    }

    /// Probe the API with a one-word request. Only a 401 is treated as proof of a bad key.
    pub async fn verify_api_key(&self) -> Result<KeyCheck, EmbeddingError> {
        let response = match self.post(EmbeddingInput::Single("test")).await {
            Ok(response) => response,
            Err(e) => {
                warn!("API key probe failed before reaching the provider: {}", e);
                return Ok(KeyCheck::Inconclusive(e.to_string()));
            }
        };

        match response.status() {
            status if status.is_success() => Ok(KeyCheck::Valid),
            StatusCode::UNAUTHORIZED => Err(EmbeddingError::AuthFailure(error_message(response).await)),
            StatusCode::TOO_MANY_REQUESTS => {
                warn!("API key probe was rate limited; the key is probably valid");
                Ok(KeyCheck::Inconclusive("rate limited".to_string()))
            }
            status => {
                let message = error_message(response).await;
                warn!("API key probe returned {}: {}", status, message);
                Ok(KeyCheck::Inconclusive(format!("{}: {}", status.as_u16(), message)))
            }
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let total_batches = texts.len().div_ceil(self.batch_size);
        let mut vectors = Vec::with_capacity(texts.len());

        for (i, batch) in texts.chunks(self.batch_size).enumerate() {
            let batch_num = i + 1;
            debug!("Embedding batch {}/{} ({} texts)", batch_num, total_batches, batch.len());
            vectors.extend(self.embed_batch(batch, batch_num, total_batches).await?);

            if batch_num < total_batches {
                tokio::time::sleep(self.request_delay).await;
            }
        }

        if total_batches > 1 {
            info!("Embedded {} texts in {} batches", texts.len(), total_batches);
        }
        Ok(vectors)
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

async fn error_message(response: reqwest::Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    extract_error_message(&text).unwrap_or_else(|| {
        if text.trim().is_empty() {
            format!("HTTP {}", status.as_u16())
        } else {
            text.chars().take(200).collect()
        }
    })
}

fn extract_error_message(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .and_then(|e| e.error.message)
        .filter(|m| !m.is_empty())
}

fn into_vectors(body: EmbeddingResponse, expected: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let mut data = body
        .data
        .ok_or_else(|| EmbeddingError::InvalidResponse("response has no `data` field".to_string()))?;

    if data.len() != expected {
        return Err(EmbeddingError::InvalidResponse(format!(
            "expected {} embeddings, got {}",
            expected,
            data.len()
        )));
    }

    if data.iter().all(|d| d.index.is_some()) {
        data.sort_by_key(|d| d.index);
    }

    Ok(data.into_iter().map(|d| d.embedding).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rate_limit_wait_grows_exponentially_and_is_capped() {
        let policy = RetryPolicy::default();
        let two = Some(Duration::from_secs(2));
        assert_eq!(policy.rate_limit_wait(two, 0), Duration::from_secs(2));
        assert_eq!(policy.rate_limit_wait(two, 1), Duration::from_secs(4));
        assert_eq!(policy.rate_limit_wait(two, 3), Duration::from_secs(16));
        assert_eq!(policy.rate_limit_wait(None, 0), Duration::from_secs(10));
        assert_eq!(policy.rate_limit_wait(None, 4), Duration::from_secs(120));
        assert_eq!(policy.rate_limit_wait(None, 40), Duration::from_secs(120));
    }

    #[test]
    fn timeout_wait_is_linear() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.timeout_wait(1), Duration::from_secs(5));
        assert_eq!(policy.timeout_wait(3), Duration::from_secs(15));
    }

    #[test]
    fn request_body_uses_bare_string_for_single_input() {
        let single = serde_json::to_value(EmbeddingRequest {
            model: "embedding-3",
            input: EmbeddingInput::Single("pod pending"),
            dimensions: None,
        })
        .unwrap();
        assert_eq!(single, json!({"model": "embedding-3", "input": "pod pending"}));

        let texts = vec!["a".to_string(), "b".to_string()];
        let batch = serde_json::to_value(EmbeddingRequest {
            model: "embedding-3",
            input: EmbeddingInput::Batch(&texts),
            dimensions: Some(256),
        })
        .unwrap();
        assert_eq!(batch, json!({"model": "embedding-3", "input": ["a", "b"], "dimensions": 256}));
    }

    #[test]
    fn extracts_provider_error_message() {
        let body = r#"{"error":{"code":"1113","message":"insufficient balance"}}"#;
        assert_eq!(extract_error_message(body).as_deref(), Some("insufficient balance"));
        assert_eq!(extract_error_message("<html>bad gateway</html>"), None);
    }

    #[test]
    fn response_vectors_follow_input_order() {
        let body: EmbeddingResponse = serde_json::from_value(json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        }))
        .unwrap();
        let vectors = into_vectors(body, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn response_count_mismatch_is_invalid() {
        let body: EmbeddingResponse =
            serde_json::from_value(json!({"data": [{"embedding": [1.0]}]})).unwrap();
        assert!(matches!(into_vectors(body, 2), Err(EmbeddingError::InvalidResponse(_))));

        let body: EmbeddingResponse = serde_json::from_value(json!({"object": "list"})).unwrap();
        assert!(matches!(into_vectors(body, 1), Err(EmbeddingError::InvalidResponse(_))));
    }

    #[test]
    fn missing_api_key_is_reported_at_construction() {
        let config = EmbeddingConfig::default();
        assert!(matches!(
            HttpEmbeddingClient::new(&config),
            Err(crate::Error::ConfigMissing(_))
        ));
    }

    #[test]
    fn batch_size_is_clamped_to_provider_limit() {
        let config = EmbeddingConfig {
            api_key: Some("sk-test".to_string()),
            batch_size: 500,
            ..Default::default()
        };
        let client = HttpEmbeddingClient::new(&config).unwrap();
        assert_eq!(client.batch_size(), MAX_EMBEDDING_BATCH);
    }
}
