use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::PipelineError;

/// Errors raised while talking to the embedding service
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("Rate limited by provider, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("API error: {status_code} - {message}")]
    Api { status_code: u16, message: String },

    #[error("Invalid embedding response: {reason}")]
    InvalidResponse { reason: String },

    #[error("Too many texts in one request: {count} (maximum {max})")]
    TooManyTexts { count: usize, max: usize },
}

pub type ProviderResult<T> = Result<T, ProviderError>;

impl From<ProviderError> for PipelineError {
    fn from(error: ProviderError) -> Self {
        match &error {
            ProviderError::RateLimited { retry_after_seconds } => PipelineError::RateLimited {
                retry_after_seconds: *retry_after_seconds,
            },
            ProviderError::Api { status_code, .. } => {
                // 4xx other than 429 means the request itself is wrong.
                let retryable = *status_code >= 500;
                PipelineError::provider(error.to_string(), retryable)
            }
            ProviderError::InvalidResponse { .. } | ProviderError::TooManyTexts { .. } => {
                PipelineError::provider(error.to_string(), false)
            }
            ProviderError::Network(_) | ProviderError::Timeout { .. } => {
                PipelineError::provider(error.to_string(), true)
            }
        }
    }
}

/// Anything that turns texts into fixed-length vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier used to scope cache keys
    fn model_id(&self) -> &str;

    /// Expected vector length
    fn dimensions(&self) -> usize;

    /// Largest number of texts accepted by one `embed` call
    fn max_batch_size(&self) -> usize {
        DEFAULT_MAX_TEXTS_PER_REQUEST
    }

    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>, PipelineError>;
}

pub const DEFAULT_MODEL: &str = "all-MiniLM-L6-v2";
pub const DEFAULT_DIMENSIONS: usize = 384;
pub const DEFAULT_MAX_TEXTS_PER_REQUEST: usize = 100;

/// Connection settings for the HTTP embedding service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    pub model: String,
    pub dimensions: usize,
    pub timeout_ms: u64,
    pub max_texts_per_request: usize,
    /// Ask the service for unit-length vectors
    pub normalize: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8001".to_string(),
            model: DEFAULT_MODEL.to_string(),
            dimensions: DEFAULT_DIMENSIONS,
            timeout_ms: 30_000,
            max_texts_per_request: DEFAULT_MAX_TEXTS_PER_REQUEST,
            normalize: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
    normalize: bool,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
    #[allow(dead_code)]
    model: Option<String>,
    dimensions: Option<usize>,
}

/// Health report from `GET /health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub status: String,
    pub model: String,
    pub model_loaded: bool,
}

impl ProviderHealth {
    pub fn is_ready(&self) -> bool {
        self.model_loaded && self.status.eq_ignore_ascii_case("healthy")
    }
}

/// Client for the sentence-transformer embedding service
#[derive(Clone)]
pub struct HttpEmbeddingProvider {
    client: Client,
    config: ProviderConfig,
}

impl HttpEmbeddingProvider {
    pub fn new(config: ProviderConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self { client, config }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    pub async fn health(&self) -> ProviderResult<ProviderHealth> {
        let response = self.client.get(self.url("health")).send().await?;
        if !response.status().is_success() {
            let status_code = response.status().as_u16();
            let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::Api { status_code, message });
        }
        Ok(response.json().await?)
    }

    async fn embed_request(&self, texts: &[String]) -> ProviderResult<Vec<Vec<f32>>> {
        if texts.len() > self.config.max_texts_per_request {
            return Err(ProviderError::TooManyTexts {
                count: texts.len(),
                max: self.config.max_texts_per_request,
            });
        }

        let request = EmbedRequest {
            texts,
            normalize: self.config.normalize,
        };

        let response = self
            .client
            .post(self.url("embed"))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout {
                        duration_ms: self.config.timeout_ms,
                    }
                } else {
                    ProviderError::Network(e)
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_seconds = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(1);
            return Err(ProviderError::RateLimited { retry_after_seconds });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::Api {
                status_code: status.as_u16(),
                message,
            });
        }

        let body: EmbedResponse = response.json().await.map_err(|e| ProviderError::InvalidResponse {
            reason: e.to_string(),
        })?;
        self.validate_response(texts.len(), body)
    }

    fn validate_response(&self, expected: usize, body: EmbedResponse) -> ProviderResult<Vec<Vec<f32>>> {
        if body.embeddings.len() != expected {
            return Err(ProviderError::InvalidResponse {
                reason: format!(
                    "Batch response length mismatch: expected {}, got {}",
                    expected,
                    body.embeddings.len()
                ),
            });
        }
        if let Some(reported) = body.dimensions {
            if expected > 0 && reported != self.config.dimensions {
                return Err(ProviderError::InvalidResponse {
                    reason: format!(
                        "Model reported {} dimensions, expected {}",
                        reported, self.config.dimensions
                    ),
                });
            }
        }
        for (i, embedding) in body.embeddings.iter().enumerate() {
            if embedding.len() != self.config.dimensions {
                return Err(ProviderError::InvalidResponse {
                    reason: format!(
                        "Embedding {} has {} dimensions, expected {}",
                        i,
                        embedding.len(),
                        self.config.dimensions
                    ),
                });
            }
        }
        Ok(body.embeddings)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model_id(&self) -> &str {
        &self.config.model
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    fn max_batch_size(&self) -> usize {
        self.config.max_texts_per_request
    }

    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>, PipelineError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if model != self.config.model {
            log::warn!(
                "Embedding service serves '{}' but '{}' was requested",
                self.config.model, model
            );
        }

        let started = std::time::Instant::now();
        let result = self.embed_request(texts).await;
        match &result {
            Ok(_) => log::debug!("Embedded {} texts in {:?}", texts.len(), started.elapsed()),
            Err(e) => log::warn!("Embedding request for {} texts failed: {}", texts.len(), e),
        }
        result.map_err(PipelineError::from)
    }
}
