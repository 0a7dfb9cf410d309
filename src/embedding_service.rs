//! Cache-first embedding generation.
//!
//! Texts are normalized and looked up in the [`EmbeddingCache`]. Misses are
//! deduplicated, chunked to the provider's per-call cap and sent through the
//! rate limiter and circuit breaker. Fresh vectors are written back to the
//! cache before being merged into the output in input order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreaker;
use crate::embedding_cache::{cache_key, EmbeddingCache};
use crate::embedding_provider::EmbeddingProvider;
use crate::errors::{PipelineError, PipelineResult};
use crate::rate_limiter::{RateLimiter, EMBEDDINGS_ENDPOINT};
use crate::text_processing::{normalize_text, DEFAULT_MAX_TEXT_CHARS};

/// Identity under which provider calls are rate limited and circuit broken.
pub const PROVIDER_KEY: &str = "embedding-provider";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Normalized texts are cut to this many characters
    pub max_text_chars: usize,
    /// Texts per provider call; also capped by the provider itself
    pub max_batch_size: usize,
    /// Pause between consecutive chunks of one call
    pub inter_chunk_delay_ms: u64,
    /// Extra attempts for retryable provider failures
    pub max_retries: u32,
    /// First backoff delay, doubled on every retry
    pub retry_base_delay_ms: u64,
    /// Rate-limit identity and circuit key for the provider
    pub provider_key: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            max_text_chars: DEFAULT_MAX_TEXT_CHARS,
            max_batch_size: 100,
            inter_chunk_delay_ms: 100,
            max_retries: 2,
            retry_base_delay_ms: 500,
            provider_key: PROVIDER_KEY.to_string(),
        }
    }
}

/// Outcome of one `generate_embeddings` call, aligned with the input texts
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingBatch {
    pub embeddings: Vec<PipelineResult<Vec<f32>>>,
    pub from_cache: Vec<bool>,
    pub cache_hits: usize,
    pub cache_misses: usize,
}

impl EmbeddingBatch {
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    pub fn failures(&self) -> usize {
        self.embeddings.iter().filter(|e| e.is_err()).count()
    }
}

/// A distinct normalized text that missed the cache and the input slots it fills
struct PendingText {
    key: String,
    text: String,
    positions: Vec<usize>,
}

#[derive(Clone)]
pub struct EmbeddingService {
    provider: Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
    rate_limiter: RateLimiter,
    circuit_breaker: CircuitBreaker,
    config: EmbeddingConfig,
}

impl EmbeddingService {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        cache: EmbeddingCache,
        rate_limiter: RateLimiter,
        circuit_breaker: CircuitBreaker,
        config: EmbeddingConfig,
    ) -> Self {
        Self {
            provider,
            cache,
            rate_limiter,
            circuit_breaker,
            config,
        }
    }

    pub fn model_id(&self) -> &str {
        self.provider.model_id()
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    fn chunk_size(&self) -> usize {
        self.config
            .max_batch_size
            .min(self.provider.max_batch_size())
            .max(1)
    }

    /// Embed `texts`, serving what it can from the cache.
    ///
    /// Never fails as a whole: every slot carries its own vector or typed error.
    pub async fn generate_embeddings(&self, texts: &[String]) -> EmbeddingBatch {
        let model = self.provider.model_id().to_string();
        let mut embeddings: Vec<Option<PipelineResult<Vec<f32>>>> = vec![None; texts.len()];
        let mut from_cache = vec![false; texts.len()];
        let mut cache_hits = 0;
        let mut pending: Vec<PendingText> = Vec::new();
        let mut pending_index: HashMap<String, usize> = HashMap::new();

        for (i, text) in texts.iter().enumerate() {
            let normalized = normalize_text(text, self.config.max_text_chars);
            if normalized.is_empty() {
                embeddings[i] = Some(Err(PipelineError::InvalidInput {
                    message: "text is empty after normalization".to_string(),
                }));
                continue;
            }

            let key = cache_key(&normalized, &model);
            if let Some(vector) = self.cache.get(&key).await {
                embeddings[i] = Some(Ok(vector));
                from_cache[i] = true;
                cache_hits += 1;
                continue;
            }

            match pending_index.get(&key) {
                Some(&slot) => pending[slot].positions.push(i),
                None => {
                    pending_index.insert(key.clone(), pending.len());
                    pending.push(PendingText {
                        key,
                        text: normalized,
                        positions: vec![i],
                    });
                }
            }
        }

        let cache_misses = pending.iter().map(|p| p.positions.len()).sum();
        if !pending.is_empty() {
            log::debug!(
                "Embedding {} texts: {} cache hits, {} distinct misses",
                texts.len(),
                cache_hits,
                pending.len()
            );
        }

        for (chunk_index, chunk) in pending.chunks(self.chunk_size()).enumerate() {
            if chunk_index > 0 && self.config.inter_chunk_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.inter_chunk_delay_ms)).await;
            }

            let chunk_texts: Vec<String> = chunk.iter().map(|p| p.text.clone()).collect();
            match self.embed_chunk(&chunk_texts, &model).await {
                Ok(vectors) => {
                    for (entry, vector) in chunk.iter().zip(vectors) {
                        self.cache.set(&entry.key, vector.clone()).await;
                        for &position in &entry.positions {
                            embeddings[position] = Some(Ok(vector.clone()));
                        }
                    }
                }
                Err(error) => {
                    log::warn!(
                        "Embedding chunk {} ({} texts) failed: {}",
                        chunk_index,
                        chunk.len(),
                        error
                    );
                    for entry in chunk {
                        for &position in &entry.positions {
                            embeddings[position] = Some(Err(error.clone()));
                        }
                    }
                }
            }
        }

        EmbeddingBatch {
            embeddings: embeddings
                .into_iter()
                .map(|slot| slot.unwrap_or_else(|| Err(PipelineError::internal("embedding slot left unfilled"))))
                .collect(),
            from_cache,
            cache_hits,
            cache_misses,
        }
    }

    /// Embed a single text.
    pub async fn embed_one(&self, text: &str) -> PipelineResult<Vec<f32>> {
        let mut batch = self.generate_embeddings(&[text.to_string()]).await;
        batch
            .embeddings
            .pop()
            .unwrap_or_else(|| Err(PipelineError::internal("empty embedding batch")))
    }

    /// One provider call per attempt, each behind the rate limiter and breaker.
    /// Only retryable provider failures are retried.
    async fn embed_chunk(&self, texts: &[String], model: &str) -> PipelineResult<Vec<Vec<f32>>> {
        let key = self.config.provider_key.as_str();
        let mut attempt: u32 = 0;

        loop {
            self.rate_limiter.enforce(key, EMBEDDINGS_ENDPOINT, None)?;

            let provider = Arc::clone(&self.provider);
            let result = self
                .circuit_breaker
                .execute(key, || async move { provider.embed(texts, model).await })
                .await
                .and_then(|vectors| {
                    if vectors.len() == texts.len() {
                        Ok(vectors)
                    } else {
                        Err(PipelineError::provider(
                            format!("expected {} vectors, got {}", texts.len(), vectors.len()),
                            false,
                        ))
                    }
                });

            match result {
                Err(PipelineError::ProviderFailure { retryable: true, ref message })
                    if attempt < self.config.max_retries =>
                {
                    let delay = Duration::from_millis(self.config.retry_base_delay_ms << attempt);
                    log::warn!(
                        "Embedding attempt {} failed ({}), retrying in {:?}",
                        attempt + 1,
                        message,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::embedding_cache::EmbeddingCacheConfig;
    use crate::rate_limiter::{RateLimitConfig, RateLimiterConfig};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Deterministic provider recording every call
    struct ScriptedProvider {
        calls: Mutex<Vec<Vec<String>>>,
        failures: Mutex<VecDeque<PipelineError>>,
        max_batch: usize,
    }

    impl ScriptedProvider {
        fn new(max_batch: usize) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failures: Mutex::new(VecDeque::new()),
                max_batch,
            }
        }

        fn fail_next(&self, error: PipelineError) {
            self.failures.lock().push_back(error);
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedProvider {
        fn model_id(&self) -> &str {
            "test-model"
        }

        fn dimensions(&self) -> usize {
            2
        }

        fn max_batch_size(&self) -> usize {
            self.max_batch
        }

        async fn embed(&self, texts: &[String], _model: &str) -> Result<Vec<Vec<f32>>, PipelineError> {
            self.calls.lock().push(texts.to_vec());
            if let Some(error) = self.failures.lock().pop_front() {
                return Err(error);
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn service_with(provider: Arc<ScriptedProvider>, rate: RateLimitConfig) -> EmbeddingService {
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        limiter.register_endpoint(EMBEDDINGS_ENDPOINT, rate);
        EmbeddingService::new(
            provider,
            EmbeddingCache::new(EmbeddingCacheConfig::default()),
            limiter,
            CircuitBreaker::new(CircuitBreakerConfig::default()),
            EmbeddingConfig {
                inter_chunk_delay_ms: 0,
                retry_base_delay_ms: 1,
                ..EmbeddingConfig::default()
            },
        )
    }

    fn service(provider: Arc<ScriptedProvider>) -> EmbeddingService {
        service_with(provider, RateLimitConfig::new(1_000, 60_000))
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_second_call_is_served_from_cache() {
        let provider = Arc::new(ScriptedProvider::new(100));
        let svc = service(provider.clone());

        let first = svc.generate_embeddings(&texts(&["Rust systems", "machine learning"])).await;
        assert_eq!(first.cache_misses, 2);
        assert_eq!(provider.call_count(), 1);

        let second = svc.generate_embeddings(&texts(&["  rust   SYSTEMS ", "machine learning"])).await;
        assert_eq!(provider.call_count(), 1, "provider must not be called on cache hits");
        assert_eq!(second.cache_hits, 2);
        assert_eq!(second.from_cache, vec![true, true]);
        assert_eq!(second.embeddings, first.embeddings);
        assert!((second.hit_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_misses_are_deduplicated_and_ordered() {
        let provider = Arc::new(ScriptedProvider::new(100));
        let svc = service(provider.clone());

        let batch = svc.generate_embeddings(&texts(&["ab", "abcd", "AB"])).await;
        assert_eq!(provider.calls.lock()[0], texts(&["ab", "abcd"]));
        assert_eq!(batch.cache_misses, 3);
        assert_eq!(batch.embeddings[0], Ok(vec![2.0, 1.0]));
        assert_eq!(batch.embeddings[1], Ok(vec![4.0, 1.0]));
        assert_eq!(batch.embeddings[2], Ok(vec![2.0, 1.0]));
    }

    #[tokio::test]
    async fn test_large_batches_are_chunked() {
        let provider = Arc::new(ScriptedProvider::new(3));
        let svc = service(provider.clone());

        let inputs: Vec<String> = (0..7).map(|i| format!("text {}", i)).collect();
        let batch = svc.generate_embeddings(&inputs).await;

        let sizes: Vec<usize> = provider.calls.lock().iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(batch.failures(), 0);
    }

    #[tokio::test]
    async fn test_chunk_failure_is_typed_per_text() {
        let provider = Arc::new(ScriptedProvider::new(2));
        provider.fail_next(PipelineError::provider("bad request", false));
        let svc = service(provider.clone());

        let batch = svc.generate_embeddings(&texts(&["a", "b", "c"])).await;
        assert!(matches!(batch.embeddings[0], Err(PipelineError::ProviderFailure { .. })));
        assert!(matches!(batch.embeddings[1], Err(PipelineError::ProviderFailure { .. })));
        assert_eq!(batch.embeddings[2], Ok(vec![1.0, 1.0]));
        assert_eq!(batch.failures(), 2);
    }

    #[tokio::test]
    async fn test_retryable_failures_are_retried() {
        let provider = Arc::new(ScriptedProvider::new(100));
        provider.fail_next(PipelineError::provider("503", true));
        provider.fail_next(PipelineError::provider("503", true));
        let svc = service(provider.clone());

        let batch = svc.generate_embeddings(&texts(&["retry me"])).await;
        assert!(batch.embeddings[0].is_ok());
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let provider = Arc::new(ScriptedProvider::new(100));
        for _ in 0..5 {
            provider.fail_next(PipelineError::provider("503", true));
        }
        let svc = service(provider.clone());

        let result = svc.embed_one("never").await;
        assert!(matches!(result, Err(PipelineError::ProviderFailure { .. })));
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_rate_limited_before_provider_call() {
        let provider = Arc::new(ScriptedProvider::new(1));
        let svc = service_with(provider.clone(), RateLimitConfig::new(1, 60_000));

        let batch = svc.generate_embeddings(&texts(&["one", "two"])).await;
        assert!(batch.embeddings[0].is_ok());
        assert!(matches!(batch.embeddings[1], Err(PipelineError::RateLimited { .. })));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_text_is_rejected_per_slot() {
        let provider = Arc::new(ScriptedProvider::new(100));
        let svc = service(provider.clone());

        let batch = svc.generate_embeddings(&texts(&[" \n\t ", "ok"])).await;
        assert!(matches!(batch.embeddings[0], Err(PipelineError::InvalidInput { .. })));
        assert!(batch.embeddings[1].is_ok());
        assert_eq!(provider.calls.lock()[0], texts(&["ok"]));
    }
}
