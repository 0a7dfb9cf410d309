//! Service wiring.
//!
//! Every stateful service is built once here and handed to its consumers, so
//! the scheduler, the recommender and the embedding path share the same
//! caches, limiter and breaker.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::batch_scheduler::{BatchResult, BatchScheduler, Priority, RequestStatus, SchedulerHandle};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::PipelineConfig;
use crate::embedding_cache::EmbeddingCache;
use crate::embedding_provider::{EmbeddingProvider, HttpEmbeddingProvider};
use crate::embedding_service::EmbeddingService;
use crate::errors::PipelineResult;
use crate::progress_tracker::ProgressTracker;
use crate::rate_limiter::{RateLimitPolicy, RateLimiter, BATCH_ENDPOINT, RECOMMENDATIONS_ENDPOINT};
use crate::recommendation_cache::RecommendationCache;
use crate::recommender::Recommender;
use crate::storage::RecommendationStore;
use crate::types::{RecommendationOptions, RecommendationSet};

/// Background tasks started by [`RecommendationPipeline::start`]
pub struct PipelineHandle {
    scheduler: SchedulerHandle,
    sweepers: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    pub async fn stop(self) {
        for sweeper in &self.sweepers {
            sweeper.abort();
        }
        self.scheduler.stop().await;
    }
}

#[derive(Clone)]
pub struct RecommendationPipeline {
    config: PipelineConfig,
    rate_limiter: RateLimiter,
    circuit_breaker: CircuitBreaker,
    embedding_cache: EmbeddingCache,
    recommendation_cache: RecommendationCache,
    progress: ProgressTracker,
    recommender: Recommender,
    scheduler: BatchScheduler,
    recommend_policy: RateLimitPolicy,
    batch_policy: RateLimitPolicy,
}

impl RecommendationPipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn RecommendationStore>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(config.rate_limiter.clone());
        let circuit_breaker = CircuitBreaker::new(config.circuit_breaker.clone());
        let embedding_cache = EmbeddingCache::new(config.embedding_cache.clone());
        let recommendation_cache = RecommendationCache::new(config.recommendation_cache.clone());
        let progress = ProgressTracker::new(config.progress.clone());

        let embeddings = EmbeddingService::new(
            provider,
            embedding_cache.clone(),
            rate_limiter.clone(),
            circuit_breaker.clone(),
            config.embeddings.clone(),
        );
        let recommender = Recommender::new(
            store,
            embeddings,
            recommendation_cache.clone(),
            progress.clone(),
        );
        let scheduler = BatchScheduler::new(config.scheduler.clone(), recommender.clone(), rate_limiter.clone());

        log::info!(
            "Recommendation pipeline ready (model {}, {} workers)",
            recommender.embeddings().model_id(),
            config.scheduler.max_concurrent
        );

        Self {
            config,
            rate_limiter,
            circuit_breaker,
            embedding_cache,
            recommendation_cache,
            progress,
            recommender,
            scheduler,
            recommend_policy: RateLimitPolicy::per_identity(RECOMMENDATIONS_ENDPOINT),
            batch_policy: RateLimitPolicy::per_identity(BATCH_ENDPOINT),
        }
    }

    /// Wire the pipeline against the HTTP embedding service in `config.provider`.
    pub fn with_http_provider(config: PipelineConfig, store: Arc<dyn RecommendationStore>) -> Self {
        let provider = Arc::new(HttpEmbeddingProvider::new(config.provider.clone()));
        Self::new(config, store, provider)
    }

    /// Start the scheduler loops and every periodic sweep.
    pub fn start(&self) -> PipelineHandle {
        let sweepers = vec![
            self.rate_limiter.spawn_cleanup_task(),
            self.embedding_cache.spawn_cleanup_task(),
            self.progress.spawn_cleanup_task(),
        ];
        PipelineHandle {
            scheduler: self.scheduler.start(),
            sweepers,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }

    pub fn recommender(&self) -> &Recommender {
        &self.recommender
    }

    pub fn progress_tracker(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub fn embedding_cache(&self) -> &EmbeddingCache {
        &self.embedding_cache
    }

    pub fn recommendation_cache(&self) -> &RecommendationCache {
        &self.recommendation_cache
    }

    /// Single-student request on behalf of `caller`, rate limited per caller.
    pub async fn recommend(
        &self,
        caller: &str,
        subject_id: &str,
        options: &RecommendationOptions,
    ) -> PipelineResult<RecommendationSet> {
        self.rate_limiter.guard(&self.recommend_policy, caller)?;
        self.recommender.recommend(subject_id, options).await
    }

    /// Queue a batch on behalf of `caller`, rate limited per caller.
    pub async fn submit_batch(
        &self,
        caller: &str,
        subject_ids: Vec<String>,
        options: RecommendationOptions,
        priority: Priority,
    ) -> PipelineResult<Uuid> {
        self.rate_limiter.guard(&self.batch_policy, caller)?;
        self.scheduler.submit(subject_ids, options, priority).await
    }

    pub async fn batch_status(&self, request_id: Uuid) -> RequestStatus {
        self.scheduler.status(request_id).await
    }

    pub async fn wait_for_batch(&self, request_id: Uuid, timeout: Duration) -> PipelineResult<BatchResult> {
        self.scheduler.wait_for_completion(request_id, timeout).await
    }

    /// A student's profile changed; their cached recommendations are stale.
    pub async fn on_profile_updated(&self, student_id: &str) -> bool {
        self.recommendation_cache.invalidate(student_id).await
    }

    /// Projects were added, edited or approved; every cached set is stale.
    pub async fn on_catalogue_updated(&self) -> usize {
        self.recommendation_cache.invalidate_all().await
    }
}
