//! Priority batch queue with bounded concurrency.
//!
//! Features:
//! - **Strict priority** across tiers, FIFO within a tier
//! - **Bounded concurrency** through a semaphore sized to `max_concurrent`
//! - **Rate-budget aware dispatch**: nothing is pulled while the provider
//!   budget is exhausted
//! - **Supervised lifecycle** with graceful stop, deadlines and panic containment
//!
//! The queue lives in memory only. Requests still queued when the process
//! exits are lost.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::errors::{PipelineError, PipelineResult};
use crate::progress_tracker::ProgressTracker;
use crate::rate_limiter::{RateLimiter, EMBEDDINGS_ENDPOINT};
use crate::recommender::{BatchOutcomes, Recommender, SubjectResult};
use crate::types::RecommendationOptions;

/// Priority levels for batch requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Requests processed at the same time
    pub max_concurrent: usize,
    /// Queued requests before submissions are rejected
    pub max_queue_size: usize,
    /// Subjects allowed in one request
    pub max_batch_size: usize,
    /// Dispatch loop period
    pub tick_interval_ms: u64,
    /// Hard limit on one request's processing time
    pub request_deadline_ms: u64,
    /// How long completed results stay queryable
    pub retention_secs: u64,
    pub cleanup_interval_secs: u64,
    pub event_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_queue_size: 100,
            max_batch_size: 50,
            tick_interval_ms: 100,
            request_deadline_ms: 120_000,
            retention_secs: 86_400,
            cleanup_interval_secs: 3_600,
            event_buffer: 256,
        }
    }
}

/// A submitted batch; immutable once queued
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub id: Uuid,
    pub subject_ids: Vec<String>,
    pub options: RecommendationOptions,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub estimated_duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub request_id: Uuid,
    /// One entry per submitted subject, in submission order
    pub results: Vec<SubjectResult>,
    pub success_count: usize,
    pub error_count: usize,
    /// Share of subjects answered from the result cache
    pub cache_hit_rate: f64,
    pub embedding_cache_hit_rate: f64,
    pub processing_time_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl BatchResult {
    fn from_results(
        request_id: Uuid,
        results: Vec<SubjectResult>,
        result_cache_hits: usize,
        embedding_cache_hit_rate: f64,
        started_at: DateTime<Utc>,
        processing_time_ms: u64,
    ) -> Self {
        let success_count = results.iter().filter(|r| r.is_success()).count();
        let error_count = results.len() - success_count;
        let cache_hit_rate = if results.is_empty() {
            0.0
        } else {
            result_cache_hits as f64 / results.len() as f64
        };
        Self {
            request_id,
            results,
            success_count,
            error_count,
            cache_hit_rate,
            embedding_cache_hit_rate,
            processing_time_ms,
            started_at,
            completed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestStatus {
    /// `position` is 1-based
    Queued { position: usize, estimated_wait_ms: u64 },
    Processing { started_at: DateTime<Utc> },
    Completed { result: BatchResult },
    NotFound,
}

/// Lifecycle notifications for subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    Queued { request_id: Uuid, priority: Priority, position: usize },
    Started { request_id: Uuid },
    Completed { request_id: Uuid, success_count: usize, error_count: usize },
    Cancelled { request_id: Uuid },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    pub submitted: u64,
    pub completed: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub average_processing_ms: f64,
    pub queue_length: usize,
    pub processing: usize,
}

struct CompletedEntry {
    result: BatchResult,
    finished: Instant,
}

/// Everything guarded by the scheduler lock; pop and mark-processing happen
/// in one critical section.
#[derive(Default)]
struct SchedulerState {
    queue: VecDeque<BatchRequest>,
    processing: HashMap<Uuid, DateTime<Utc>>,
    completed: HashMap<Uuid, CompletedEntry>,
    metrics: SchedulerMetrics,
    total_processing_ms: u64,
}

/// Handle to the running background loops
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    dispatch: JoinHandle<()>,
    cleanup: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop dispatching and wait for both loops to exit. Requests already
    /// processing run to completion in their own tasks.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.dispatch.await {
            log::error!("Dispatch loop ended abnormally: {}", e);
        }
        if let Err(e) = self.cleanup.await {
            log::error!("Cleanup loop ended abnormally: {}", e);
        }
        log::info!("Batch scheduler stopped");
    }
}

#[derive(Clone)]
pub struct BatchScheduler {
    config: SchedulerConfig,
    recommender: Recommender,
    progress: ProgressTracker,
    rate_limiter: RateLimiter,
    provider_key: String,
    state: Arc<Mutex<SchedulerState>>,
    semaphore: Arc<Semaphore>,
    events: broadcast::Sender<BatchEvent>,
}

impl BatchScheduler {
    pub fn new(config: SchedulerConfig, recommender: Recommender, rate_limiter: RateLimiter) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            progress: recommender.progress().clone(),
            provider_key: recommender.embeddings().config().provider_key.clone(),
            recommender,
            rate_limiter,
            state: Arc::new(Mutex::new(SchedulerState::default())),
            events,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.events.subscribe()
    }

    /// Queue a batch and return its id.
    pub async fn submit(
        &self,
        subject_ids: Vec<String>,
        options: RecommendationOptions,
        priority: Priority,
    ) -> PipelineResult<Uuid> {
        let mut state = self.state.lock().await;

        let rejection = if subject_ids.is_empty() {
            Some(PipelineError::EmptyBatch)
        } else if subject_ids.len() > self.config.max_batch_size {
            Some(PipelineError::BatchTooLarge {
                size: subject_ids.len(),
                max_size: self.config.max_batch_size,
            })
        } else if let Err(e) = options.validate() {
            Some(e)
        } else if state.queue.len() >= self.config.max_queue_size {
            Some(PipelineError::QueueFull {
                max_size: self.config.max_queue_size,
            })
        } else {
            None
        };
        if let Some(error) = rejection {
            state.metrics.rejected += 1;
            log::warn!("Rejected batch submission: {}", error);
            return Err(error);
        }

        let request = BatchRequest {
            id: Uuid::new_v4(),
            estimated_duration_ms: self.progress.estimated_duration() * subject_ids.len() as u64,
            subject_ids,
            options,
            priority,
            created_at: Utc::now(),
        };
        let request_id = request.id;

        for subject_id in &request.subject_ids {
            self.progress.start_request(request_id, subject_id);
        }

        // Stable insertion: after every request of equal or higher priority.
        let index = state
            .queue
            .iter()
            .position(|queued| queued.priority < priority)
            .unwrap_or(state.queue.len());
        state.queue.insert(index, request);
        state.metrics.submitted += 1;

        log::info!(
            "Queued batch {} ({:?}) at position {}",
            request_id,
            priority,
            index + 1
        );
        let _ = self.events.send(BatchEvent::Queued {
            request_id,
            priority,
            position: index + 1,
        });
        Ok(request_id)
    }

    pub async fn status(&self, request_id: Uuid) -> RequestStatus {
        let state = self.state.lock().await;

        if let Some(index) = state.queue.iter().position(|r| r.id == request_id) {
            let estimated_wait_ms = state
                .queue
                .iter()
                .take(index)
                .map(|r| r.estimated_duration_ms)
                .sum();
            return RequestStatus::Queued {
                position: index + 1,
                estimated_wait_ms,
            };
        }
        if let Some(started_at) = state.processing.get(&request_id) {
            return RequestStatus::Processing {
                started_at: *started_at,
            };
        }
        match state.completed.get(&request_id) {
            Some(entry) => RequestStatus::Completed {
                result: entry.result.clone(),
            },
            None => RequestStatus::NotFound,
        }
    }

    /// Remove a queued request. Processing and completed requests stay as they are.
    pub async fn cancel(&self, request_id: Uuid) -> PipelineResult<()> {
        let mut state = self.state.lock().await;

        let Some(index) = state.queue.iter().position(|r| r.id == request_id) else {
            let current = if state.processing.contains_key(&request_id) {
                "processing"
            } else if state.completed.contains_key(&request_id) {
                "completed"
            } else {
                return Err(PipelineError::RequestNotFound { request_id });
            };
            return Err(PipelineError::NotCancellable {
                request_id,
                state: current.to_string(),
            });
        };

        if let Some(request) = state.queue.remove(index) {
            for subject_id in &request.subject_ids {
                let _ = self.progress.fail_request(request_id, subject_id, "cancelled");
            }
        }
        state.metrics.cancelled += 1;
        drop(state);

        log::info!("Cancelled batch {}", request_id);
        let _ = self.events.send(BatchEvent::Cancelled { request_id });
        Ok(())
    }

    /// Queued requests as `(id, priority)` in dequeue order
    pub async fn queue_snapshot(&self) -> Vec<(Uuid, Priority)> {
        let state = self.state.lock().await;
        state.queue.iter().map(|r| (r.id, r.priority)).collect()
    }

    pub async fn metrics(&self) -> SchedulerMetrics {
        let state = self.state.lock().await;
        SchedulerMetrics {
            queue_length: state.queue.len(),
            processing: state.processing.len(),
            ..state.metrics.clone()
        }
    }

    /// Poll until the request completes or `timeout` passes.
    pub async fn wait_for_completion(&self, request_id: Uuid, timeout: Duration) -> PipelineResult<BatchResult> {
        let deadline = Instant::now() + timeout;
        let poll = Duration::from_millis(self.config.tick_interval_ms.max(1));

        loop {
            match self.status(request_id).await {
                RequestStatus::Completed { result } => return Ok(result),
                RequestStatus::NotFound => return Err(PipelineError::RequestNotFound { request_id }),
                RequestStatus::Queued { .. } | RequestStatus::Processing { .. } => {}
            }
            if Instant::now() >= deadline {
                return Err(PipelineError::DeadlineExceeded {
                    deadline_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Pull at most one request and start processing it. Returns the id of
    /// the dispatched request, or `None` when nothing could be dispatched.
    pub async fn dispatch_next(&self) -> Option<Uuid> {
        if self.rate_limiter.is_exhausted(&self.provider_key, EMBEDDINGS_ENDPOINT) {
            log::debug!("Provider rate budget exhausted, holding queue");
            return None;
        }
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;

        let request = {
            let mut state = self.state.lock().await;
            let request = state.queue.pop_front()?;
            state.processing.insert(request.id, Utc::now());
            request
        };

        let request_id = request.id;
        let _ = self.events.send(BatchEvent::Started { request_id });

        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_request(request, permit).await;
        });
        Some(request_id)
    }

    async fn run_request(&self, request: BatchRequest, permit: OwnedSemaphorePermit) {
        let started_at = Utc::now();
        let started = Instant::now();
        let deadline_ms = self.config.request_deadline_ms;
        log::info!(
            "Processing batch {} with {} subjects",
            request.id,
            request.subject_ids.len()
        );

        let outcomes = BatchOutcomes::new();
        let recommender = self.recommender.clone();
        let (request_id, subject_ids, options, sink) = (
            request.id,
            request.subject_ids.clone(),
            request.options.clone(),
            outcomes.clone(),
        );
        let task = tokio::spawn(async move {
            recommender
                .recommend_batch_into(request_id, &subject_ids, &options, &sink)
                .await
        });
        let abort = task.abort_handle();

        let outcome = tokio::time::timeout(Duration::from_millis(deadline_ms), task).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(Ok(batch))) => BatchResult::from_results(
                request.id,
                batch.results,
                batch.result_cache_hits,
                batch.embedding_cache_hit_rate,
                started_at,
                elapsed_ms,
            ),
            Ok(Ok(Err(error))) => self.fail_unfinished(&request, &outcomes, error, started_at, elapsed_ms),
            Ok(Err(join_error)) => {
                log::error!("Batch {} task failed: {}", request.id, join_error);
                self.fail_unfinished(
                    &request,
                    &outcomes,
                    PipelineError::internal("request processing panicked"),
                    started_at,
                    elapsed_ms,
                )
            }
            Err(_) => {
                abort.abort();
                log::warn!("Batch {} exceeded its {}ms deadline", request.id, deadline_ms);
                self.fail_unfinished(
                    &request,
                    &outcomes,
                    PipelineError::DeadlineExceeded { deadline_ms },
                    started_at,
                    elapsed_ms,
                )
            }
        };

        let (success_count, error_count) = (result.success_count, result.error_count);
        {
            let mut state = self.state.lock().await;
            state.processing.remove(&request.id);
            state.metrics.completed += 1;
            state.total_processing_ms += elapsed_ms;
            state.metrics.average_processing_ms =
                state.total_processing_ms as f64 / state.metrics.completed as f64;
            state.completed.insert(
                request.id,
                CompletedEntry {
                    result,
                    finished: Instant::now(),
                },
            );
        }
        drop(permit);

        log::info!(
            "Completed batch {}: {} succeeded, {} failed in {}ms",
            request.id,
            success_count,
            error_count,
            elapsed_ms
        );
        let _ = self.events.send(BatchEvent::Completed {
            request_id: request.id,
            success_count,
            error_count,
        });
    }

    /// Keep the outcomes already recorded; every other subject gets `error`
    /// and its progress record is closed as failed.
    fn fail_unfinished(
        &self,
        request: &BatchRequest,
        outcomes: &BatchOutcomes,
        error: PipelineError,
        started_at: DateTime<Utc>,
        elapsed_ms: u64,
    ) -> BatchResult {
        let reason = error.to_string();
        for subject_id in &request.subject_ids {
            if !outcomes.is_finished(subject_id) {
                let _ = self.progress.fail_request(request.id, subject_id, &reason);
            }
        }
        let results = outcomes.results_for(&request.subject_ids, &error);
        BatchResult::from_results(
            request.id,
            results,
            outcomes.result_cache_hits(),
            0.0,
            started_at,
            elapsed_ms,
        )
    }

    /// Drop completed results older than the retention window.
    pub async fn cleanup_completed(&self) -> usize {
        let retention = Duration::from_secs(self.config.retention_secs);
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let before = state.completed.len();
        state
            .completed
            .retain(|_, entry| now.saturating_duration_since(entry.finished) < retention);
        before - state.completed.len()
    }

    /// Spawn the dispatch and retention loops.
    pub fn start(&self) -> SchedulerHandle {
        let (shutdown, receiver) = watch::channel(false);

        let dispatcher = self.clone();
        let mut stop = receiver.clone();
        let dispatch = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(dispatcher.config.tick_interval_ms.max(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        dispatcher.dispatch_next().await;
                    }
                    _ = stop.changed() => break,
                }
            }
        });

        let cleaner = self.clone();
        let mut stop = receiver;
        let cleanup = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(cleaner.config.cleanup_interval_secs.max(1)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = cleaner.cleanup_completed().await;
                        if removed > 0 {
                            log::debug!("Dropped {} expired batch results", removed);
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        });

        log::info!(
            "Batch scheduler started with {} max concurrent requests",
            self.config.max_concurrent
        );
        SchedulerHandle {
            shutdown,
            dispatch,
            cleanup,
        }
    }
}
