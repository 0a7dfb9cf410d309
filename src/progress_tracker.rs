//! Staged progress for in-flight recommendation work.
//!
//! One record exists per (request, subject). Every transition publishes a
//! [`ProgressEvent`] on a broadcast channel; transports subscribe without the
//! tracker knowing about them. Callers feed a bounded history of processing
//! durations used for ETA and queue-wait estimates.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use crate::errors::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressStage {
    Queued,
    ValidatingProfile,
    FetchingProjects,
    GeneratingEmbeddings,
    CalculatingSimilarity,
    ApplyingFilters,
    RankingResults,
    GeneratingExplanations,
    CachingResults,
    Completed,
    Error,
}

impl ProgressStage {
    /// Target percentage reached when the stage begins
    pub fn percentage(self) -> u8 {
        match self {
            ProgressStage::Queued => 5,
            ProgressStage::ValidatingProfile => 15,
            ProgressStage::FetchingProjects => 25,
            ProgressStage::GeneratingEmbeddings => 45,
            ProgressStage::CalculatingSimilarity => 65,
            ProgressStage::ApplyingFilters => 75,
            ProgressStage::RankingResults => 85,
            ProgressStage::GeneratingExplanations => 95,
            ProgressStage::CachingResults => 98,
            ProgressStage::Completed => 100,
            ProgressStage::Error => 0,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ProgressStage::Queued => "Request queued",
            ProgressStage::ValidatingProfile => "Validating profile",
            ProgressStage::FetchingProjects => "Fetching projects",
            ProgressStage::GeneratingEmbeddings => "Generating embeddings",
            ProgressStage::CalculatingSimilarity => "Calculating similarity",
            ProgressStage::ApplyingFilters => "Applying filters",
            ProgressStage::RankingResults => "Ranking results",
            ProgressStage::GeneratingExplanations => "Generating explanations",
            ProgressStage::CachingResults => "Caching results",
            ProgressStage::Completed => "Recommendations ready",
            ProgressStage::Error => "Recommendation failed",
        }
    }

    pub fn detail(self) -> &'static str {
        match self {
            ProgressStage::Queued => "Waiting for an available worker",
            ProgressStage::ValidatingProfile => "Checking that the student profile has skills or interests",
            ProgressStage::FetchingProjects => "Loading approved projects from the catalogue",
            ProgressStage::GeneratingEmbeddings => "Converting the profile and projects into vectors",
            ProgressStage::CalculatingSimilarity => "Comparing the profile against every project",
            ProgressStage::ApplyingFilters => "Removing projects below the similarity threshold",
            ProgressStage::RankingResults => "Ordering projects by similarity",
            ProgressStage::GeneratingExplanations => "Explaining why each project matches",
            ProgressStage::CachingResults => "Saving recommendations for quick access",
            ProgressStage::Completed => "All stages finished",
            ProgressStage::Error => "Processing stopped because of an error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ProgressStage::Completed | ProgressStage::Error)
    }

    fn rank(self) -> u8 {
        match self {
            ProgressStage::Error => u8::MAX,
            other => other.percentage(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProgressError {
    #[error("No progress record for request {request_id} subject {subject_id}")]
    NotFound { request_id: Uuid, subject_id: String },

    #[error("Cannot move from {from:?} back to {to:?}")]
    StageRegression { from: ProgressStage, to: ProgressStage },

    #[error("Progress for request {request_id} already finished")]
    AlreadyFinished { request_id: Uuid },

    #[error("{stage:?} is terminal; use complete_request or fail_request")]
    TerminalStage { stage: ProgressStage },

    #[error("Progress for request {request_id} has already left the queue")]
    AlreadyProcessing { request_id: Uuid },

    #[error("Percentage {percentage} is above 100")]
    InvalidPercentage { percentage: u8 },
}

impl From<ProgressError> for PipelineError {
    fn from(error: ProgressError) -> Self {
        PipelineError::internal(error.to_string())
    }
}

pub type ProgressResult<T> = Result<T, ProgressError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Finished durations kept for estimates
    pub history_size: usize,
    /// Estimate used before any request has finished
    pub default_duration_ms: u64,
    /// How long finished records stay readable
    pub grace_period_secs: u64,
    /// Records older than this are dropped whatever their stage
    pub max_age_secs: u64,
    pub sweep_interval_secs: u64,
    /// Broadcast channel capacity
    pub event_buffer: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            history_size: 100,
            default_duration_ms: 2_000,
            grace_period_secs: 60,
            max_age_secs: 600,
            sweep_interval_secs: 30,
            event_buffer: 256,
        }
    }
}

/// Published on every transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub request_id: Uuid,
    pub subject_id: String,
    pub stage: ProgressStage,
    pub percentage: u8,
    pub message: String,
    pub detail: String,
    pub estimated_remaining_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Read-only view of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub request_id: Uuid,
    pub subject_id: String,
    pub stage: ProgressStage,
    pub percentage: u8,
    pub message: String,
    pub detail: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub estimated_remaining_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct RecordState {
    stage: ProgressStage,
    percentage: u8,
    message: String,
    detail: String,
    started_at: DateTime<Utc>,
    started: Instant,
    finished: Option<Instant>,
    error: Option<String>,
}

type ProgressKey = (Uuid, String);

/// `elapsed / (pct / 100) - elapsed`, floored at zero.
pub fn estimate_remaining_ms(elapsed_ms: u64, percentage: u8) -> Option<u64> {
    if percentage == 0 {
        return None;
    }
    if percentage >= 100 {
        return Some(0);
    }
    let total = elapsed_ms as f64 / (percentage as f64 / 100.0);
    Some((total - elapsed_ms as f64).max(0.0).round() as u64)
}

#[derive(Clone)]
pub struct ProgressTracker {
    records: Arc<DashMap<ProgressKey, RecordState>>,
    durations: Arc<Mutex<VecDeque<u64>>>,
    events: broadcast::Sender<ProgressEvent>,
    config: ProgressConfig,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(ProgressConfig::default())
    }
}

impl ProgressTracker {
    pub fn new(config: ProgressConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            records: Arc::new(DashMap::new()),
            durations: Arc::new(Mutex::new(VecDeque::with_capacity(config.history_size))),
            events,
            config,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    fn key(request_id: Uuid, subject_id: &str) -> ProgressKey {
        (request_id, subject_id.to_string())
    }

    fn remaining_for(&self, state: &RecordState, now: Instant) -> u64 {
        if state.stage.is_terminal() {
            return 0;
        }
        let elapsed = now.saturating_duration_since(state.started).as_millis() as u64;
        estimate_remaining_ms(elapsed, state.percentage)
            .unwrap_or_else(|| self.estimated_duration().saturating_sub(elapsed))
    }

    fn publish(&self, request_id: Uuid, subject_id: &str, state: &RecordState, now: Instant) -> ProgressEvent {
        let event = ProgressEvent {
            request_id,
            subject_id: subject_id.to_string(),
            stage: state.stage,
            percentage: state.percentage,
            message: state.message.clone(),
            detail: state.detail.clone(),
            estimated_remaining_ms: self.remaining_for(state, now),
            timestamp: Utc::now(),
        };
        // No subscribers is fine.
        let _ = self.events.send(event.clone());
        event
    }

    /// Create (or restart) the record for a subject at `Queued`.
    pub fn start_request(&self, request_id: Uuid, subject_id: &str) -> ProgressEvent {
        let now = Instant::now();
        let stage = ProgressStage::Queued;
        let state = RecordState {
            stage,
            percentage: stage.percentage(),
            message: stage.message().to_string(),
            detail: stage.detail().to_string(),
            started_at: Utc::now(),
            started: now,
            finished: None,
            error: None,
        };
        let event = self.publish(request_id, subject_id, &state, now);
        self.records.insert(Self::key(request_id, subject_id), state);
        event
    }

    /// Restart a queued record's clock when a worker picks it up, so elapsed
    /// time and ETAs cover processing only.
    pub fn begin_processing(&self, request_id: Uuid, subject_id: &str) -> ProgressResult<()> {
        let mut state = self
            .records
            .get_mut(&Self::key(request_id, subject_id))
            .ok_or_else(|| ProgressError::NotFound {
                request_id,
                subject_id: subject_id.to_string(),
            })?;

        if state.finished.is_some() {
            return Err(ProgressError::AlreadyFinished { request_id });
        }
        if state.stage != ProgressStage::Queued {
            return Err(ProgressError::AlreadyProcessing { request_id });
        }
        state.started = Instant::now();
        Ok(())
    }

    /// Move a subject to a later non-terminal stage.
    ///
    /// `percentage` defaults to the stage target and never moves backwards;
    /// `message` defaults to the stage message.
    pub fn update_progress(
        &self,
        request_id: Uuid,
        subject_id: &str,
        stage: ProgressStage,
        percentage: Option<u8>,
        message: Option<&str>,
    ) -> ProgressResult<ProgressEvent> {
        if stage.is_terminal() {
            return Err(ProgressError::TerminalStage { stage });
        }
        if let Some(p) = percentage {
            if p > 100 {
                return Err(ProgressError::InvalidPercentage { percentage: p });
            }
        }

        let now = Instant::now();
        let mut state = self
            .records
            .get_mut(&Self::key(request_id, subject_id))
            .ok_or_else(|| ProgressError::NotFound {
                request_id,
                subject_id: subject_id.to_string(),
            })?;

        if state.finished.is_some() {
            return Err(ProgressError::AlreadyFinished { request_id });
        }
        if stage.rank() < state.stage.rank() {
            return Err(ProgressError::StageRegression {
                from: state.stage,
                to: stage,
            });
        }

        state.stage = stage;
        state.percentage = percentage.unwrap_or(stage.percentage()).max(state.percentage);
        state.message = message.unwrap_or(stage.message()).to_string();
        state.detail = stage.detail().to_string();

        Ok(self.publish(request_id, subject_id, &state, now))
    }

    fn finish(
        &self,
        request_id: Uuid,
        subject_id: &str,
        stage: ProgressStage,
        error: Option<String>,
    ) -> ProgressResult<ProgressEvent> {
        let now = Instant::now();
        let mut state = self
            .records
            .get_mut(&Self::key(request_id, subject_id))
            .ok_or_else(|| ProgressError::NotFound {
                request_id,
                subject_id: subject_id.to_string(),
            })?;

        if state.finished.is_some() {
            return Err(ProgressError::AlreadyFinished { request_id });
        }

        state.stage = stage;
        state.percentage = stage.percentage();
        state.message = stage.message().to_string();
        state.detail = error.clone().unwrap_or_else(|| stage.detail().to_string());
        state.error = error;
        state.finished = Some(now);

        Ok(self.publish(request_id, subject_id, &state, now))
    }

    pub fn complete_request(&self, request_id: Uuid, subject_id: &str) -> ProgressResult<ProgressEvent> {
        self.finish(request_id, subject_id, ProgressStage::Completed, None)
    }

    pub fn fail_request(
        &self,
        request_id: Uuid,
        subject_id: &str,
        reason: &str,
    ) -> ProgressResult<ProgressEvent> {
        self.finish(request_id, subject_id, ProgressStage::Error, Some(reason.to_string()))
    }

    pub fn get_progress(&self, request_id: Uuid, subject_id: &str) -> Option<ProgressRecord> {
        let now = Instant::now();
        self.records
            .get(&Self::key(request_id, subject_id))
            .map(|state| self.snapshot(request_id, subject_id, &state, now))
    }

    /// All subject records of one request, ordered by subject id.
    pub fn request_progress(&self, request_id: Uuid) -> Vec<ProgressRecord> {
        let now = Instant::now();
        let mut records: Vec<ProgressRecord> = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == request_id)
            .map(|entry| self.snapshot(request_id, &entry.key().1, entry.value(), now))
            .collect();
        records.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));
        records
    }

    fn snapshot(&self, request_id: Uuid, subject_id: &str, state: &RecordState, now: Instant) -> ProgressRecord {
        let end = state.finished.unwrap_or(now);
        ProgressRecord {
            request_id,
            subject_id: subject_id.to_string(),
            stage: state.stage,
            percentage: state.percentage,
            message: state.message.clone(),
            detail: state.detail.clone(),
            started_at: state.started_at,
            elapsed_ms: end.saturating_duration_since(state.started).as_millis() as u64,
            estimated_remaining_ms: self.remaining_for(state, now),
            error: state.error.clone(),
        }
    }

    /// Records not yet completed or failed
    pub fn active_count(&self) -> usize {
        self.records.iter().filter(|e| e.finished.is_none()).count()
    }

    /// Add a processing duration to the bounded history.
    pub fn record_duration(&self, duration_ms: u64) {
        let cap = self.config.history_size.max(1);
        let mut durations = self.durations.lock();
        while durations.len() >= cap {
            durations.pop_front();
        }
        durations.push_back(duration_ms);
    }

    /// Mean of recent durations, or the configured default when there are none.
    pub fn estimated_duration(&self) -> u64 {
        let durations = self.durations.lock();
        if durations.is_empty() {
            return self.config.default_duration_ms;
        }
        durations.iter().sum::<u64>() / durations.len() as u64
    }

    /// Expected wait for work with `requests_ahead` items queued in front of
    /// it and `concurrency` workers draining the queue.
    pub fn estimate_queue_wait(&self, requests_ahead: usize, concurrency: usize) -> u64 {
        let rounds = requests_ahead.div_ceil(concurrency.max(1));
        rounds as u64 * self.estimated_duration()
    }

    /// Drop finished records past the grace period and any record past the
    /// maximum age. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let grace = Duration::from_secs(self.config.grace_period_secs);
        let max_age = Duration::from_secs(self.config.max_age_secs);
        let before = self.records.len();

        self.records.retain(|_, state| {
            let too_old = now.saturating_duration_since(state.started) >= max_age;
            let expired = state
                .finished
                .map(|done| now.saturating_duration_since(done) >= grace)
                .unwrap_or(false);
            !(too_old || expired)
        });

        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            log::debug!("Progress sweep removed {} records", removed);
        }
        removed
    }

    pub fn spawn_cleanup_task(&self) -> tokio::task::JoinHandle<()> {
        let tracker = self.clone();
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                tracker.sweep();
            }
        })
    }
}
