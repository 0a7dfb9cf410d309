use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Error taxonomy shared by every stage of the recommendation pipeline.
///
/// Per-subject failures inside a batch are stored in that subject's result
/// slot, so the type is `Clone` and serializable.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineError {
    #[error("Rate limit exceeded, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("Circuit '{key}' is open, retry after {retry_after_ms}ms")]
    CircuitOpen { key: String, retry_after_ms: u64 },

    #[error("Embedding provider failure: {message}")]
    ProviderFailure { message: String, retryable: bool },

    #[error("No eligible candidate projects")]
    NoCandidates,

    #[error("Student profile not found: {subject_id}")]
    SubjectNotFound { subject_id: String },

    #[error("Student profile {subject_id} is incomplete (missing: {})", .missing.join(", "))]
    IncompleteProfile { subject_id: String, missing: Vec<String> },

    #[error("Queue is full (max size: {max_size})")]
    QueueFull { max_size: usize },

    #[error("Batch of {size} subjects exceeds the maximum of {max_size}")]
    BatchTooLarge { size: usize, max_size: usize },

    #[error("Batch contains no subjects")]
    EmptyBatch,

    #[error("Request {request_id} not found")]
    RequestNotFound { request_id: Uuid },

    #[error("Request {request_id} cannot be cancelled while {state}")]
    NotCancellable { request_id: Uuid, state: String },

    #[error("Request exceeded its deadline of {deadline_ms}ms")]
    DeadlineExceeded { deadline_ms: u64 },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// Wrap an error coming back from a storage implementation.
    pub fn storage(error: anyhow::Error) -> Self {
        PipelineError::Storage {
            message: format!("{:#}", error),
        }
    }

    pub fn provider(message: impl Into<String>, retryable: bool) -> Self {
        PipelineError::ProviderFailure {
            message: message.into(),
            retryable,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        PipelineError::Internal {
            message: message.into(),
        }
    }

    /// Whether the same request may succeed later without caller changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::RateLimited { .. }
            | PipelineError::CircuitOpen { .. }
            | PipelineError::DeadlineExceeded { .. }
            | PipelineError::Storage { .. } => true,
            PipelineError::ProviderFailure { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Whether the caller should hand the subject to the rule-based recommender.
    pub fn suggests_fallback(&self) -> bool {
        matches!(
            self,
            PipelineError::NoCandidates
                | PipelineError::ProviderFailure { .. }
                | PipelineError::CircuitOpen { .. }
        )
    }

    /// Stable machine-readable code.
    pub fn error_code(&self) -> &'static str {
        match self {
            PipelineError::RateLimited { .. } => "RATE_LIMITED",
            PipelineError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            PipelineError::ProviderFailure { .. } => "PROVIDER_FAILURE",
            PipelineError::NoCandidates => "NO_CANDIDATES",
            PipelineError::SubjectNotFound { .. } => "SUBJECT_NOT_FOUND",
            PipelineError::IncompleteProfile { .. } => "INCOMPLETE_PROFILE",
            PipelineError::QueueFull { .. } => "QUEUE_FULL",
            PipelineError::BatchTooLarge { .. } => "BATCH_TOO_LARGE",
            PipelineError::EmptyBatch => "EMPTY_BATCH",
            PipelineError::RequestNotFound { .. } => "REQUEST_NOT_FOUND",
            PipelineError::NotCancellable { .. } => "NOT_CANCELLABLE",
            PipelineError::DeadlineExceeded { .. } => "DEADLINE_EXCEEDED",
            PipelineError::Storage { .. } => "STORAGE_ERROR",
            PipelineError::InvalidInput { .. } => "INVALID_INPUT",
            PipelineError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Create a user-friendly error message for display in the frontend
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::RateLimited { retry_after_seconds } => {
                format!(
                    "Too many recommendation requests. Please try again in {} seconds.",
                    retry_after_seconds
                )
            }
            PipelineError::CircuitOpen { .. } => {
                "The recommendation service is temporarily unavailable. Please try again shortly.".to_string()
            }
            PipelineError::ProviderFailure { .. } => {
                "AI recommendations could not be generated right now.".to_string()
            }
            PipelineError::NoCandidates => {
                "There are no approved projects matching your criteria yet.".to_string()
            }
            PipelineError::SubjectNotFound { subject_id } => {
                format!("No student profile was found for '{}'.", subject_id)
            }
            PipelineError::IncompleteProfile { missing, .. } => {
                format!(
                    "Please complete your profile ({}) to receive recommendations.",
                    missing.join(", ")
                )
            }
            PipelineError::QueueFull { .. } => {
                "The recommendation queue is full. Please try again later.".to_string()
            }
            PipelineError::BatchTooLarge { max_size, .. } => {
                format!("Batches are limited to {} students.", max_size)
            }
            PipelineError::EmptyBatch => "Select at least one student.".to_string(),
            PipelineError::RequestNotFound { .. } => {
                "The recommendation request could not be found. It may have expired.".to_string()
            }
            PipelineError::NotCancellable { .. } => {
                "The request is already being processed and cannot be cancelled.".to_string()
            }
            PipelineError::DeadlineExceeded { .. } => {
                "Generating recommendations took too long. Please try again.".to_string()
            }
            PipelineError::Storage { .. } | PipelineError::Internal { .. } => {
                "Something went wrong while generating recommendations.".to_string()
            }
            PipelineError::InvalidInput { message } => format!("Invalid request: {}", message),
        }
    }
}

/// Convert PipelineError to String for transport layers that only carry text
impl From<PipelineError> for String {
    fn from(error: PipelineError) -> Self {
        error.user_message()
    }
}
