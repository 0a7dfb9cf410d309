//! Recommendation-serving pipeline for final-year project matching.
//!
//! Turns student profiles and the approved project catalogue into ranked,
//! explained recommendations behind a priority batch queue, two cache tiers,
//! a rate limiter and a circuit breaker guarding the embedding service.

// Module declarations
pub mod errors;
pub mod types;
pub mod config;
pub mod rate_limiter;
pub mod circuit_breaker;
pub mod text_processing;
pub mod embedding_cache;
pub mod embedding_provider;
pub mod embedding_service;
pub mod similarity_search;
pub mod recommendation_cache;
pub mod progress_tracker;
pub mod storage;
pub mod recommender;
pub mod batch_scheduler;
pub mod pipeline;

// Re-exports for commonly used types
pub use batch_scheduler::{BatchEvent, BatchResult, BatchScheduler, Priority, RequestStatus, SchedulerConfig};
pub use config::{ConfigError, PipelineConfig};
pub use embedding_provider::{EmbeddingProvider, HttpEmbeddingProvider, ProviderConfig};
pub use errors::{PipelineError, PipelineResult};
pub use pipeline::{PipelineHandle, RecommendationPipeline};
pub use progress_tracker::{ProgressEvent, ProgressStage, ProgressTracker};
pub use recommender::{Recommender, SubjectResult};
pub use storage::{CandidateFilter, InMemoryStore, RecommendationStore};
pub use types::{
    ProjectCandidate, ProjectRecommendation, RecommendationOptions, RecommendationSet, StudentProfile,
};
