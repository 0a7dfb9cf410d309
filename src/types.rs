use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{PipelineError, PipelineResult};

/// Hard upper bound on recommendations returned per student.
pub const MAX_RECOMMENDATION_LIMIT: usize = 50;

/// Student profile as read from storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentProfile {
    pub student_id: String,
    pub name: String,
    pub skills: Vec<String>,
    pub interests: Vec<String>,
    pub preferred_specializations: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl StudentProfile {
    /// Profile fields required before a profile can be embedded.
    pub fn missing_fields(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.skills.iter().all(|s| s.trim().is_empty()) {
            missing.push("skills".to_string());
        }
        if self.interests.iter().all(|s| s.trim().is_empty()) {
            missing.push("interests".to_string());
        }
        missing
    }

    /// A profile is usable when it carries skills or interests.
    pub fn is_complete(&self) -> bool {
        self.missing_fields().len() < 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifficultyLevel {
    Beginner,
    Intermediate,
    Advanced,
}

/// Project from the catalogue that may be recommended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectCandidate {
    pub project_id: String,
    pub title: String,
    pub abstract_text: String,
    pub specialization: String,
    pub difficulty_level: DifficultyLevel,
    pub tags: Vec<String>,
    pub technology_stack: Vec<String>,
    pub supervisor_id: Option<String>,
    pub status: ApprovalStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorInfo {
    pub supervisor_id: String,
    pub name: String,
    pub specializations: Vec<String>,
}

/// Display data for the supervisor attached to a recommendation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSummary {
    pub supervisor_id: String,
    pub name: String,
}

impl From<&SupervisorInfo> for SupervisorSummary {
    fn from(info: &SupervisorInfo) -> Self {
        Self {
            supervisor_id: info.supervisor_id.clone(),
            name: info.name.clone(),
        }
    }
}

/// A single ranked, explained recommendation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecommendation {
    pub project_id: String,
    pub title: String,
    pub abstract_text: String,
    pub specialization: String,
    pub difficulty_level: DifficultyLevel,
    /// Similarity in [0, 1]
    pub similarity_score: f32,
    pub match_reasons: Vec<String>,
    pub supervisor: Option<SupervisorSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationMethod {
    /// Embedding similarity
    Ai,
    /// Produced by the rule-based recommender outside this crate
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationMetadata {
    pub method: RecommendationMethod,
    pub model: String,
    /// Fraction of embeddings served from the embedding cache while building this set
    pub embedding_cache_hit_rate: f64,
    pub candidates_considered: usize,
    pub processing_time_ms: u64,
}

/// Final ranked recommendation set for one student; the unit stored in the
/// recommendation result cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationSet {
    pub student_id: String,
    pub recommendations: Vec<ProjectRecommendation>,
    pub average_score: f32,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: RecommendationMetadata,
    /// Set on read by the cache; never trust a stored value
    pub from_cache: bool,
}

impl RecommendationSet {
    pub fn average_of(recommendations: &[ProjectRecommendation]) -> f32 {
        if recommendations.is_empty() {
            return 0.0;
        }
        recommendations.iter().map(|r| r.similarity_score).sum::<f32>() / recommendations.len() as f32
    }
}

/// Optional candidate filters applied after similarity scoring
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecommendationFilters {
    /// Restrict candidates to these specializations (empty = no restriction)
    #[serde(default)]
    pub specializations: Vec<String>,
    #[serde(default)]
    pub difficulty_levels: Vec<DifficultyLevel>,
    #[serde(default)]
    pub exclude_project_ids: Vec<String>,
}

impl RecommendationFilters {
    pub fn is_empty(&self) -> bool {
        self.specializations.is_empty()
            && self.difficulty_levels.is_empty()
            && self.exclude_project_ids.is_empty()
    }

    /// Post-scoring filter; specialization is applied at fetch time.
    pub fn admits(&self, candidate: &ProjectCandidate) -> bool {
        if self.exclude_project_ids.iter().any(|id| id == &candidate.project_id) {
            return false;
        }
        if !self.difficulty_levels.is_empty()
            && !self.difficulty_levels.contains(&candidate.difficulty_level)
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationOptions {
    pub limit: usize,
    /// Minimum similarity in [0, 1]
    pub min_similarity: f32,
    #[serde(default)]
    pub filters: RecommendationFilters,
    /// Ignore the result cache and recompute
    #[serde(default)]
    pub force_refresh: bool,
}

impl Default for RecommendationOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            min_similarity: 0.3,
            filters: RecommendationFilters::default(),
            force_refresh: false,
        }
    }
}

impl RecommendationOptions {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.limit == 0 || self.limit > MAX_RECOMMENDATION_LIMIT {
            return Err(PipelineError::InvalidInput {
                message: format!(
                    "limit must be between 1 and {}, got {}",
                    MAX_RECOMMENDATION_LIMIT, self.limit
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.min_similarity) {
            return Err(PipelineError::InvalidInput {
                message: format!("min_similarity must be within [0, 1], got {}", self.min_similarity),
            });
        }
        Ok(())
    }

    /// Whether two option sets produce the same ranking. `force_refresh`
    /// only affects cache use and is ignored.
    pub fn same_query(&self, other: &Self) -> bool {
        self.limit == other.limit
            && self.min_similarity == other.min_similarity
            && self.filters == other.filters
    }
}
