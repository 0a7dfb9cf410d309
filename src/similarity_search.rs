//! Similarity engine for ranking project candidates against a student.
//!
//! ## Cosine similarity
//!
//! ```text
//! cosine(A, B) = (A · B) / (||A|| * ||B||)
//! ```
//!
//! Cosine lives in `[-1, 1]`. Recommendation scores are reported in `[0, 1]`
//! using `score = (cosine + 1) / 2`, so 0.5 means orthogonal.
//!
//! A zero-magnitude vector carries no direction; it scores cosine 0 and a
//! score of 0 rather than failing the batch.
//!
//! ## Batch ranking
//!
//! [`SimilarityEngine::calculate_batch_similarity`] computes the subject norm
//! once and does a single pass over each candidate, so ranking `n` candidates
//! of dimension `d` costs O(n·d) plus O(n log n) for the sort. The sort is
//! stable: equal scores keep their original candidate order.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::PipelineError;

/// Errors that can occur while scoring vectors
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SimilarityError {
    #[error("Vector dimension mismatch: subject has {subject_dim} dimensions, candidate {index} has {candidate_dim}")]
    DimensionMismatch {
        subject_dim: usize,
        candidate_dim: usize,
        index: usize,
    },

    #[error("Empty vector provided: {vector_type}")]
    EmptyVector { vector_type: String },

    #[error("Invalid vector: contains non-finite values")]
    InvalidVector,

    #[error("Similarity threshold out of range: {threshold}")]
    InvalidThreshold { threshold: f32 },

    #[error("Zero vector magnitude detected")]
    ZeroMagnitude,
}

pub type SimilarityResult<T> = Result<T, SimilarityError>;

impl From<SimilarityError> for PipelineError {
    fn from(error: SimilarityError) -> Self {
        match error {
            // Vectors of different lengths mean the provider changed under us.
            SimilarityError::DimensionMismatch { .. } => PipelineError::provider(error.to_string(), false),
            other => PipelineError::InvalidInput {
                message: other.to_string(),
            },
        }
    }
}

/// Score of one pair of vectors
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityScore {
    /// Similarity mapped to [0, 1]
    pub score: f32,
    /// Raw cosine in [-1, 1]
    pub cosine: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchSimilarityOptions {
    /// Report scores in [0, 1] instead of raw cosine
    pub normalize_scores: bool,
    /// Candidates scoring below this are excluded
    pub min_threshold: f32,
    /// Keep at most this many results; 0 keeps all
    pub max_results: usize,
}

impl Default for BatchSimilarityOptions {
    fn default() -> Self {
        Self {
            normalize_scores: true,
            min_threshold: 0.0,
            max_results: 0,
        }
    }
}

/// Ranked output of a batch comparison.
///
/// `similarities[i]` is the score of candidate `ranked_indices[i]`; both are
/// ordered by descending score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSimilarity {
    pub similarities: Vec<f32>,
    pub ranked_indices: Vec<usize>,
}

impl BatchSimilarity {
    pub fn len(&self) -> usize {
        self.ranked_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranked_indices.is_empty()
    }

    /// `(candidate index, score)` pairs in rank order
    pub fn iter(&self) -> impl Iterator<Item = (usize, f32)> + '_ {
        self.ranked_indices
            .iter()
            .copied()
            .zip(self.similarities.iter().copied())
    }
}

/// Map a cosine in [-1, 1] to [0, 1].
pub fn cosine_to_score(cosine: f32) -> f32 {
    ((cosine + 1.0) / 2.0).clamp(0.0, 1.0)
}

fn validate_finite(vector: &[f32], vector_type: &str) -> SimilarityResult<()> {
    if vector.is_empty() {
        return Err(SimilarityError::EmptyVector {
            vector_type: vector_type.to_string(),
        });
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(SimilarityError::InvalidVector);
    }
    Ok(())
}

fn magnitude(vector: &[f32]) -> f32 {
    vector.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Cosine given a precomputed subject magnitude; `None` when either side has
/// zero magnitude.
fn cosine_with_norm(subject: &[f32], subject_norm: f32, candidate: &[f32]) -> SimilarityResult<Option<f32>> {
    let mut dot = 0.0f32;
    let mut sum_sq = 0.0f32;
    for (&a, &b) in subject.iter().zip(candidate) {
        if !b.is_finite() {
            return Err(SimilarityError::InvalidVector);
        }
        dot += a * b;
        sum_sq += b * b;
    }

    let candidate_norm = sum_sq.sqrt();
    if subject_norm == 0.0 || candidate_norm == 0.0 {
        return Ok(None);
    }
    // Rounding can push identical vectors slightly past 1.0.
    Ok(Some((dot / (subject_norm * candidate_norm)).clamp(-1.0, 1.0)))
}

/// Stateless similarity computations
pub struct SimilarityEngine;

impl SimilarityEngine {
    /// Score two vectors of equal dimension.
    pub fn calculate_similarity(a: &[f32], b: &[f32]) -> SimilarityResult<SimilarityScore> {
        validate_finite(a, "vector_a")?;
        if b.is_empty() {
            return Err(SimilarityError::EmptyVector {
                vector_type: "vector_b".to_string(),
            });
        }
        if a.len() != b.len() {
            return Err(SimilarityError::DimensionMismatch {
                subject_dim: a.len(),
                candidate_dim: b.len(),
                index: 0,
            });
        }

        Ok(match cosine_with_norm(a, magnitude(a), b)? {
            Some(cosine) => SimilarityScore {
                score: cosine_to_score(cosine),
                cosine,
            },
            None => SimilarityScore {
                score: 0.0,
                cosine: 0.0,
            },
        })
    }

    /// Score `subject` against every candidate, filter by threshold, rank and truncate.
    pub fn calculate_batch_similarity(
        subject: &[f32],
        candidates: &[Vec<f32>],
        options: &BatchSimilarityOptions,
    ) -> SimilarityResult<BatchSimilarity> {
        validate_finite(subject, "subject")?;
        if !options.min_threshold.is_finite() || !(-1.0..=1.0).contains(&options.min_threshold) {
            return Err(SimilarityError::InvalidThreshold {
                threshold: options.min_threshold,
            });
        }

        let subject_norm = magnitude(subject);
        let mut scored: Vec<(usize, f32)> = Vec::with_capacity(candidates.len());

        for (index, candidate) in candidates.iter().enumerate() {
            if candidate.len() != subject.len() {
                return Err(SimilarityError::DimensionMismatch {
                    subject_dim: subject.len(),
                    candidate_dim: candidate.len(),
                    index,
                });
            }

            let score = match cosine_with_norm(subject, subject_norm, candidate)? {
                Some(cosine) if options.normalize_scores => cosine_to_score(cosine),
                Some(cosine) => cosine,
                None => 0.0,
            };

            if score >= options.min_threshold {
                scored.push((index, score));
            }
        }

        // Stable: ties keep candidate order.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        if options.max_results > 0 {
            scored.truncate(options.max_results);
        }

        Ok(BatchSimilarity {
            similarities: scored.iter().map(|&(_, s)| s).collect(),
            ranked_indices: scored.into_iter().map(|(i, _)| i).collect(),
        })
    }

    /// Scale a vector to unit length.
    pub fn normalize_vector(vector: &[f32]) -> SimilarityResult<Vec<f32>> {
        validate_finite(vector, "input vector")?;
        let norm = magnitude(vector);
        if norm == 0.0 {
            return Err(SimilarityError::ZeroMagnitude);
        }
        Ok(vector.iter().map(|v| v / norm).collect())
    }

    /// Rescale scores so the lowest maps to 0 and the highest to 1.
    /// A constant input maps every score to 1.
    pub fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
        let Some(min) = scores.iter().copied().reduce(f32::min) else {
            return Vec::new();
        };
        let max = scores.iter().copied().fold(min, f32::max);
        let range = max - min;
        if range <= f32::EPSILON {
            return vec![1.0; scores.len()];
        }
        scores.iter().map(|s| (s - min) / range).collect()
    }
}
