//! Per-batch recommendation processing.
//!
//! A batch shares one candidate fetch and one candidate embedding pass across
//! all of its subjects. Every subject ends with either a recommendation set
//! or its own typed error; one subject failing never fails its neighbours.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::embedding_service::EmbeddingService;
use crate::errors::{PipelineError, PipelineResult};
use crate::progress_tracker::{ProgressStage, ProgressTracker};
use crate::recommendation_cache::RecommendationCache;
use crate::similarity_search::{BatchSimilarityOptions, SimilarityEngine};
use crate::storage::{CandidateFilter, RecommendationStore};
use crate::text_processing::{profile_text, project_text, shared_terms};
use crate::types::{
    ProjectCandidate, ProjectRecommendation, RecommendationMetadata, RecommendationMethod,
    RecommendationOptions, RecommendationSet, StudentProfile, SupervisorSummary,
};

/// Outcome for one subject of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectResult {
    pub subject_id: String,
    pub result: PipelineResult<RecommendationSet>,
}

impl SubjectResult {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Everything `recommend_batch` produced, in input order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecommendations {
    pub results: Vec<SubjectResult>,
    /// Subjects answered straight from the result cache
    pub result_cache_hits: usize,
    /// Share of embeddings served by the embedding cache
    pub embedding_cache_hit_rate: f64,
}

/// Per-subject outcomes of one request, recorded as each subject finishes.
///
/// Shared with whoever supervises the request, so work that finished before
/// a deadline or a panic is still reported.
#[derive(Clone, Default)]
pub struct BatchOutcomes {
    inner: Arc<Mutex<OutcomeState>>,
}

#[derive(Default)]
struct OutcomeState {
    outcomes: HashMap<String, PipelineResult<RecommendationSet>>,
    result_cache_hits: usize,
}

impl BatchOutcomes {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, subject_id: &str, outcome: PipelineResult<RecommendationSet>) {
        self.inner.lock().outcomes.insert(subject_id.to_string(), outcome);
    }

    fn record_cache_hit(&self, subject_id: &str, set: RecommendationSet) {
        let mut state = self.inner.lock();
        state.outcomes.insert(subject_id.to_string(), Ok(set));
        state.result_cache_hits += 1;
    }

    pub fn is_finished(&self, subject_id: &str) -> bool {
        self.inner.lock().outcomes.contains_key(subject_id)
    }

    pub fn result_cache_hits(&self) -> usize {
        self.inner.lock().result_cache_hits
    }

    /// One result per entry of `subject_ids`; subjects without an outcome
    /// get `unfinished`.
    pub fn results_for(&self, subject_ids: &[String], unfinished: &PipelineError) -> Vec<SubjectResult> {
        let state = self.inner.lock();
        subject_ids
            .iter()
            .map(|subject_id| SubjectResult {
                subject_id: subject_id.clone(),
                result: state
                    .outcomes
                    .get(subject_id)
                    .cloned()
                    .unwrap_or_else(|| Err(unfinished.clone())),
            })
            .collect()
    }
}

/// Candidates with a usable vector, index-aligned
struct EmbeddedCandidates {
    projects: Vec<ProjectCandidate>,
    vectors: Vec<Vec<f32>>,
}

#[derive(Clone)]
pub struct Recommender {
    store: Arc<dyn RecommendationStore>,
    embeddings: EmbeddingService,
    result_cache: RecommendationCache,
    progress: ProgressTracker,
}

impl Recommender {
    pub fn new(
        store: Arc<dyn RecommendationStore>,
        embeddings: EmbeddingService,
        result_cache: RecommendationCache,
        progress: ProgressTracker,
    ) -> Self {
        Self {
            store,
            embeddings,
            result_cache,
            progress,
        }
    }

    pub fn embeddings(&self) -> &EmbeddingService {
        &self.embeddings
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Recommendations for a single student, outside the batch queue.
    pub async fn recommend(
        &self,
        subject_id: &str,
        options: &RecommendationOptions,
    ) -> PipelineResult<RecommendationSet> {
        let request_id = Uuid::new_v4();
        let batch = self
            .recommend_batch(request_id, &[subject_id.to_string()], options)
            .await?;
        batch
            .results
            .into_iter()
            .next()
            .map(|r| r.result)
            .unwrap_or_else(|| Err(PipelineError::internal("batch returned no result")))
    }

    /// Process a batch. Fails as a whole only on invalid options.
    pub async fn recommend_batch(
        &self,
        request_id: Uuid,
        subject_ids: &[String],
        options: &RecommendationOptions,
    ) -> PipelineResult<BatchRecommendations> {
        self.recommend_batch_into(request_id, subject_ids, options, &BatchOutcomes::new())
            .await
    }

    /// Like [`recommend_batch`](Self::recommend_batch), recording each
    /// subject's outcome in `outcomes` as soon as it is known.
    pub async fn recommend_batch_into(
        &self,
        request_id: Uuid,
        subject_ids: &[String],
        options: &RecommendationOptions,
        outcomes: &BatchOutcomes,
    ) -> PipelineResult<BatchRecommendations> {
        options.validate()?;
        let started = Instant::now();

        for subject_id in subject_ids {
            if self.progress.get_progress(request_id, subject_id).is_none() {
                self.progress.start_request(request_id, subject_id);
            } else if let Err(e) = self.progress.begin_processing(request_id, subject_id) {
                log::debug!("Progress clock not restarted for {}: {}", subject_id, e);
            }
        }

        // (a) result cache
        let misses: Vec<String> = if options.force_refresh {
            dedup(subject_ids)
        } else {
            let lookup = self.result_cache.get_many(subject_ids, options).await;
            for (subject_id, set) in lookup.hits {
                self.finish(request_id, &subject_id, &Ok(set.clone()));
                outcomes.record_cache_hit(&subject_id, set);
            }
            lookup.misses
        };

        let mut embedding_hits = 0;
        let mut embedding_total = 0;

        if !misses.is_empty() {
            // (b) profiles
            for subject_id in &misses {
                self.advance(request_id, subject_id, ProgressStage::ValidatingProfile);
            }
            let loaded = join_all(misses.iter().map(|subject_id| self.load_profile(subject_id))).await;

            let mut profiles: Vec<StudentProfile> = Vec::with_capacity(loaded.len());
            for (subject_id, profile) in misses.iter().zip(loaded) {
                match profile {
                    Ok(profile) => profiles.push(profile),
                    Err(error) => self.settle(request_id, subject_id, Err(error), outcomes),
                }
            }

            if !profiles.is_empty() {
                let (batch_hits, batch_total) = self
                    .score_profiles(request_id, &profiles, options, started, outcomes)
                    .await;
                embedding_hits += batch_hits;
                embedding_total += batch_total;
            }
        }

        let results = outcomes.results_for(subject_ids, &PipelineError::internal("subject was not processed"));
        let result_cache_hits = outcomes.result_cache_hits();

        // One sample per request, as a per-subject cost.
        if !subject_ids.is_empty() {
            let per_subject = started.elapsed().as_millis() as u64 / subject_ids.len() as u64;
            self.progress.record_duration(per_subject);
        }

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        log::info!(
            "Batch {} finished: {}/{} subjects succeeded ({} from cache) in {:?}",
            request_id,
            succeeded,
            results.len(),
            result_cache_hits,
            started.elapsed()
        );

        Ok(BatchRecommendations {
            results,
            result_cache_hits,
            embedding_cache_hit_rate: if embedding_total == 0 {
                0.0
            } else {
                embedding_hits as f64 / embedding_total as f64
            },
        })
    }

    /// Score validated profiles against the shared candidate set, writing each
    /// subject's outcome. Returns embedding cache (hits, lookups).
    async fn score_profiles(
        &self,
        request_id: Uuid,
        profiles: &[StudentProfile],
        options: &RecommendationOptions,
        started: Instant,
        outcomes: &BatchOutcomes,
    ) -> (usize, usize) {
        for profile in profiles {
            self.advance(request_id, &profile.student_id, ProgressStage::FetchingProjects);
        }
        let candidates = match self.fetch_candidates(options).await {
            Ok(candidates) => candidates,
            Err(error) => {
                self.fail_all(request_id, profiles, &error, outcomes);
                return (0, 0);
            }
        };

        for profile in profiles {
            self.advance(request_id, &profile.student_id, ProgressStage::GeneratingEmbeddings);
        }
        let (embedded, candidate_hits, candidate_total) = match self.embed_candidates(candidates).await {
            Ok(embedded) => embedded,
            Err(error) => {
                self.fail_all(request_id, profiles, &error, outcomes);
                return (0, 0);
            }
        };

        let texts: Vec<String> = profiles.iter().map(profile_text).collect();
        let subject_batch = self.embeddings.generate_embeddings(&texts).await;
        let hits = candidate_hits + subject_batch.cache_hits;
        let total = candidate_total + subject_batch.cache_hits + subject_batch.cache_misses;
        let hit_rate = if total == 0 { 0.0 } else { hits as f64 / total as f64 };

        let mut supervisors: HashMap<String, Option<SupervisorSummary>> = HashMap::new();

        for (profile, vector) in profiles.iter().zip(subject_batch.embeddings) {
            let outcome = match vector {
                Ok(vector) => {
                    self.rank_for_subject(
                        request_id,
                        profile,
                        &vector,
                        &embedded,
                        options,
                        hit_rate,
                        started,
                        &mut supervisors,
                    )
                    .await
                }
                Err(error) => Err(error),
            };

            if let Ok(set) = &outcome {
                self.advance(request_id, &profile.student_id, ProgressStage::CachingResults);
                self.result_cache.set(&profile.student_id, options, set.clone()).await;
            }
            self.settle(request_id, &profile.student_id, outcome, outcomes);
        }

        (hits, total)
    }

    #[allow(clippy::too_many_arguments)]
    async fn rank_for_subject(
        &self,
        request_id: Uuid,
        profile: &StudentProfile,
        vector: &[f32],
        embedded: &EmbeddedCandidates,
        options: &RecommendationOptions,
        embedding_cache_hit_rate: f64,
        started: Instant,
        supervisors: &mut HashMap<String, Option<SupervisorSummary>>,
    ) -> PipelineResult<RecommendationSet> {
        let subject_id = profile.student_id.as_str();

        self.advance(request_id, subject_id, ProgressStage::CalculatingSimilarity);
        let similarity = SimilarityEngine::calculate_batch_similarity(
            vector,
            &embedded.vectors,
            &BatchSimilarityOptions {
                normalize_scores: true,
                min_threshold: options.min_similarity,
                max_results: 0,
            },
        )?;

        self.advance(request_id, subject_id, ProgressStage::ApplyingFilters);
        let admitted: Vec<(usize, f32)> = similarity
            .iter()
            .filter(|&(index, _)| options.filters.admits(&embedded.projects[index]))
            .collect();

        self.advance(request_id, subject_id, ProgressStage::RankingResults);
        let ranked = &admitted[..admitted.len().min(options.limit)];

        self.advance(request_id, subject_id, ProgressStage::GeneratingExplanations);
        self.resolve_supervisors(ranked.iter().map(|&(index, _)| &embedded.projects[index]), supervisors)
            .await;

        let recommendations: Vec<ProjectRecommendation> = ranked
            .iter()
            .map(|&(index, score)| {
                let project = &embedded.projects[index];
                ProjectRecommendation {
                    project_id: project.project_id.clone(),
                    title: project.title.clone(),
                    abstract_text: project.abstract_text.clone(),
                    specialization: project.specialization.clone(),
                    difficulty_level: project.difficulty_level,
                    similarity_score: score,
                    match_reasons: match_reasons(profile, project, score),
                    supervisor: project
                        .supervisor_id
                        .as_ref()
                        .and_then(|id| supervisors.get(id).cloned().flatten()),
                }
            })
            .collect();

        let generated_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.result_cache.default_ttl())
            .unwrap_or_else(|_| chrono::Duration::hours(1));

        Ok(RecommendationSet {
            student_id: subject_id.to_string(),
            average_score: RecommendationSet::average_of(&recommendations),
            recommendations,
            generated_at,
            expires_at: generated_at + ttl,
            metadata: RecommendationMetadata {
                method: RecommendationMethod::Ai,
                model: self.embeddings.model_id().to_string(),
                embedding_cache_hit_rate,
                candidates_considered: embedded.projects.len(),
                processing_time_ms: started.elapsed().as_millis() as u64,
            },
            from_cache: false,
        })
    }

    async fn load_profile(&self, subject_id: &str) -> PipelineResult<StudentProfile> {
        let profile = self
            .store
            .fetch_student_profile(subject_id)
            .await
            .map_err(PipelineError::storage)?
            .ok_or_else(|| PipelineError::SubjectNotFound {
                subject_id: subject_id.to_string(),
            })?;

        if !profile.is_complete() {
            return Err(PipelineError::IncompleteProfile {
                subject_id: subject_id.to_string(),
                missing: profile.missing_fields(),
            });
        }
        Ok(profile)
    }

    async fn fetch_candidates(&self, options: &RecommendationOptions) -> PipelineResult<Vec<ProjectCandidate>> {
        let filter = CandidateFilter {
            specializations: options.filters.specializations.clone(),
        };
        let candidates = self
            .store
            .fetch_candidate_projects(&filter)
            .await
            .map_err(PipelineError::storage)?;

        if candidates.is_empty() {
            return Err(PipelineError::NoCandidates);
        }
        Ok(candidates)
    }

    /// Embed every candidate once. Candidates whose embedding failed are
    /// dropped; if none survive, the first failure is returned.
    async fn embed_candidates(
        &self,
        candidates: Vec<ProjectCandidate>,
    ) -> PipelineResult<(EmbeddedCandidates, usize, usize)> {
        let texts: Vec<String> = candidates.iter().map(project_text).collect();
        let batch = self.embeddings.generate_embeddings(&texts).await;
        let hits = batch.cache_hits;
        let total = batch.cache_hits + batch.cache_misses;

        let mut embedded = EmbeddedCandidates {
            projects: Vec::with_capacity(candidates.len()),
            vectors: Vec::with_capacity(candidates.len()),
        };
        let mut first_error = None;

        for (project, vector) in candidates.into_iter().zip(batch.embeddings) {
            match vector {
                Ok(vector) => {
                    embedded.projects.push(project);
                    embedded.vectors.push(vector);
                }
                Err(error) => {
                    log::warn!("Skipping project {}: {}", project.project_id, error);
                    first_error.get_or_insert(error);
                }
            }
        }

        if embedded.projects.is_empty() {
            return Err(first_error.unwrap_or(PipelineError::NoCandidates));
        }
        Ok((embedded, hits, total))
    }

    /// Look up every supervisor of `projects` not yet in `seen`, concurrently.
    /// Failed lookups are cached as absent for the rest of the batch.
    async fn resolve_supervisors<'a>(
        &self,
        projects: impl Iterator<Item = &'a ProjectCandidate>,
        seen: &mut HashMap<String, Option<SupervisorSummary>>,
    ) {
        let mut pending: Vec<&str> = Vec::new();
        for id in projects.filter_map(|p| p.supervisor_id.as_deref()) {
            if !seen.contains_key(id) && !pending.contains(&id) {
                pending.push(id);
            }
        }
        if pending.is_empty() {
            return;
        }

        let lookups = join_all(pending.iter().map(|id| self.store.fetch_supervisor(id))).await;
        for (id, lookup) in pending.into_iter().zip(lookups) {
            let summary = match lookup {
                Ok(info) => info.as_ref().map(SupervisorSummary::from),
                Err(e) => {
                    log::warn!("Supervisor {} lookup failed: {:#}", id, e);
                    None
                }
            };
            seen.insert(id.to_string(), summary);
        }
    }

    fn fail_all(
        &self,
        request_id: Uuid,
        profiles: &[StudentProfile],
        error: &PipelineError,
        outcomes: &BatchOutcomes,
    ) {
        for profile in profiles {
            self.settle(request_id, &profile.student_id, Err(error.clone()), outcomes);
        }
    }

    /// Close the subject's progress record and publish its outcome.
    fn settle(
        &self,
        request_id: Uuid,
        subject_id: &str,
        outcome: PipelineResult<RecommendationSet>,
        outcomes: &BatchOutcomes,
    ) {
        self.finish(request_id, subject_id, &outcome);
        outcomes.record(subject_id, outcome);
    }

    fn advance(&self, request_id: Uuid, subject_id: &str, stage: ProgressStage) {
        if let Err(e) = self.progress.update_progress(request_id, subject_id, stage, None, None) {
            log::debug!("Progress update skipped for {}: {}", subject_id, e);
        }
    }

    fn finish(&self, request_id: Uuid, subject_id: &str, outcome: &PipelineResult<RecommendationSet>) {
        let result = match outcome {
            Ok(_) => self.progress.complete_request(request_id, subject_id),
            Err(error) => self.progress.fail_request(request_id, subject_id, &error.to_string()),
        };
        if let Err(e) = result {
            log::debug!("Progress finish skipped for {}: {}", subject_id, e);
        }
    }
}

fn dedup(ids: &[String]) -> Vec<String> {
    let mut seen = Vec::with_capacity(ids.len());
    for id in ids {
        if !seen.contains(id) {
            seen.push(id.clone());
        }
    }
    seen
}

/// Human-readable reasons a project was recommended.
pub fn match_reasons(profile: &StudentProfile, project: &ProjectCandidate, score: f32) -> Vec<String> {
    let mut reasons = Vec::new();

    let skills = shared_terms(&profile.skills, project);
    if !skills.is_empty() {
        reasons.push(format!("Matches your skills: {}", skills.join(", ")));
    }
    let interests = shared_terms(&profile.interests, project);
    if !interests.is_empty() {
        reasons.push(format!("Aligns with your interests: {}", interests.join(", ")));
    }
    if profile
        .preferred_specializations
        .iter()
        .any(|s| s.eq_ignore_ascii_case(&project.specialization))
    {
        reasons.push(format!("In your preferred specialization: {}", project.specialization));
    }
    if reasons.is_empty() {
        reasons.push(format!(
            "Strong overall profile similarity ({:.0}%)",
            score * 100.0
        ));
    }
    reasons
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreaker;
    use crate::embedding_cache::EmbeddingCache;
    use crate::embedding_provider::EmbeddingProvider;
    use crate::embedding_service::EmbeddingConfig;
    use crate::rate_limiter::{RateLimitConfig, RateLimiter, RateLimiterConfig, EMBEDDINGS_ENDPOINT};
    use crate::storage::InMemoryStore;
    use crate::types::{ApprovalStatus, DifficultyLevel, RecommendationFilters, SupervisorInfo};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Maps texts to vectors by keyword so rankings are predictable.
    struct KeywordProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for KeywordProvider {
        fn model_id(&self) -> &str {
            "keyword"
        }

        fn dimensions(&self) -> usize {
            3
        }

        async fn embed(&self, texts: &[String], _model: &str) -> Result<Vec<Vec<f32>>, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    vec![
                        if t.contains("rust") { 1.0 } else { 0.0 },
                        if t.contains("learning") { 1.0 } else { 0.0 },
                        0.1,
                    ]
                })
                .collect())
        }
    }

    fn profile(id: &str, skills: &[&str]) -> StudentProfile {
        StudentProfile {
            student_id: id.to_string(),
            name: id.to_uppercase(),
            skills: skills.iter().map(|s| s.to_string()).collect(),
            interests: vec![],
            preferred_specializations: vec!["Systems".to_string()],
            updated_at: Utc::now(),
        }
    }

    fn project(id: &str, title: &str, specialization: &str, difficulty: DifficultyLevel) -> ProjectCandidate {
        ProjectCandidate {
            project_id: id.to_string(),
            title: title.to_string(),
            abstract_text: String::new(),
            specialization: specialization.to_string(),
            difficulty_level: difficulty,
            tags: vec![],
            technology_stack: vec!["Rust".to_string()],
            supervisor_id: Some("sup1".to_string()),
            status: ApprovalStatus::Approved,
            updated_at: Utc::now(),
        }
    }

    fn fixture() -> (Recommender, Arc<InMemoryStore>, Arc<KeywordProvider>) {
        let store = Arc::new(InMemoryStore::new());
        store.upsert_profile(profile("s1", &["rust"]));
        store.upsert_profile(profile("s2", &["machine learning"]));
        store.upsert_profile(StudentProfile {
            skills: vec![],
            interests: vec![],
            ..profile("empty", &[])
        });
        store.upsert_project(project("p-rust", "Rust compiler", "Systems", DifficultyLevel::Advanced));
        store.upsert_project(project("p-ml", "Deep learning lab", "AI", DifficultyLevel::Intermediate));
        store.upsert_supervisor(SupervisorInfo {
            supervisor_id: "sup1".to_string(),
            name: "Dr. Hopper".to_string(),
            specializations: vec![],
        });

        let provider = Arc::new(KeywordProvider {
            calls: AtomicUsize::new(0),
        });
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        limiter.register_endpoint(EMBEDDINGS_ENDPOINT, RateLimitConfig::new(1_000, 60_000));
        let embeddings = EmbeddingService::new(
            provider.clone(),
            EmbeddingCache::default(),
            limiter,
            CircuitBreaker::default(),
            EmbeddingConfig::default(),
        );
        let recommender = Recommender::new(
            store.clone(),
            embeddings,
            RecommendationCache::default(),
            ProgressTracker::default(),
        );
        (recommender, store, provider)
    }

    fn options() -> RecommendationOptions {
        RecommendationOptions {
            min_similarity: 0.6,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ranks_and_explains() {
        let (recommender, _, _) = fixture();
        let set = recommender.recommend("s1", &options()).await.unwrap();

        assert_eq!(set.recommendations[0].project_id, "p-rust");
        assert!(set.recommendations.iter().all(|r| r.similarity_score >= 0.6));
        let top = &set.recommendations[0];
        assert!(top.match_reasons.iter().any(|r| r.contains("rust")));
        assert!(top.match_reasons.iter().any(|r| r.contains("preferred specialization")));
        assert_eq!(top.supervisor.as_ref().unwrap().name, "Dr. Hopper");
        assert_eq!(set.metadata.method, RecommendationMethod::Ai);
        assert_eq!(set.metadata.candidates_considered, 2);
        assert!(!set.from_cache);
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let (recommender, _, _) = fixture();
        let subjects: Vec<String> = ["s1", "ghost", "empty", "s2"].iter().map(|s| s.to_string()).collect();
        let batch = recommender
            .recommend_batch(Uuid::new_v4(), &subjects, &options())
            .await
            .unwrap();

        assert_eq!(batch.results.len(), 4);
        assert!(batch.results[0].is_success());
        assert!(matches!(batch.results[1].result, Err(PipelineError::SubjectNotFound { .. })));
        assert!(matches!(batch.results[2].result, Err(PipelineError::IncompleteProfile { .. })));
        assert!(batch.results[3].is_success());
    }

    #[tokio::test]
    async fn test_candidates_embedded_once_per_batch() {
        let (recommender, store, provider) = fixture();
        let subjects: Vec<String> = vec!["s1".into(), "s2".into()];
        recommender
            .recommend_batch(Uuid::new_v4(), &subjects, &options())
            .await
            .unwrap();

        assert_eq!(store.candidate_fetches(), 1);
        // One call for the candidates, one for both subjects.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_request_is_served_from_result_cache() {
        let (recommender, store, provider) = fixture();
        let first = recommender.recommend("s1", &options()).await.unwrap();
        let second = recommender.recommend("s1", &options()).await.unwrap();

        assert!(second.from_cache);
        assert_eq!(second.recommendations, first.recommendations);
        assert_eq!(store.candidate_fetches(), 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        let refreshed = recommender
            .recommend("s1", &RecommendationOptions { force_refresh: true, ..options() })
            .await
            .unwrap();
        assert!(!refreshed.from_cache);
        assert_eq!(store.candidate_fetches(), 2);
    }

    #[tokio::test]
    async fn test_cached_set_is_not_served_to_a_different_query() {
        let (recommender, store, _) = fixture();
        let broad = RecommendationOptions {
            min_similarity: 0.0,
            ..Default::default()
        };
        let first = recommender.recommend("s1", &broad).await.unwrap();
        assert_eq!(first.recommendations.len(), 2);

        let narrow = RecommendationOptions {
            min_similarity: 0.0,
            limit: 1,
            filters: RecommendationFilters {
                specializations: vec!["AI".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        let second = recommender.recommend("s1", &narrow).await.unwrap();
        assert!(!second.from_cache);
        assert_eq!(second.recommendations.len(), 1);
        assert!(second.recommendations.iter().all(|r| r.specialization == "AI"));
        assert_eq!(store.candidate_fetches(), 2);

        let repeat = recommender.recommend("s1", &narrow).await.unwrap();
        assert!(repeat.from_cache);
        assert_eq!(repeat.recommendations, second.recommendations);
    }

    #[tokio::test]
    async fn test_outcomes_are_recorded_per_subject() {
        let (recommender, _, _) = fixture();
        let outcomes = BatchOutcomes::new();
        let subjects: Vec<String> = vec!["s1".into(), "ghost".into()];
        recommender
            .recommend_batch_into(Uuid::new_v4(), &subjects, &options(), &outcomes)
            .await
            .unwrap();

        assert!(outcomes.is_finished("s1"));
        assert!(outcomes.is_finished("ghost"));
        let unfinished = PipelineError::internal("unused");
        let results = outcomes.results_for(&["s1".to_string(), "other".to_string()], &unfinished);
        assert!(results[0].is_success());
        assert_eq!(results[1].result, Err(unfinished));
    }

    #[tokio::test]
    async fn test_filters_and_limit() {
        let (recommender, store, _) = fixture();
        store.upsert_project(project("p-rust-2", "Rust kernel", "Systems", DifficultyLevel::Beginner));

        let filtered = RecommendationOptions {
            min_similarity: 0.0,
            filters: RecommendationFilters {
                exclude_project_ids: vec!["p-rust".to_string()],
                difficulty_levels: vec![DifficultyLevel::Beginner, DifficultyLevel::Intermediate],
                ..Default::default()
            },
            limit: 1,
            ..Default::default()
        };
        let set = recommender.recommend("s1", &filtered).await.unwrap();
        assert_eq!(set.recommendations.len(), 1);
        assert_eq!(set.recommendations[0].project_id, "p-rust-2");
    }

    #[tokio::test]
    async fn test_specialization_filter_applies_at_fetch() {
        let (recommender, _, _) = fixture();
        let only_ai = RecommendationOptions {
            min_similarity: 0.0,
            filters: RecommendationFilters {
                specializations: vec!["AI".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        let set = recommender.recommend("s1", &only_ai).await.unwrap();
        assert_eq!(set.metadata.candidates_considered, 1);
        assert_eq!(set.recommendations[0].project_id, "p-ml");
    }

    #[tokio::test]
    async fn test_no_candidates() {
        let (recommender, _, _) = fixture();
        let nothing = RecommendationOptions {
            filters: RecommendationFilters {
                specializations: vec!["Quantum".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        let result = recommender.recommend("s1", &nothing).await;
        assert_eq!(result, Err(PipelineError::NoCandidates));
        assert!(result.unwrap_err().suggests_fallback());
    }

    #[tokio::test]
    async fn test_progress_reaches_terminal_stage() {
        let (recommender, _, _) = fixture();
        let request_id = Uuid::new_v4();
        let subjects: Vec<String> = vec!["s1".into(), "ghost".into()];
        recommender.recommend_batch(request_id, &subjects, &options()).await.unwrap();

        let records = recommender.progress.request_progress(request_id);
        let by_subject: HashMap<_, _> = records.iter().map(|r| (r.subject_id.as_str(), r.stage)).collect();
        assert_eq!(by_subject["s1"], ProgressStage::Completed);
        assert_eq!(by_subject["ghost"], ProgressStage::Error);
    }

    #[tokio::test]
    async fn test_invalid_options_fail_whole_call() {
        let (recommender, _, _) = fixture();
        let bad = RecommendationOptions { limit: 0, ..Default::default() };
        assert!(matches!(
            recommender.recommend_batch(Uuid::new_v4(), &["s1".to_string()], &bad).await,
            Err(PipelineError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_match_reasons_fallback_line() {
        let student = StudentProfile {
            preferred_specializations: vec![],
            ..profile("s", &["cobol"])
        };
        let reasons = match_reasons(
            &student,
            &project("p", "Web portal", "Web", DifficultyLevel::Beginner),
            0.71,
        );
        assert_eq!(reasons, vec!["Strong overall profile similarity (71%)".to_string()]);
    }
}
