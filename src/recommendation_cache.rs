use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::types::{RecommendationOptions, RecommendationSet};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationCacheConfig {
    /// Subjects kept before LRU eviction
    pub max_entries: usize,
    /// TTL used by `set`
    pub default_ttl_secs: u64,
}

impl Default for RecommendationCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 5_000,
            default_ttl_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecommendationCacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub invalidations: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

struct CachedSet {
    set: RecommendationSet,
    /// Options the set was ranked under
    options: RecommendationOptions,
    expires_at: Instant,
}

/// Hits and misses for a list of subjects
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheLookup {
    pub hits: HashMap<String, RecommendationSet>,
    /// Subjects without a live entry, in request order
    pub misses: Vec<String>,
}

impl CacheLookup {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits.len() + self.misses.len();
        if total == 0 {
            0.0
        } else {
            self.hits.len() as f64 / total as f64
        }
    }
}

struct Inner {
    entries: LruCache<String, CachedSet>,
    metrics: RecommendationCacheMetrics,
}

impl Inner {
    /// A live entry only counts as a hit when it was ranked under the same
    /// query; a mismatched entry stays until it is overwritten.
    fn lookup(
        &mut self,
        subject_id: &str,
        options: &RecommendationOptions,
        now: Instant,
    ) -> Option<RecommendationSet> {
        let expired = self
            .entries
            .peek(subject_id)
            .map(|cached| now >= cached.expires_at);

        let found = match expired {
            Some(true) => {
                self.entries.pop(subject_id);
                None
            }
            Some(false) => self
                .entries
                .get(subject_id)
                .filter(|cached| cached.options.same_query(options))
                .map(|cached| {
                    let mut set = cached.set.clone();
                    set.from_cache = true;
                    set
                }),
            None => None,
        };

        if found.is_some() {
            self.metrics.hits += 1;
        } else {
            self.metrics.misses += 1;
        }
        let total = self.metrics.hits + self.metrics.misses;
        self.metrics.hit_rate = self.metrics.hits as f64 / total as f64;
        found
    }
}

/// Final recommendation sets keyed by student id.
///
/// Each entry remembers the options it was ranked under and is only served
/// to requests with the same limit, threshold and filters. Readers always see
/// `from_cache == true`; stored sets always carry `false`.
#[derive(Clone)]
pub struct RecommendationCache {
    inner: Arc<Mutex<Inner>>,
    config: RecommendationCacheConfig,
}

impl Default for RecommendationCache {
    fn default() -> Self {
        Self::new(RecommendationCacheConfig::default())
    }
}

impl RecommendationCache {
    pub fn new(config: RecommendationCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: LruCache::new(capacity),
                metrics: RecommendationCacheMetrics::default(),
            })),
            config,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.config.default_ttl_secs)
    }

    pub async fn get(&self, subject_id: &str, options: &RecommendationOptions) -> Option<RecommendationSet> {
        self.inner.lock().await.lookup(subject_id, options, Instant::now())
    }

    pub async fn set(&self, subject_id: &str, options: &RecommendationOptions, set: RecommendationSet) {
        self.set_with_ttl(subject_id, options, set, self.default_ttl()).await;
    }

    /// Replace the entry for `subject_id` wholesale.
    pub async fn set_with_ttl(
        &self,
        subject_id: &str,
        options: &RecommendationOptions,
        mut set: RecommendationSet,
        ttl: Duration,
    ) {
        set.from_cache = false;
        let mut inner = self.inner.lock().await;

        let will_evict = inner.entries.len() >= inner.entries.cap().get()
            && !inner.entries.contains(subject_id);
        inner.entries.put(
            subject_id.to_string(),
            CachedSet {
                set,
                options: RecommendationOptions {
                    force_refresh: false,
                    ..options.clone()
                },
                expires_at: Instant::now() + ttl,
            },
        );

        inner.metrics.writes += 1;
        if will_evict {
            inner.metrics.evictions += 1;
        }
    }

    /// Drop one subject's entry; returns whether one existed.
    pub async fn invalidate(&self, subject_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let removed = inner.entries.pop(subject_id).is_some();
        if removed {
            inner.metrics.invalidations += 1;
            log::debug!("Invalidated cached recommendations for {}", subject_id);
        }
        removed
    }

    /// Drop every entry, e.g. after the project catalogue changed.
    pub async fn invalidate_all(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let count = inner.entries.len();
        inner.entries.clear();
        inner.metrics.invalidations += count as u64;
        log::info!("Invalidated {} cached recommendation sets", count);
        count
    }

    /// Split `subject_ids` into cached sets and remaining misses under one lock.
    pub async fn get_many(&self, subject_ids: &[String], options: &RecommendationOptions) -> CacheLookup {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let mut lookup = CacheLookup::default();

        for subject_id in subject_ids {
            if lookup.hits.contains_key(subject_id) || lookup.misses.contains(subject_id) {
                continue;
            }
            match inner.lookup(subject_id, options, now) {
                Some(set) => {
                    lookup.hits.insert(subject_id.clone(), set);
                }
                None => lookup.misses.push(subject_id.clone()),
            }
        }
        lookup
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    pub async fn metrics(&self) -> RecommendationCacheMetrics {
        self.inner.lock().await.metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        DifficultyLevel, ProjectRecommendation, RecommendationMetadata, RecommendationMethod,
    };
    use chrono::Utc;

    fn opts() -> RecommendationOptions {
        RecommendationOptions::default()
    }

    fn sample_set(student_id: &str) -> RecommendationSet {
        let recommendations = vec![ProjectRecommendation {
            project_id: "p1".to_string(),
            title: "Distributed Cache".to_string(),
            abstract_text: "Build a cache".to_string(),
            specialization: "Systems".to_string(),
            difficulty_level: DifficultyLevel::Advanced,
            similarity_score: 0.82,
            match_reasons: vec!["Shared skills: rust".to_string()],
            supervisor: None,
        }];
        let now = Utc::now();
        RecommendationSet {
            student_id: student_id.to_string(),
            average_score: RecommendationSet::average_of(&recommendations),
            recommendations,
            generated_at: now,
            expires_at: now + chrono::Duration::hours(1),
            metadata: RecommendationMetadata {
                method: RecommendationMethod::Ai,
                model: "all-MiniLM-L6-v2".to_string(),
                embedding_cache_hit_rate: 0.5,
                candidates_considered: 12,
                processing_time_ms: 40,
            },
            from_cache: false,
        }
    }

    #[tokio::test]
    async fn test_round_trip_only_flips_from_cache() {
        let cache = RecommendationCache::default();
        let original = sample_set("s1");
        cache.set("s1", &opts(), original.clone()).await;

        let read = cache.get("s1", &opts()).await.unwrap();
        assert!(read.from_cache);
        assert_eq!(RecommendationSet { from_cache: false, ..read }, original);
    }

    #[tokio::test]
    async fn test_stored_from_cache_flag_is_not_trusted() {
        let cache = RecommendationCache::default();
        let mut stale = sample_set("s1");
        stale.from_cache = true;
        cache.set("s1", &opts(), stale).await;

        let inner = cache.inner.lock().await;
        assert!(!inner.entries.peek("s1").unwrap().set.from_cache);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = RecommendationCache::default();
        cache.set_with_ttl("s1", &opts(), sample_set("s1"), Duration::from_secs(10)).await;

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.get("s1", &opts()).await.is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("s1", &opts()).await.is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_get_many_partitions_subjects() {
        let cache = RecommendationCache::default();
        cache.set("s1", &opts(), sample_set("s1")).await;
        cache.set("s3", &opts(), sample_set("s3")).await;

        let subjects: Vec<String> = ["s1", "s2", "s3", "s4", "s2"].iter().map(|s| s.to_string()).collect();
        let lookup = cache.get_many(&subjects, &opts()).await;

        assert_eq!(lookup.hits.len(), 2);
        assert!(lookup.hits.values().all(|set| set.from_cache));
        assert_eq!(lookup.misses, vec!["s2".to_string(), "s4".to_string()]);
        assert!((lookup.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_invalidation() {
        let cache = RecommendationCache::default();
        cache.set("s1", &opts(), sample_set("s1")).await;
        cache.set("s2", &opts(), sample_set("s2")).await;

        assert!(cache.invalidate("s1").await);
        assert!(!cache.invalidate("s1").await);
        assert!(cache.get("s1", &opts()).await.is_none());

        assert_eq!(cache.invalidate_all().await, 1);
        assert_eq!(cache.len().await, 0);
        assert_eq!(cache.metrics().await.invalidations, 2);
    }

    #[tokio::test]
    async fn test_lru_bound() {
        let cache = RecommendationCache::new(RecommendationCacheConfig {
            max_entries: 2,
            ..Default::default()
        });
        cache.set("s1", &opts(), sample_set("s1")).await;
        cache.set("s2", &opts(), sample_set("s2")).await;
        cache.set("s3", &opts(), sample_set("s3")).await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.get("s1", &opts()).await.is_none());
        assert_eq!(cache.metrics().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_hit_requires_matching_query() {
        let cache = RecommendationCache::default();
        cache.set("s1", &opts(), sample_set("s1")).await;

        let narrower = RecommendationOptions {
            limit: 1,
            ..opts()
        };
        assert!(cache.get("s1", &narrower).await.is_none());
        assert!(cache.get("s1", &RecommendationOptions { force_refresh: true, ..opts() }).await.is_some());

        let lookup = cache.get_many(&["s1".to_string()], &narrower).await;
        assert_eq!(lookup.misses, vec!["s1".to_string()]);

        // The mismatched entry survives for its own query.
        assert!(cache.get("s1", &opts()).await.is_some());
        assert_eq!(cache.len().await, 1);
    }
}
