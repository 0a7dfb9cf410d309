use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Configuration for the embedding cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingCacheConfig {
    /// Maximum number of vectors kept before LRU eviction
    pub max_entries: usize,
    /// Time-to-live for cache entries in seconds
    pub ttl_seconds: u64,
    /// How often the background task sweeps expired entries
    pub cleanup_interval_secs: u64,
}

impl Default for EmbeddingCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl_seconds: 24 * 60 * 60,
            cleanup_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    embedding: Vec<f32>,
    created_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= ttl
    }
}

/// Cache hit/miss statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingCacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub expirations: u64,
    /// Cache hit rate (0.0 to 1.0)
    pub hit_rate: f64,
}

impl EmbeddingCacheMetrics {
    fn update_hit_rate(&mut self) {
        let total = self.hits + self.misses;
        self.hit_rate = if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        };
    }
}

/// Cache key for an already-normalized text under a model.
///
/// Format is `{model}:{sha256 hex}`, so switching models never serves a
/// vector from another embedding space.
pub fn cache_key(normalized_text: &str, model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_text.as_bytes());
    format!("{}:{:x}", model, hasher.finalize())
}

/// Content-addressed LRU cache with TTL for embedding vectors
#[derive(Clone)]
pub struct EmbeddingCache {
    cache: Arc<RwLock<LruCache<String, CacheEntry>>>,
    metrics: Arc<RwLock<EmbeddingCacheMetrics>>,
    config: EmbeddingCacheConfig,
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new(EmbeddingCacheConfig::default())
    }
}

impl EmbeddingCache {
    pub fn new(config: EmbeddingCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Arc::new(RwLock::new(LruCache::new(capacity))),
            metrics: Arc::new(RwLock::new(EmbeddingCacheMetrics::default())),
            config,
        }
    }

    pub fn config(&self) -> &EmbeddingCacheConfig {
        &self.config
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_seconds)
    }

    /// Look up a vector by key. Expired entries are removed and reported as misses.
    pub async fn get(&self, key: &str) -> Option<Vec<f32>> {
        let now = Instant::now();
        let ttl = self.ttl();
        let mut cache = self.cache.write().await;
        let mut metrics = self.metrics.write().await;

        let result = match cache.peek(key).map(|entry| entry.is_expired(ttl, now)) {
            Some(true) => {
                cache.pop(key);
                metrics.expirations += 1;
                None
            }
            Some(false) => cache.get(key).map(|entry| entry.embedding.clone()),
            None => None,
        };

        if result.is_some() {
            metrics.hits += 1;
        } else {
            metrics.misses += 1;
        }
        metrics.update_hit_rate();
        result
    }

    /// Store a vector. Entries are immutable once written, so an existing live
    /// entry under the same key keeps its original creation time.
    pub async fn set(&self, key: &str, embedding: Vec<f32>) {
        let now = Instant::now();
        let ttl = self.ttl();
        let mut cache = self.cache.write().await;

        if let Some(existing) = cache.peek(key) {
            if !existing.is_expired(ttl, now) {
                return;
            }
        }

        let will_evict = cache.len() >= cache.cap().get() && !cache.contains(key);
        cache.put(
            key.to_string(),
            CacheEntry {
                embedding,
                created_at: now,
            },
        );

        let mut metrics = self.metrics.write().await;
        metrics.insertions += 1;
        if will_evict {
            metrics.evictions += 1;
        }
    }

    /// Whether a live entry exists. Does not touch LRU order or metrics.
    pub async fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        let cache = self.cache.read().await;
        cache
            .peek(key)
            .map(|entry| !entry.is_expired(self.ttl(), now))
            .unwrap_or(false)
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }

    pub async fn clear(&self) {
        let mut cache = self.cache.write().await;
        let cleared = cache.len();
        cache.clear();
        *self.metrics.write().await = EmbeddingCacheMetrics::default();
        log::info!("Embedding cache cleared ({} entries)", cleared);
    }

    pub async fn metrics(&self) -> EmbeddingCacheMetrics {
        self.metrics.read().await.clone()
    }

    /// Remove expired entries, returning how many were dropped.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl();
        let mut cache = self.cache.write().await;

        let expired: Vec<String> = cache
            .iter()
            .filter(|(_, entry)| entry.is_expired(ttl, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            cache.pop(key);
        }

        if !expired.is_empty() {
            self.metrics.write().await.expirations += expired.len() as u64;
            log::debug!("Embedding cache sweep removed {} expired entries", expired.len());
        }
        expired.len()
    }

    /// Periodically sweep expired entries until the handle is aborted.
    pub fn spawn_cleanup_task(&self) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        let period = Duration::from_secs(self.config.cleanup_interval_secs.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                cache.cleanup_expired().await;
            }
        })
    }
}
