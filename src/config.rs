use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch_scheduler::SchedulerConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::embedding_cache::EmbeddingCacheConfig;
use crate::embedding_provider::ProviderConfig;
use crate::embedding_service::EmbeddingConfig;
use crate::errors::PipelineError;
use crate::progress_tracker::ProgressConfig;
use crate::rate_limiter::RateLimiterConfig;
use crate::recommendation_cache::RecommendationCacheConfig;

pub const ENV_PROVIDER_URL: &str = "RECOMMENDER_PROVIDER_URL";
pub const ENV_MODEL: &str = "RECOMMENDER_MODEL";
pub const ENV_MAX_CONCURRENT: &str = "RECOMMENDER_MAX_CONCURRENT";
pub const ENV_MAX_QUEUE_SIZE: &str = "RECOMMENDER_MAX_QUEUE_SIZE";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine the user config directory")]
    NoConfigDir,

    #[error("Failed to read config file {path}: {message}")]
    Read { path: String, message: String },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Failed to write config file {path}: {message}")]
    Write { path: String, message: String },

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

impl From<ConfigError> for PipelineError {
    fn from(error: ConfigError) -> Self {
        PipelineError::InvalidInput {
            message: error.to_string(),
        }
    }
}

/// Every tunable of the pipeline in one serializable document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub provider: ProviderConfig,
    pub embeddings: EmbeddingConfig,
    pub embedding_cache: EmbeddingCacheConfig,
    pub recommendation_cache: RecommendationCacheConfig,
    pub rate_limiter: RateLimiterConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub progress: ProgressConfig,
    pub scheduler: SchedulerConfig,
}

impl PipelineConfig {
    /// `<config dir>/projecthub/recommender.json`
    pub fn default_path() -> ConfigResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join("projecthub").join("recommender.json"))
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            log::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    pub fn save_to_file(&self, path: &Path) -> ConfigResult<()> {
        let write_error = |e: std::io::Error| ConfigError::Write {
            path: path.display().to_string(),
            message: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_error)?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        fs::write(path, content).map_err(write_error)
    }

    /// Default file, then environment overrides, then validation.
    pub fn load() -> ConfigResult<Self> {
        let mut config = Self::load_from_file(&Self::default_path()?)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_PROVIDER_URL) {
            self.provider.base_url = url;
        }
        if let Some(model) = lookup(ENV_MODEL) {
            self.provider.model = model;
        }
        if let Some(value) = lookup(ENV_MAX_CONCURRENT) {
            self.scheduler.max_concurrent = parse_count(ENV_MAX_CONCURRENT, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_QUEUE_SIZE) {
            self.scheduler.max_queue_size = parse_count(ENV_MAX_QUEUE_SIZE, &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let url = self.provider.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(invalid("provider.base_url", "must be an http(s) URL"));
        }
        if self.provider.model.trim().is_empty() {
            return Err(invalid("provider.model", "must not be empty"));
        }
        if self.provider.dimensions == 0 {
            return Err(invalid("provider.dimensions", "must be positive"));
        }
        if self.provider.timeout_ms == 0 {
            return Err(invalid("provider.timeout_ms", "must be positive"));
        }
        if self.embeddings.max_batch_size == 0 {
            return Err(invalid("embeddings.max_batch_size", "must be positive"));
        }
        if self.embedding_cache.max_entries == 0 {
            return Err(invalid("embedding_cache.max_entries", "must be positive"));
        }
        if self.recommendation_cache.max_entries == 0 {
            return Err(invalid("recommendation_cache.max_entries", "must be positive"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold", "must be positive"));
        }
        if self.circuit_breaker.half_open_max_calls == 0 {
            return Err(invalid("circuit_breaker.half_open_max_calls", "must be positive"));
        }
        for (endpoint, limit) in &self.rate_limiter.endpoint_limits {
            if limit.max_requests == 0 || limit.window_ms == 0 {
                return Err(invalid(
                    &format!("rate_limiter.endpoint_limits.{}", endpoint),
                    "max_requests and window_ms must be positive",
                ));
            }
        }
        if self.scheduler.max_concurrent == 0 {
            return Err(invalid("scheduler.max_concurrent", "must be positive"));
        }
        if self.scheduler.max_queue_size == 0 {
            return Err(invalid("scheduler.max_queue_size", "must be positive"));
        }
        if self.scheduler.max_batch_size == 0 {
            return Err(invalid("scheduler.max_batch_size", "must be positive"));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(invalid("scheduler.tick_interval_ms", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn parse_count(field: &str, value: &str) -> ConfigResult<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(invalid(field, &format!("expected a positive integer, got '{}'", value))),
    }
}
