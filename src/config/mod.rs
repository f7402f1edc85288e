//! Runtime settings
//!
//! Resolution order: built-in defaults (`constants.rs`), then an optional YAML
//! file, then `STUDYSEARCH_*` environment variables. The result is validated
//! once before any store is opened.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::embed::ModelType;
use crate::error::{Result, StudySearchError};
use crate::utils::RetryPolicy;

/// Embedding model settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub model: ModelType,
    pub batch_size: usize,
    pub cache_max_memory_mb: usize,
    /// Where ONNX models are downloaded (default `~/.studysearch/models`)
    pub cache_dir: Option<PathBuf>,
    /// Vector size when `model` is `hashed`
    pub hashed_dimensions: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            model: ModelType::default(),
            batch_size: DEFAULT_EMBED_BATCH_SIZE,
            cache_max_memory_mb: DEFAULT_CACHE_MAX_MEMORY_MB,
            cache_dir: None,
            hashed_dimensions: DEFAULT_HASHED_DIMENSIONS,
        }
    }
}

impl EmbeddingSettings {
    /// Vector size produced by the configured model
    pub fn dimensions(&self) -> usize {
        match self.model {
            ModelType::Hashed => self.hashed_dimensions,
            model => model.dimensions(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Weight of the vector side in fused scores
    pub alpha: f32,
    pub over_fetch_factor: usize,
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub store_timeout_ms: u64,
    pub query_timeout_ms: u64,
    pub embed_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub ingest_concurrency: usize,
    pub embedding: EmbeddingSettings,
    pub exact_search_threshold: usize,
    /// 0 disables the query cache
    pub query_cache_ttl_secs: u64,
    pub lmdb_map_size_mb: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            over_fetch_factor: DEFAULT_OVER_FETCH_FACTOR,
            default_top_k: DEFAULT_TOP_K,
            max_top_k: DEFAULT_MAX_TOP_K,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            embed_timeout_ms: DEFAULT_EMBED_TIMEOUT_MS,
            retry: RetryPolicy::default(),
            ingest_concurrency: default_ingest_concurrency(),
            embedding: EmbeddingSettings::default(),
            exact_search_threshold: DEFAULT_EXACT_SEARCH_THRESHOLD,
            query_cache_ttl_secs: DEFAULT_QUERY_CACHE_TTL_SECS,
            lmdb_map_size_mb: DEFAULT_LMDB_MAP_SIZE_MB,
        }
    }
}

impl Settings {
    /// Load settings: defaults, then `path` (if it exists), then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(p) if p.exists() => Self::from_yaml_file(p)?,
            Some(p) => {
                tracing::debug!("Config file {} not found, using defaults", p.display());
                Self::default()
            }
            None => Self::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StudySearchError::io(path, e.to_string()))?;
        Self::from_yaml_str(&raw).map_err(|e| {
            StudySearchError::config(format!("{}: {}", path.display(), e))
        })
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml_ng::from_str(raw)?)
    }

    /// Apply `STUDYSEARCH_*` overrides read through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim().parse::<T>().map_err(|e| {
                StudySearchError::config(format!("{}={:?}: {}", key, raw, e))
            })
        }

        macro_rules! override_with {
            ($key:literal, $target:expr) => {
                if let Some(raw) = lookup($key) {
                    $target = parse($key, raw)?;
                }
            };
        }

        override_with!("STUDYSEARCH_ALPHA", self.alpha);
        override_with!("STUDYSEARCH_OVER_FETCH_FACTOR", self.over_fetch_factor);
        override_with!("STUDYSEARCH_DEFAULT_TOP_K", self.default_top_k);
        override_with!("STUDYSEARCH_MAX_TOP_K", self.max_top_k);
        override_with!("STUDYSEARCH_STORE_TIMEOUT_MS", self.store_timeout_ms);
        override_with!("STUDYSEARCH_QUERY_TIMEOUT_MS", self.query_timeout_ms);
        override_with!("STUDYSEARCH_EMBED_TIMEOUT_MS", self.embed_timeout_ms);
        override_with!("STUDYSEARCH_MAX_RETRIES", self.retry.max_retries);
        override_with!("STUDYSEARCH_RETRY_BASE_DELAY_MS", self.retry.base_delay_ms);
        override_with!("STUDYSEARCH_RETRY_MAX_DELAY_MS", self.retry.max_delay_ms);
        override_with!("STUDYSEARCH_INGEST_CONCURRENCY", self.ingest_concurrency);
        override_with!("STUDYSEARCH_EMBEDDING_MODEL", self.embedding.model);
        override_with!("STUDYSEARCH_EMBED_BATCH_SIZE", self.embedding.batch_size);
        override_with!("STUDYSEARCH_CACHE_MAX_MEMORY", self.embedding.cache_max_memory_mb);
        override_with!("STUDYSEARCH_EXACT_SEARCH_THRESHOLD", self.exact_search_threshold);
        override_with!("STUDYSEARCH_QUERY_CACHE_TTL_SECS", self.query_cache_ttl_secs);
        override_with!("STUDYSEARCH_LMDB_MAP_SIZE_MB", self.lmdb_map_size_mb);

        if let Some(dir) = lookup("STUDYSEARCH_MODEL_CACHE_DIR") {
            self.embedding.cache_dir = Some(PathBuf::from(shellexpand::tilde(&dir).as_ref()));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.alpha.is_finite() || !(0.0..=1.0).contains(&self.alpha) {
            return Err(StudySearchError::config(format!(
                "alpha must be within [0, 1], got {}",
                self.alpha
            )));
        }
        if self.over_fetch_factor < MIN_OVER_FETCH_FACTOR {
            return Err(StudySearchError::config(format!(
                "over_fetch_factor must be at least {}, got {}",
                MIN_OVER_FETCH_FACTOR, self.over_fetch_factor
            )));
        }
        if self.max_top_k == 0 || self.default_top_k == 0 || self.default_top_k > self.max_top_k {
            return Err(StudySearchError::config(format!(
                "need 0 < default_top_k ({}) <= max_top_k ({})",
                self.default_top_k, self.max_top_k
            )));
        }
        for (name, value) in [
            ("store_timeout_ms", self.store_timeout_ms),
            ("query_timeout_ms", self.query_timeout_ms),
            ("embed_timeout_ms", self.embed_timeout_ms),
        ] {
            if value == 0 {
                return Err(StudySearchError::config(format!("{} must be positive", name)));
            }
        }
        if self.query_timeout_ms < self.store_timeout_ms {
            return Err(StudySearchError::config(format!(
                "query_timeout_ms ({}) must be at least store_timeout_ms ({})",
                self.query_timeout_ms, self.store_timeout_ms
            )));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(StudySearchError::config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms",
            ));
        }
        if self.ingest_concurrency == 0 || self.embedding.batch_size == 0 {
            return Err(StudySearchError::config(
                "ingest_concurrency and embedding.batch_size must be positive",
            ));
        }
        if self.embedding.dimensions() == 0 {
            return Err(StudySearchError::config("embedding dimensions must be positive"));
        }
        if self.lmdb_map_size_mb == 0 {
            return Err(StudySearchError::config("lmdb_map_size_mb must be positive"));
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }
}

/// Config file used when none is given: `<db>/config.yaml`, else
/// `~/.studysearch/config.yaml`
pub fn default_config_path(db_path: &Path) -> Option<PathBuf> {
    let local = db_path.join(CONFIG_FILE_NAME);
    if local.exists() {
        return Some(local);
    }
    dirs::home_dir()
        .map(|home| home.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
        .filter(|p| p.exists())
}
