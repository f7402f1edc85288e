//! Embedding generation
//!
//! [`Embedder`] is the synchronous model seam (fastembed ONNX or the hashed
//! fallback). [`EmbeddingService`] wraps one with caching, bounded retries,
//! a per-call timeout and batch isolation, and moves the blocking inference
//! off the async runtime.

mod cache;
mod fastembedder;
mod hashed;

pub use cache::{CacheStats, EmbeddingCache};
pub use fastembedder::FastEmbedder;
pub use hashed::HashedEmbedder;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingSettings;
use crate::constants::{DEFAULT_EMBED_BATCH_SIZE, DEFAULT_EMBED_TIMEOUT_MS};
use crate::error::{Result, StudySearchError};
use crate::utils::{retry_with_backoff, RetryPolicy};

/// Available embedding models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ModelType {
    /// sentence-transformers/all-MiniLM-L6-v2 (384 dims)
    #[default]
    #[value(name = "all-minilm-l6-v2")]
    #[serde(rename = "all-minilm-l6-v2")]
    AllMiniLmL6V2,
    /// BAAI/bge-small-en-v1.5 (384 dims)
    #[value(name = "bge-small-en-v1.5")]
    #[serde(rename = "bge-small-en-v1.5")]
    BgeSmallEnV15,
    /// Feature hashing, no model download
    Hashed,
}

impl ModelType {
    pub fn name(&self) -> &'static str {
        match self {
            ModelType::AllMiniLmL6V2 => "sentence-transformers/all-MiniLM-L6-v2",
            ModelType::BgeSmallEnV15 => "BAAI/bge-small-en-v1.5",
            ModelType::Hashed => "hashed",
        }
    }

    /// Identifier recorded in `metadata.json` and used in cache keys
    pub fn short_name(&self) -> &'static str {
        match self {
            ModelType::AllMiniLmL6V2 => "minilm-l6",
            ModelType::BgeSmallEnV15 => "bge-small",
            ModelType::Hashed => "hashed",
        }
    }

    pub fn dimensions(&self) -> usize {
        match self {
            ModelType::AllMiniLmL6V2 | ModelType::BgeSmallEnV15 => 384,
            ModelType::Hashed => crate::constants::DEFAULT_HASHED_DIMENSIONS,
        }
    }
}

impl std::str::FromStr for ModelType {
    type Err = StudySearchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "all-minilm-l6-v2" | "minilm-l6" | "minilm" => Ok(ModelType::AllMiniLmL6V2),
            "bge-small-en-v1.5" | "bge-small" => Ok(ModelType::BgeSmallEnV15),
            "hashed" => Ok(ModelType::Hashed),
            other => Err(StudySearchError::config(format!(
                "unknown embedding model '{}' (expected all-minilm-l6-v2, bge-small-en-v1.5 or hashed)",
                other
            ))),
        }
    }
}

/// A text embedding model
///
/// Implementations are blocking; [`EmbeddingService`] runs them on the
/// blocking thread pool.
pub trait Embedder: Send + Sync {
    /// Stable identity of the model version producing the vectors
    fn model_id(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// Embed `texts`, returning one vector per input in the same order
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])?
            .pop()
            .ok_or_else(|| StudySearchError::model_unavailable("model returned no vector"))
    }
}

/// Build the embedder selected in the settings
pub fn create_embedder(settings: &EmbeddingSettings) -> Result<Arc<dyn Embedder>> {
    match settings.model {
        ModelType::Hashed => Ok(Arc::new(HashedEmbedder::new(settings.hashed_dimensions)?)),
        model => {
            let cache_dir: Option<PathBuf> = match &settings.cache_dir {
                Some(dir) => Some(dir.clone()),
                None => crate::constants::get_global_models_cache_dir().ok(),
            };
            Ok(Arc::new(
                FastEmbedder::new(model, cache_dir)?.with_batch_size(settings.batch_size),
            ))
        }
    }
}

/// Cosine similarity of two vectors; 0 when either is all zeros or the
/// lengths differ
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

fn is_retryable(err: &StudySearchError) -> bool {
    matches!(err, StudySearchError::ModelUnavailable { .. })
}

/// High-level embedding service used by ingestion and retrieval
pub struct EmbeddingService {
    embedder: Arc<dyn Embedder>,
    cache: EmbeddingCache,
    retry: RetryPolicy,
    timeout: Duration,
    batch_size: usize,
}

impl EmbeddingService {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            cache: EmbeddingCache::new(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_millis(DEFAULT_EMBED_TIMEOUT_MS),
            batch_size: DEFAULT_EMBED_BATCH_SIZE,
        }
    }

    pub fn from_settings(embedder: Arc<dyn Embedder>, settings: &crate::config::Settings) -> Self {
        Self::new(embedder)
            .with_cache_memory_mb(settings.embedding.cache_max_memory_mb)
            .with_retry(settings.retry)
            .with_timeout(settings.embed_timeout())
            .with_batch_size(settings.embedding.batch_size)
    }

    pub fn with_cache_memory_mb(mut self, max_memory_mb: usize) -> Self {
        self.cache = EmbeddingCache::with_memory_limit_mb(max_memory_mb);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn model_id(&self) -> &str {
        self.embedder.model_id()
    }

    pub fn dimensions(&self) -> usize {
        self.embedder.dimensions()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Embed a single query text
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let key = EmbeddingCache::key(self.model_id(), text);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }
        let mut vectors = self.invoke(vec![text.to_string()]).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| StudySearchError::model_unavailable("model returned no vector"))?;
        self.cache.put(key, vector.clone());
        Ok(vector)
    }

    /// Embed many texts, one result per input in input order
    ///
    /// Cached texts skip the model. When a model call for a batch fails, each
    /// member is retried on its own so only the offending texts carry an error.
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Result<Vec<f32>>> {
        let mut results: Vec<Option<Result<Vec<f32>>>> = Vec::with_capacity(texts.len());
        let mut pending: Vec<usize> = Vec::new();

        for (idx, text) in texts.iter().enumerate() {
            match self.cache.get(&EmbeddingCache::key(self.model_id(), text)) {
                Some(hit) => results.push(Some(Ok(hit))),
                None => {
                    results.push(None);
                    pending.push(idx);
                }
            }
        }

        for group in pending.chunks(self.batch_size) {
            let batch: Vec<String> = group.iter().map(|&i| texts[i].clone()).collect();
            match self.invoke(batch).await {
                Ok(vectors) => {
                    for (&idx, vector) in group.iter().zip(vectors) {
                        self.cache
                            .put(EmbeddingCache::key(self.model_id(), &texts[idx]), vector.clone());
                        results[idx] = Some(Ok(vector));
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Embedding batch of {} failed, isolating members: {}",
                        group.len(),
                        e
                    );
                    for &idx in group {
                        results[idx] = Some(self.embed_query(&texts[idx]).await);
                    }
                }
            }
        }

        results
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(StudySearchError::model_unavailable("text was not embedded"))
                })
            })
            .collect()
    }

    /// One model call with retry, timeout and output shape checks
    async fn invoke(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let expected = texts.len();
        let dimensions = self.dimensions();
        let texts = Arc::new(texts);

        retry_with_backoff(&self.retry, "embedding", is_retryable, || {
            let embedder = Arc::clone(&self.embedder);
            let texts = Arc::clone(&texts);
            let timeout = self.timeout;
            async move {
                let task = tokio::task::spawn_blocking(move || embedder.embed_batch(&texts));
                let vectors = match tokio::time::timeout(timeout, task).await {
                    Ok(Ok(result)) => result?,
                    Ok(Err(join_err)) => {
                        return Err(StudySearchError::model_unavailable(format!(
                            "embedding task failed: {}",
                            join_err
                        )))
                    }
                    Err(_) => {
                        return Err(StudySearchError::model_unavailable(format!(
                            "embedding timed out after {} ms",
                            timeout.as_millis()
                        )))
                    }
                };
                if vectors.len() != expected || vectors.iter().any(|v| v.len() != dimensions) {
                    return Err(StudySearchError::model_unavailable(format!(
                        "model returned {} vectors for {} texts (expected {} dims)",
                        vectors.len(),
                        expected,
                        dimensions
                    )));
                }
                Ok(vectors)
            }
        })
        .await
    }
}
