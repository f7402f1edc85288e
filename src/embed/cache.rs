use moka::sync::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::utils::sha256_hex;

/// Cache for embeddings keyed by `sha256(model_id, text)`
///
/// Uses Moka with a weigher so the limit is in bytes of vector data rather
/// than entry count. Keying on the model id keeps vectors of different models
/// apart after a model switch.
pub struct EmbeddingCache {
    cache: Cache<String, Arc<Vec<f32>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    max_memory_mb: usize,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::with_memory_limit_mb(crate::constants::DEFAULT_CACHE_MAX_MEMORY_MB)
    }

    /// Create a cache holding at most `max_memory_mb` of vector data
    pub fn with_memory_limit_mb(max_memory_mb: usize) -> Self {
        // max_capacity is the max total weight once a weigher is set
        let max_weight = (max_memory_mb * 1024 * 1024) as u64;

        let cache = Cache::builder()
            .max_capacity(max_weight)
            .weigher(|_key: &String, value: &Arc<Vec<f32>>| {
                (value.len() * std::mem::size_of::<f32>()) as u32
            })
            .build();

        Self {
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            max_memory_mb,
        }
    }

    pub fn key(model_id: &str, text: &str) -> String {
        sha256_hex(&[model_id, text])
    }

    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        match self.cache.get(key) {
            Some(embedding) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(embedding.as_ref().clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, key: String, embedding: Vec<f32>) {
        self.cache.insert(key, Arc::new(embedding));
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.run_pending_tasks();
        CacheStats {
            size: self.cache.entry_count() as usize,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            max_memory_mb: self.max_memory_mb,
            memory_bytes: self.cache.weighted_size(),
        }
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub max_memory_mb: usize,
    pub memory_bytes: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f32 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f32 / total as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_and_stats() {
        let cache = EmbeddingCache::new();
        let key = EmbeddingCache::key("minilm-l6", "what is a derivative");

        assert!(cache.get(&key).is_none());
        cache.put(key.clone(), vec![1.0, 2.0, 3.0]);
        assert_eq!(cache.get(&key).unwrap(), vec![1.0, 2.0, 3.0]);
        cache.get(&key);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert!((stats.hit_rate() - 0.666).abs() < 0.01);
        assert!(stats.memory_bytes > 0);
    }

    #[test]
    fn test_key_depends_on_model() {
        assert_ne!(
            EmbeddingCache::key("minilm-l6", "limits"),
            EmbeddingCache::key("bge-small", "limits")
        );
    }

    #[test]
    fn test_clear() {
        let cache = EmbeddingCache::new();
        cache.put(EmbeddingCache::key("m", "t"), vec![0.5; 8]);
        cache.clear();
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn test_memory_limit_evicts() {
        let cache = EmbeddingCache::with_memory_limit_mb(1);
        for i in 0..2_000 {
            cache.put(EmbeddingCache::key("m", &i.to_string()), vec![0.0; 384]);
        }
        let stats = cache.stats();
        assert!(stats.size < 2_000, "cache should have evicted entries");
    }
}
