//! Central constants for studysearch configuration
//!
//! Defaults for every tunable live here so the config layer, the CLI and the
//! tests agree on the same values.

use std::path::PathBuf;

/// Name of the database directory created next to the caller
pub const DB_DIR_NAME: &str = ".studysearch.db";

/// Name of the global config directory in user home
pub const CONFIG_DIR_NAME: &str = ".studysearch";

/// Default config file name (inside the database directory or global config dir)
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Sub-directory holding the tantivy index
pub const FTS_DIR_NAME: &str = "fts";

/// Sub-directory holding the LMDB environment for vectors
pub const VECTORS_DIR_NAME: &str = "vectors";

/// File recording the embedding model identity the vectors were built with
pub const MODEL_METADATA_FILE: &str = "metadata.json";

/// Lock file name to indicate an active writer instance
pub const WRITER_LOCK_FILE: &str = ".writer.lock";

/// Name of fastembed cache directory (inside the global config dir)
pub const FASTEMBED_CACHE_DIR: &str = "models";

/// Log directory name (inside the database directory)
pub const LOG_DIR_NAME: &str = "logs";

/// Log file name
pub const LOG_FILE_NAME: &str = "studysearch.log";

/// Default number of rotated log files to keep
pub const DEFAULT_LOG_MAX_FILES: usize = 5;

/// Default log retention in days
pub const DEFAULT_LOG_RETENTION_DAYS: u64 = 7;

/// Default weight of the vector side in fused scores
pub const DEFAULT_ALPHA: f32 = 0.5;

/// Minimum over-fetch factor applied to each store before fusion
pub const MIN_OVER_FETCH_FACTOR: usize = 3;

/// Default over-fetch factor
pub const DEFAULT_OVER_FETCH_FACTOR: usize = 3;

/// Default number of results returned by a query
pub const DEFAULT_TOP_K: usize = 10;

/// Upper bound on `top_k` accepted by the retriever
pub const DEFAULT_MAX_TOP_K: usize = 500;

/// Per-store call timeout
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2_000;

/// Query deadline; a side still running when it passes is degraded
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 5_000;

/// Per-call embedding timeout
pub const DEFAULT_EMBED_TIMEOUT_MS: u64 = 30_000;

/// Retries after the first attempt for transient failures
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// First backoff delay; doubled on every retry
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;

/// Backoff ceiling
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 2_000;

/// Documents processed concurrently by one ingest call
pub fn default_ingest_concurrency() -> usize {
    num_cpus::get().clamp(2, 16)
}

/// Texts per embedding model call
pub const DEFAULT_EMBED_BATCH_SIZE: usize = 32;

/// Default embedding cache memory limit in MB
pub const DEFAULT_CACHE_MAX_MEMORY_MB: usize = 128;

/// Dimensions of the hashed embedder when no model is configured
pub const DEFAULT_HASHED_DIMENSIONS: usize = 384;

/// Vector collections (or filtered candidate sets) at or below this size are
/// scanned exactly instead of going through the ANN forest
pub const DEFAULT_EXACT_SEARCH_THRESHOLD: usize = 1024;

/// Multiplier applied to `limit * n_trees` for arroy's `search_k`
pub const ANN_SEARCH_K_MULTIPLIER: usize = 15;

/// Seconds a complete query response stays cached (0 disables the cache)
pub const DEFAULT_QUERY_CACHE_TTL_SECS: u64 = 30;

/// Maximum cached query responses
pub const QUERY_CACHE_MAX_ENTRIES: u64 = 1_024;

/// Default LMDB map size in MB
pub const DEFAULT_LMDB_MAP_SIZE_MB: usize = 1024;

/// Tantivy writer heap
pub const FTS_WRITER_HEAP_BYTES: usize = 50_000_000;

/// Metadata field used by the type filter
pub const TYPE_FIELD: &str = "type";

/// Global models cache directory (`~/.studysearch/models`)
pub fn get_global_models_cache_dir() -> crate::error::Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        crate::error::StudySearchError::config("Could not determine home directory")
    })?;
    Ok(home.join(CONFIG_DIR_NAME).join(FASTEMBED_CACHE_DIR))
}
