//! On-disk study index
//!
//! Layout of a database directory:
//!
//! ```text
//! <db>/fts/            tantivy lexical index
//! <db>/vectors/        LMDB environment (arroy forest + entries)
//! <db>/metadata.json   embedding model identity
//! <db>/.writer.lock    exclusive writer lock (fs2)
//! <db>/logs/           rolling log files
//! ```
//!
//! [`StudyIndex`] opens both stores, checks that the configured embedding
//! model matches the one the vectors were built with, and wires the
//! ingestion coordinator and hybrid retriever to the same store handles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::constants::{FTS_DIR_NAME, MODEL_METADATA_FILE, VECTORS_DIR_NAME, WRITER_LOCK_FILE};
use crate::document::{DocId, Document};
use crate::embed::{create_embedder, CacheStats, Embedder, EmbeddingService};
use crate::error::{Result, StudySearchError};
use crate::events::{EventSink, TracingEventSink};
use crate::ingest::{IngestionCoordinator, ReindexSummary};
use crate::lexical::{LexicalIndex, TantivyLexicalStore};
use crate::search::{HybridRetriever, RetrieverConfig};
use crate::vectordb::{ArroyVectorStore, VectorIndex, VectorStoreOptions};

/// Identity of the embedding model the stored vectors came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_id: String,
    pub dimensions: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModelMetadata {
    pub fn read(db_path: &Path) -> Result<Option<Self>> {
        let path = db_path.join(MODEL_METADATA_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|e| StudySearchError::io(&path, e.to_string()))?;
        let metadata = serde_json::from_str(&raw).map_err(|e| {
            StudySearchError::config(format!("unreadable {}: {}", path.display(), e))
        })?;
        Ok(Some(metadata))
    }

    pub fn write(&self, db_path: &Path) -> Result<()> {
        let path = db_path.join(MODEL_METADATA_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)
            .map_err(|e| StudySearchError::io(&path, e.to_string()))
    }
}

/// How to treat an embedding model that differs from the stored one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Refuse to open
    Strict,
    /// Open anyway so the vectors can be rebuilt with [`StudyIndex::reindex`]
    Reindex,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub db_path: PathBuf,
    pub model_id: String,
    pub dimensions: usize,
    pub lexical_documents: usize,
    pub vector_documents: usize,
    pub disk_bytes: u64,
    pub embedding_cache: CacheStats,
}

/// Acquire the exclusive writer lock for the database
///
/// The lock is held as long as the returned file stays open.
pub fn acquire_writer_lock(db_path: &Path) -> Result<File> {
    use fs2::FileExt;

    let lock_path = db_path.join(WRITER_LOCK_FILE);
    let file = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| StudySearchError::io(&lock_path, e.to_string()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            debug!("🔒 Writer lock acquired");
            Ok(file)
        }
        Err(e) => {
            debug!("🔒 Failed to acquire writer lock: {}", e);
            Err(StudySearchError::config(format!(
                "database at {} is in use by another process",
                db_path.display()
            )))
        }
    }
}

pub struct StudyIndex {
    db_path: PathBuf,
    lexical: Arc<TantivyLexicalStore>,
    vector: Arc<ArroyVectorStore>,
    embeddings: Arc<EmbeddingService>,
    coordinator: IngestionCoordinator,
    retriever: HybridRetriever,
    model_mismatch: bool,
    _writer_lock: File,
}

impl StudyIndex {
    /// Open (or create) the index with the embedder selected in `settings`
    pub fn open(db_path: &Path, settings: &Settings, mode: OpenMode) -> Result<Self> {
        let embedder = create_embedder(&settings.embedding)?;
        Self::open_with(db_path, settings, embedder, Arc::new(TracingEventSink), mode)
    }

    /// Open with an explicit embedder and event sink
    pub fn open_with(
        db_path: &Path,
        settings: &Settings,
        embedder: Arc<dyn Embedder>,
        events: Arc<dyn EventSink>,
        mode: OpenMode,
    ) -> Result<Self> {
        settings.validate()?;
        fs::create_dir_all(db_path).map_err(|e| StudySearchError::io(db_path, e.to_string()))?;
        let writer_lock = acquire_writer_lock(db_path)?;

        let model_id = embedder.model_id().to_string();
        let dimensions = embedder.dimensions();
        let stored = ModelMetadata::read(db_path)?;

        let model_mismatch = match &stored {
            Some(meta) if meta.model_id != model_id || meta.dimensions != dimensions => {
                if mode == OpenMode::Strict {
                    return Err(StudySearchError::config(format!(
                        "index was built with '{}' ({} dims) but '{}' ({} dims) is configured; run `studysearch reindex`",
                        meta.model_id, meta.dimensions, model_id, dimensions
                    )));
                }
                if meta.dimensions != dimensions {
                    let vectors_dir = db_path.join(VECTORS_DIR_NAME);
                    warn!(
                        "Dropping {}-dim vector store at {} before reindexing",
                        meta.dimensions,
                        vectors_dir.display()
                    );
                    if vectors_dir.exists() {
                        fs::remove_dir_all(&vectors_dir)
                            .map_err(|e| StudySearchError::io(&vectors_dir, e.to_string()))?;
                    }
                }
                true
            }
            _ => false,
        };

        let lexical = Arc::new(TantivyLexicalStore::open(&db_path.join(FTS_DIR_NAME))?);
        let vector = Arc::new(ArroyVectorStore::open(
            &db_path.join(VECTORS_DIR_NAME),
            dimensions,
            VectorStoreOptions {
                map_size_mb: settings.lmdb_map_size_mb,
                exact_search_threshold: settings.exact_search_threshold,
            },
        )?);

        if stored.is_none() {
            let now = Utc::now();
            ModelMetadata {
                model_id: model_id.clone(),
                dimensions,
                created_at: now,
                updated_at: now,
            }
            .write(db_path)?;
        }

        let embeddings = Arc::new(EmbeddingService::from_settings(embedder, settings));
        let coordinator = IngestionCoordinator::from_settings(
            lexical.clone(),
            vector.clone(),
            embeddings.clone(),
            settings,
        )
        .with_events(events.clone());
        let retriever = HybridRetriever::new(
            lexical.clone(),
            vector.clone(),
            embeddings.clone(),
            RetrieverConfig::from_settings(settings),
        )
        .with_generation(coordinator.generation())
        .with_events(events);

        info!(
            "📦 Opened study index at {} (model {}, {} dims)",
            db_path.display(),
            model_id,
            dimensions
        );

        Ok(Self {
            db_path: db_path.to_path_buf(),
            lexical,
            vector,
            embeddings,
            coordinator,
            retriever,
            model_mismatch,
            _writer_lock: writer_lock,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn coordinator(&self) -> &IngestionCoordinator {
        &self.coordinator
    }

    pub fn retriever(&self) -> &HybridRetriever {
        &self.retriever
    }

    /// The configured model differs from the one recorded in `metadata.json`
    pub fn needs_reindex(&self) -> bool {
        self.model_mismatch
    }

    /// Stored document (text, metadata, created_at) by id
    pub async fn get(&self, id: &DocId) -> Result<Option<Document>> {
        self.lexical.get(id).await
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        let (lexical_documents, vector_documents) =
            tokio::try_join!(self.lexical.count(), self.vector.count())?;
        Ok(IndexStats {
            db_path: self.db_path.clone(),
            model_id: self.embeddings.model_id().to_string(),
            dimensions: self.embeddings.dimensions(),
            lexical_documents,
            vector_documents,
            disk_bytes: dir_size(&self.db_path),
            embedding_cache: self.embeddings.cache_stats(),
        })
    }

    /// Re-embed every document with the configured model and record it as
    /// the index's model
    pub async fn reindex<F>(&self, progress: F) -> Result<ReindexSummary>
    where
        F: Fn(usize, usize),
    {
        let summary = self.coordinator.reindex_vectors(progress).await?;

        let now = Utc::now();
        let created_at = ModelMetadata::read(&self.db_path)?
            .map(|m| m.created_at)
            .unwrap_or(now);
        ModelMetadata {
            model_id: self.embeddings.model_id().to_string(),
            dimensions: self.embeddings.dimensions(),
            created_at,
            updated_at: now,
        }
        .write(&self.db_path)?;

        Ok(summary)
    }
}

/// Total size of all files below `path`
fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.metadata() {
            Ok(meta) if meta.is_dir() => dir_size(&entry.path()),
            Ok(meta) => meta.len(),
            Err(_) => 0,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::{HashedEmbedder, ModelType};
    use crate::ingest::IngestRequest;
    use crate::search::HybridQuery;
    use tempfile::tempdir;

    fn hashed_settings(dims: usize) -> Settings {
        let mut settings = Settings::default();
        settings.embedding.model = ModelType::Hashed;
        settings.embedding.hashed_dimensions = dims;
        settings
    }

    #[tokio::test]
    async fn test_open_ingest_query_reopen() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("db");
        let settings = hashed_settings(64);

        {
            let index = StudyIndex::open(&db, &settings, OpenMode::Strict).unwrap();
            assert!(!index.needs_reindex());
            index
                .coordinator()
                .ingest(vec![IngestRequest::new("photosynthesis in plants").with_doc_id("bio-1")])
                .await
                .unwrap();
            let stats = index.stats().await.unwrap();
            assert_eq!(stats.lexical_documents, 1);
            assert_eq!(stats.vector_documents, 1);
            assert_eq!(stats.model_id, "hashed-sha256-64");
        }

        assert!(db.join(MODEL_METADATA_FILE).exists());
        let index = StudyIndex::open(&db, &settings, OpenMode::Strict).unwrap();
        let doc = index.get(&"bio-1".into()).await.unwrap().unwrap();
        assert_eq!(doc.text, "photosynthesis in plants");
        let response = index
            .retriever()
            .search(HybridQuery::new("photosynthesis").top_k(1))
            .await
            .unwrap();
        assert_eq!(response.results[0].doc_id.as_str(), "bio-1");
    }

    #[tokio::test]
    async fn test_second_writer_is_rejected() {
        let dir = tempdir().unwrap();
        let settings = hashed_settings(16);
        let _first = StudyIndex::open(dir.path(), &settings, OpenMode::Strict).unwrap();
        let second = StudyIndex::open(dir.path(), &settings, OpenMode::Strict);
        assert!(matches!(second, Err(StudySearchError::Config { .. })));
    }

    #[tokio::test]
    async fn test_model_change_requires_reindex() {
        let dir = tempdir().unwrap();
        {
            let index = StudyIndex::open(dir.path(), &hashed_settings(16), OpenMode::Strict).unwrap();
            index
                .coordinator()
                .ingest(vec![IngestRequest::new("plate tectonics").with_doc_id("geo-1")])
                .await
                .unwrap();
        }

        let changed = hashed_settings(32);
        let err = StudyIndex::open(dir.path(), &changed, OpenMode::Strict)
            .err()
            .unwrap();
        assert!(err.to_string().contains("reindex"));

        {
            let index = StudyIndex::open(dir.path(), &changed, OpenMode::Reindex).unwrap();
            assert!(index.needs_reindex());
            let summary = index.reindex(|_, _| {}).await.unwrap();
            assert_eq!(summary.reindexed, 1);
        }

        let meta = ModelMetadata::read(dir.path()).unwrap().unwrap();
        assert_eq!(meta.dimensions, 32);
        let index = StudyIndex::open(dir.path(), &changed, OpenMode::Strict).unwrap();
        assert_eq!(index.stats().await.unwrap().vector_documents, 1);
    }

    #[test]
    fn test_open_with_custom_embedder() {
        let dir = tempdir().unwrap();
        let embedder = Arc::new(HashedEmbedder::new(8).unwrap());
        let index = StudyIndex::open_with(
            dir.path(),
            &Settings::default(),
            embedder,
            Arc::new(TracingEventSink),
            OpenMode::Strict,
        )
        .unwrap();
        assert_eq!(index.db_path(), dir.path());
    }
}
