use arroy::distances::Cosine;
use arroy::{Database as ArroyDatabase, ItemId, Reader, Writer};
use async_trait::async_trait;
use heed::byteorder::BigEndian;
use heed::types::*;
use heed::{Database, EnvOpenOptions, RoTxn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{VectorEntry, VectorHit, VectorIndex};
use crate::constants::{
    ANN_SEARCH_K_MULTIPLIER, DEFAULT_EXACT_SEARCH_THRESHOLD, DEFAULT_LMDB_MAP_SIZE_MB,
};
use crate::document::{DocId, FilterOpKind, Metadata, MetadataFilter};
use crate::embed::cosine_similarity;
use crate::error::{Result, StoreKind, StudySearchError};

const NEXT_ID_KEY: &str = "next_id";
const DIMENSIONS_KEY: &str = "dimensions";
const DIRTY_KEY: &str = "dirty";

/// Fixed seed so the same data always builds the same forest
const ANN_SEED: u64 = 0x5eed_5eed;

/// Extra candidates pulled from the forest when a filter will drop some
const FILTERED_ANN_WIDENING: usize = 8;

fn engine_error(e: impl std::fmt::Display) -> StudySearchError {
    StudySearchError::transient(StoreKind::Vector, e.to_string())
}

#[derive(Debug, Clone)]
pub struct VectorStoreOptions {
    pub map_size_mb: usize,
    /// Collections or filtered candidate sets up to this size are scanned exactly
    pub exact_search_threshold: usize,
}

impl Default for VectorStoreOptions {
    fn default() -> Self {
        Self {
            map_size_mb: DEFAULT_LMDB_MAP_SIZE_MB,
            exact_search_threshold: DEFAULT_EXACT_SEARCH_THRESHOLD,
        }
    }
}

struct Inner {
    env: heed::Env,
    vectors: ArroyDatabase<Cosine>,
    entries: Database<U32<BigEndian>, SerdeJson<VectorEntry>>,
    item_ids: Database<Str, U32<BigEndian>>,
    meta: Database<Str, U32<BigEndian>>,
    dimensions: usize,
    exact_search_threshold: usize,
    /// The ANN forest no longer reflects the stored items
    dirty: AtomicBool,
    build_lock: Mutex<()>,
}

/// Vector database using arroy + heed (LMDB)
///
/// - Vector search via arroy (cosine, random-projection forest)
/// - Entries (embedding + metadata copy) in heed, keyed by a dense item id
/// - `doc_id -> item id` map so re-adding a document reuses its item
/// - ACID transactions, memory-mapped
pub struct ArroyVectorStore {
    inner: Arc<Inner>,
}

impl ArroyVectorStore {
    /// Create or open a vector store in `path` for `dimensions`-sized vectors
    pub fn open(path: &Path, dimensions: usize, options: VectorStoreOptions) -> Result<Self> {
        if dimensions == 0 {
            return Err(StudySearchError::config("vector dimensions must be positive"));
        }
        fs::create_dir_all(path).map_err(|e| StudySearchError::io(path, e.to_string()))?;
        cleanup_stale_del_files(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(options.map_size_mb * 1024 * 1024)
                .max_dbs(10)
                .open(path)
                .map_err(engine_error)?
        };

        let mut wtxn = env.write_txn().map_err(engine_error)?;
        let vectors: ArroyDatabase<Cosine> = env
            .create_database(&mut wtxn, Some("vectors"))
            .map_err(engine_error)?;
        let entries: Database<U32<BigEndian>, SerdeJson<VectorEntry>> = env
            .create_database(&mut wtxn, Some("entries"))
            .map_err(engine_error)?;
        let item_ids: Database<Str, U32<BigEndian>> = env
            .create_database(&mut wtxn, Some("item_ids"))
            .map_err(engine_error)?;
        let meta: Database<Str, U32<BigEndian>> = env
            .create_database(&mut wtxn, Some("meta"))
            .map_err(engine_error)?;

        match meta.get(&wtxn, DIMENSIONS_KEY).map_err(engine_error)? {
            Some(stored) if stored as usize != dimensions => {
                return Err(StudySearchError::config(format!(
                    "vector store at {} holds {}-dim vectors, embedder produces {} (run reindex)",
                    path.display(),
                    stored,
                    dimensions
                )));
            }
            Some(_) => {}
            None => meta
                .put(&mut wtxn, DIMENSIONS_KEY, &(dimensions as u32))
                .map_err(engine_error)?,
        }

        let count = entries.len(&wtxn).map_err(engine_error)?;
        let flagged = meta.get(&wtxn, DIRTY_KEY).map_err(engine_error)? == Some(1);
        wtxn.commit().map_err(engine_error)?;

        let dirty = count > 0 && {
            let rtxn = env.read_txn().map_err(engine_error)?;
            flagged || Reader::open(&rtxn, 0, vectors).is_err()
        };

        tracing::debug!(
            "Vector store opened at {} ({} entries, dims {}, rebuild pending: {})",
            path.display(),
            count,
            dimensions,
            dirty
        );

        Ok(Self {
            inner: Arc::new(Inner {
                env,
                vectors,
                entries,
                item_ids,
                meta,
                dimensions,
                exact_search_threshold: options.exact_search_threshold,
                dirty: AtomicBool::new(dirty),
                build_lock: Mutex::new(()),
            }),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| engine_error(format!("vector task failed: {}", e)))?
    }
}

impl Inner {
    fn check_dimensions(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimensions {
            return Err(StudySearchError::validation(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimensions,
                embedding.len()
            )));
        }
        if embedding.iter().any(|x| !x.is_finite()) {
            return Err(StudySearchError::validation("embedding contains non-finite values"));
        }
        Ok(())
    }

    fn add(&self, doc_id: &DocId, embedding: &[f32], metadata: &Metadata) -> Result<()> {
        self.check_dimensions(embedding)?;

        let mut wtxn = self.env.write_txn().map_err(engine_error)?;
        let writer = Writer::new(self.vectors, 0, self.dimensions);

        let item = match self.item_ids.get(&wtxn, doc_id.as_str()).map_err(engine_error)? {
            Some(existing) => {
                writer.del_item(&mut wtxn, existing).map_err(engine_error)?;
                existing
            }
            None => {
                let next = self
                    .meta
                    .get(&wtxn, NEXT_ID_KEY)
                    .map_err(engine_error)?
                    .unwrap_or(0);
                let following = next
                    .checked_add(1)
                    .ok_or_else(|| engine_error("vector store item ids exhausted"))?;
                self.meta
                    .put(&mut wtxn, NEXT_ID_KEY, &following)
                    .map_err(engine_error)?;
                self.item_ids
                    .put(&mut wtxn, doc_id.as_str(), &next)
                    .map_err(engine_error)?;
                next
            }
        };

        writer
            .add_item(&mut wtxn, item, embedding)
            .map_err(engine_error)?;
        let entry = VectorEntry {
            doc_id: doc_id.clone(),
            embedding: embedding.to_vec(),
            metadata: metadata.clone(),
            created_at: chrono::Utc::now(),
        };
        self.entries
            .put(&mut wtxn, &item, &entry)
            .map_err(engine_error)?;
        self.meta.put(&mut wtxn, DIRTY_KEY, &1).map_err(engine_error)?;

        wtxn.commit().map_err(engine_error)?;
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, doc_id: &DocId) -> Result<()> {
        let mut wtxn = self.env.write_txn().map_err(engine_error)?;
        let Some(item) = self.item_ids.get(&wtxn, doc_id.as_str()).map_err(engine_error)? else {
            return Ok(());
        };

        let writer = Writer::new(self.vectors, 0, self.dimensions);
        writer.del_item(&mut wtxn, item).map_err(engine_error)?;
        self.entries.delete(&mut wtxn, &item).map_err(engine_error)?;
        self.item_ids
            .delete(&mut wtxn, doc_id.as_str())
            .map_err(engine_error)?;
        self.meta.put(&mut wtxn, DIRTY_KEY, &1).map_err(engine_error)?;

        wtxn.commit().map_err(engine_error)?;
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, doc_id: &DocId) -> Result<Option<VectorEntry>> {
        let rtxn = self.env.read_txn().map_err(engine_error)?;
        match self.item_ids.get(&rtxn, doc_id.as_str()).map_err(engine_error)? {
            Some(item) => self.entries.get(&rtxn, &item).map_err(engine_error),
            None => Ok(None),
        }
    }

    fn count(&self) -> Result<usize> {
        let rtxn = self.env.read_txn().map_err(engine_error)?;
        Ok(self.entries.len(&rtxn).map_err(engine_error)? as usize)
    }

    fn clear(&self) -> Result<()> {
        let mut wtxn = self.env.write_txn().map_err(engine_error)?;
        self.vectors.clear(&mut wtxn).map_err(engine_error)?;
        self.entries.clear(&mut wtxn).map_err(engine_error)?;
        self.item_ids.clear(&mut wtxn).map_err(engine_error)?;
        self.meta.put(&mut wtxn, NEXT_ID_KEY, &0).map_err(engine_error)?;
        self.meta.put(&mut wtxn, DIRTY_KEY, &0).map_err(engine_error)?;
        wtxn.commit().map_err(engine_error)?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Rebuild the ANN forest if writes happened since the last build
    fn ensure_index(&self) -> Result<()> {
        if !self.dirty.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self
            .build_lock
            .lock()
            .map_err(|_| engine_error("vector build lock poisoned"))?;
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let build = || -> Result<()> {
            let mut wtxn = self.env.write_txn().map_err(engine_error)?;
            let writer = Writer::new(self.vectors, 0, self.dimensions);
            let mut rng = StdRng::seed_from_u64(ANN_SEED);
            writer
                .builder(&mut rng)
                .build(&mut wtxn)
                .map_err(engine_error)?;
            self.meta.put(&mut wtxn, DIRTY_KEY, &0).map_err(engine_error)?;
            wtxn.commit().map_err(engine_error)
        };

        let started = std::time::Instant::now();
        match build() {
            Ok(()) => {
                tracing::debug!("Rebuilt vector forest in {:?}", started.elapsed());
                Ok(())
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<VectorHit>> {
        self.check_dimensions(query)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let total = self.count()?;
        if total == 0 {
            return Ok(Vec::new());
        }

        if total <= self.exact_search_threshold {
            let rtxn = self.env.read_txn().map_err(engine_error)?;
            let candidates = self.scan(&rtxn, filter)?;
            return Ok(exact_top_k(query, candidates, top_k));
        }

        if !filter.is_empty() {
            let rtxn = self.env.read_txn().map_err(engine_error)?;
            let candidates = self.scan(&rtxn, filter)?;
            if candidates.len() <= self.exact_search_threshold {
                return Ok(exact_top_k(query, candidates, top_k));
            }
        }

        self.ensure_index()?;
        let rtxn = self.env.read_txn().map_err(engine_error)?;
        let reader = Reader::open(&rtxn, 0, self.vectors).map_err(engine_error)?;

        let limit = if filter.is_empty() {
            top_k
        } else {
            top_k.saturating_mul(FILTERED_ANN_WIDENING).min(total)
        };
        let mut nns = reader.nns(limit);
        if let Some(n_trees) = NonZeroUsize::new(reader.n_trees()) {
            if let Some(search_k) =
                NonZeroUsize::new(limit * n_trees.get() * ANN_SEARCH_K_MULTIPLIER)
            {
                nns.search_k(search_k);
            }
        }
        let neighbours = nns.by_vector(&rtxn, query).map_err(engine_error)?;

        let mut hits = Vec::with_capacity(neighbours.len());
        for (item, _distance) in neighbours {
            let Some(entry) = self.entries.get(&rtxn, &item).map_err(engine_error)? else {
                continue;
            };
            if !filter.matches(&entry.metadata) {
                continue;
            }
            hits.push(VectorHit {
                similarity: cosine_similarity(query, &entry.embedding),
                doc_id: entry.doc_id,
                metadata: entry.metadata,
            });
        }
        sort_hits(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Entries passing `filter`
    fn scan(&self, rtxn: &RoTxn, filter: &MetadataFilter) -> Result<Vec<(ItemId, VectorEntry)>> {
        let mut candidates = Vec::new();
        for result in self.entries.iter(rtxn).map_err(engine_error)? {
            let (item, entry) = result.map_err(engine_error)?;
            if filter.matches(&entry.metadata) {
                candidates.push((item, entry));
            }
        }
        Ok(candidates)
    }
}

fn exact_top_k(query: &[f32], candidates: Vec<(ItemId, VectorEntry)>, top_k: usize) -> Vec<VectorHit> {
    let mut hits: Vec<VectorHit> = candidates
        .into_par_iter()
        .map(|(_, entry)| VectorHit {
            similarity: cosine_similarity(query, &entry.embedding),
            doc_id: entry.doc_id,
            metadata: entry.metadata,
        })
        .collect();
    sort_hits(&mut hits);
    hits.truncate(top_k);
    hits
}

fn sort_hits(hits: &mut [VectorHit]) {
    hits.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.doc_id.cmp(&b.doc_id))
    });
}

#[async_trait]
impl VectorIndex for ArroyVectorStore {
    fn supports(&self, _op: FilterOpKind) -> bool {
        true
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions
    }

    async fn add(&self, doc_id: &DocId, embedding: &[f32], metadata: &Metadata) -> Result<()> {
        let (doc_id, embedding, metadata) = (doc_id.clone(), embedding.to_vec(), metadata.clone());
        self.blocking(move |inner| inner.add(&doc_id, &embedding, &metadata))
            .await
    }

    async fn search(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<VectorHit>> {
        let (embedding, filter) = (embedding.to_vec(), filter.clone());
        self.blocking(move |inner| inner.search(&embedding, top_k, &filter))
            .await
    }

    async fn delete(&self, doc_id: &DocId) -> Result<()> {
        let doc_id = doc_id.clone();
        self.blocking(move |inner| inner.delete(&doc_id)).await
    }

    async fn get(&self, doc_id: &DocId) -> Result<Option<VectorEntry>> {
        let doc_id = doc_id.clone();
        self.blocking(move |inner| inner.get(&doc_id)).await
    }

    async fn count(&self) -> Result<usize> {
        self.blocking(|inner| inner.count()).await
    }

    async fn clear(&self) -> Result<()> {
        self.blocking(|inner| inner.clear()).await
    }
}

/// Remove stale `.del` files left by an interrupted run before opening LMDB
fn cleanup_stale_del_files(db_path: &Path) -> Result<()> {
    let entries = fs::read_dir(db_path).map_err(|e| StudySearchError::io(db_path, e.to_string()))?;
    let mut cleaned = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("del") {
            fs::remove_file(&path).map_err(|e| StudySearchError::io(&path, e.to_string()))?;
            cleaned += 1;
        }
    }

    if cleaned > 0 {
        tracing::debug!("Cleaned up {} stale .del files", cleaned);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{metadata_from, FilterClause, MetadataValue};
    use crate::embed::{Embedder, HashedEmbedder};
    use tempfile::tempdir;

    const DIMS: usize = 32;

    fn embed(text: &str) -> Vec<f32> {
        HashedEmbedder::new(DIMS).unwrap().embed(text).unwrap()
    }

    fn meta(kind: &str, difficulty: i64) -> Metadata {
        let mut m = metadata_from([("type", kind)]);
        m.insert("difficulty".into(), MetadataValue::Int(difficulty));
        m
    }

    fn open(dir: &Path, threshold: usize) -> ArroyVectorStore {
        ArroyVectorStore::open(
            &dir.join("vectors"),
            DIMS,
            VectorStoreOptions {
                map_size_mb: 64,
                exact_search_threshold: threshold,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_add_and_search_exact() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), 1024);

        store.add(&"a".into(), &embed("derivative of x squared"), &meta("question", 1)).await.unwrap();
        store.add(&"b".into(), &embed("French Revolution causes"), &meta("question", 2)).await.unwrap();

        let hits = store
            .search(&embed("derivative of x squared"), 2, &MetadataFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].doc_id.as_str(), "a");
        assert!((hits[0].similarity - 1.0).abs() < 1e-5);
        assert!(hits.iter().all(|h| (-1.0..=1.0).contains(&h.similarity)));
    }

    #[tokio::test]
    async fn test_empty_store_returns_nothing() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), 1024);
        let hits = store
            .search(&embed("anything"), 5, &MetadataFilter::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_reuses_item() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), 1024);

        store.add(&"a".into(), &embed("limits"), &meta("question", 1)).await.unwrap();
        store.add(&"a".into(), &embed("integrals"), &meta("material", 3)).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let entry = store.get(&"a".into()).await.unwrap().unwrap();
        assert_eq!(entry.embedding, embed("integrals"));
        assert_eq!(entry.metadata["type"], MetadataValue::from("material"));
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), 1024);

        store.add(&"a".into(), &embed("limits"), &meta("question", 1)).await.unwrap();
        store.delete(&"a".into()).await.unwrap();
        store.delete(&"never-added".into()).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.get(&"a".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_all_filter_operators() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), 1024);
        for (id, kind, difficulty) in [("q1", "question", 1), ("q2", "question", 3), ("m1", "material", 2)] {
            store.add(&id.into(), &embed("calculus"), &meta(kind, difficulty)).await.unwrap();
        }

        let filter = MetadataFilter::default()
            .and(FilterClause::eq("type", "question"))
            .and("difficulty>=2".parse().unwrap());
        let hits = store.search(&embed("calculus"), 10, &filter).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["q2"]);

        let filter = MetadataFilter::default().and("difficulty<3".parse().unwrap());
        let hits = store.search(&embed("calculus"), 10, &filter).await.unwrap();
        // Equal similarity: ties broken by doc id
        let ids: Vec<&str> = hits.iter().map(|h| h.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "q1"]);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_validation_error() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), 1024);
        let err = store
            .add(&"a".into(), &[0.1, 0.2], &Metadata::new())
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let err = store
            .search(&[0.1, 0.2], 5, &MetadataFilter::default())
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_ann_path_finds_exact_match() {
        let dir = tempdir().unwrap();
        // Threshold 0 forces the forest for every search
        let store = open(dir.path(), 0);
        let topics = [
            "limits", "derivatives", "integrals", "series", "vectors", "matrices",
            "probability", "statistics", "geometry", "trigonometry", "logarithms", "sequences",
        ];
        for (i, topic) in topics.iter().enumerate() {
            let kind = if i % 2 == 0 { "question" } else { "material" };
            store.add(&(*topic).into(), &embed(topic), &meta(kind, i as i64)).await.unwrap();
        }

        let hits = store
            .search(&embed("probability"), 3, &MetadataFilter::default())
            .await
            .unwrap();
        assert_eq!(hits[0].doc_id.as_str(), "probability");
        assert!((hits[0].similarity - 1.0).abs() < 1e-5);

        // Writes after a build mark the forest stale; the next search rebuilds
        store.add(&"calculus".into(), &embed("calculus"), &meta("question", 0)).await.unwrap();
        let hits = store
            .search(&embed("calculus"), 1, &MetadataFilter::default())
            .await
            .unwrap();
        assert_eq!(hits[0].doc_id.as_str(), "calculus");
    }

    #[tokio::test]
    async fn test_reopen_checks_dimensions() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path(), 1024);
            store.add(&"a".into(), &embed("limits"), &meta("question", 1)).await.unwrap();
        }
        let reopened = open(dir.path(), 1024);
        assert_eq!(reopened.count().await.unwrap(), 1);
        drop(reopened);

        let err = ArroyVectorStore::open(&dir.path().join("vectors"), DIMS * 2, VectorStoreOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, StudySearchError::Config { .. }));
    }

    #[tokio::test]
    async fn test_clear() {
        let dir = tempdir().unwrap();
        let store = open(dir.path(), 1024);
        store.add(&"a".into(), &embed("limits"), &meta("question", 1)).await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
        store.add(&"b".into(), &embed("series"), &meta("question", 1)).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
