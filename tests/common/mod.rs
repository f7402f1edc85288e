//! Shared fixtures: real stores wrapped in doubles that count writes and can
//! be switched off or slowed down

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use studysearch::document::FilterOpKind;
use studysearch::utils::RetryPolicy;
use studysearch::{
    ArroyVectorStore, DocId, Document, EmbeddingService, HashedEmbedder, HybridRetriever,
    IngestRequest, IngestionCoordinator, LexicalHit, LexicalIndex, MemoryEventSink, Metadata,
    MetadataFilter, Result, RetrieverConfig, StoreKind, StudySearchError, TantivyLexicalStore,
    VectorEntry, VectorHit, VectorIndex, VectorStoreOptions,
};

pub const DIMS: usize = 384;

/// Failure switches shared by both doubles
#[derive(Default)]
pub struct Switches {
    /// Every call fails
    pub down: AtomicBool,
    /// The next n calls fail
    pub fail_next: AtomicUsize,
    /// Added latency per call
    pub delay_ms: AtomicU64,
    pub writes: AtomicUsize,
    pub searches: AtomicUsize,
    /// `top_k` of the most recent search
    pub last_top_k: AtomicUsize,
}

impl Switches {
    async fn gate(&self, store: StoreKind) -> Result<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(StudySearchError::transient(store, "connection refused"));
        }
        let pending = self.fail_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next.store(pending - 1, Ordering::SeqCst);
            return Err(StudySearchError::transient(store, "flaky"));
        }
        Ok(())
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn record_search(&self, top_k: usize) {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.last_top_k.store(top_k, Ordering::SeqCst);
    }

    pub fn last_top_k(&self) -> usize {
        self.last_top_k.load(Ordering::SeqCst)
    }
}

pub struct TestLexical {
    inner: TantivyLexicalStore,
    pub switches: Switches,
}

#[async_trait]
impl LexicalIndex for TestLexical {
    fn supports(&self, op: FilterOpKind) -> bool {
        self.inner.supports(op)
    }

    async fn add(&self, doc: &Document) -> Result<()> {
        self.switches.writes.fetch_add(1, Ordering::SeqCst);
        self.switches.gate(StoreKind::Lexical).await?;
        self.inner.add(doc).await
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<LexicalHit>> {
        self.switches.record_search(top_k);
        self.switches.gate(StoreKind::Lexical).await?;
        self.inner.search(query, top_k, filter).await
    }

    async fn delete(&self, doc_id: &DocId) -> Result<()> {
        self.switches.writes.fetch_add(1, Ordering::SeqCst);
        self.switches.gate(StoreKind::Lexical).await?;
        self.inner.delete(doc_id).await
    }

    async fn get(&self, doc_id: &DocId) -> Result<Option<Document>> {
        self.inner.get(doc_id).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }

    async fn documents(&self) -> Result<Vec<Document>> {
        self.inner.documents().await
    }
}

pub struct TestVector {
    inner: ArroyVectorStore,
    pub switches: Switches,
}

#[async_trait]
impl VectorIndex for TestVector {
    fn supports(&self, op: FilterOpKind) -> bool {
        self.inner.supports(op)
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn add(&self, doc_id: &DocId, embedding: &[f32], metadata: &Metadata) -> Result<()> {
        self.switches.writes.fetch_add(1, Ordering::SeqCst);
        self.switches.gate(StoreKind::Vector).await?;
        self.inner.add(doc_id, embedding, metadata).await
    }

    async fn search(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<VectorHit>> {
        self.switches.record_search(top_k);
        self.switches.gate(StoreKind::Vector).await?;
        self.inner.search(embedding, top_k, filter).await
    }

    async fn delete(&self, doc_id: &DocId) -> Result<()> {
        self.switches.writes.fetch_add(1, Ordering::SeqCst);
        self.switches.gate(StoreKind::Vector).await?;
        self.inner.delete(doc_id).await
    }

    async fn get(&self, doc_id: &DocId) -> Result<Option<VectorEntry>> {
        self.inner.get(doc_id).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }
}

pub struct Harness {
    _dir: TempDir,
    pub lexical: Arc<TestLexical>,
    pub vector: Arc<TestVector>,
    pub coordinator: IngestionCoordinator,
    pub retriever: HybridRetriever,
    pub events: Arc<MemoryEventSink>,
}

impl Harness {
    pub async fn ingest(&self, requests: Vec<IngestRequest>) -> Vec<studysearch::IngestOutcome> {
        self.coordinator.ingest(requests).await.unwrap()
    }
}

/// No retries, no query cache
pub fn harness() -> Harness {
    harness_with(RetrieverConfig {
        retry: RetryPolicy::none(),
        cache_ttl: Duration::ZERO,
        ..RetrieverConfig::default()
    })
}

pub fn harness_with(config: RetrieverConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let lexical = Arc::new(TestLexical {
        inner: TantivyLexicalStore::open(&dir.path().join("fts")).unwrap(),
        switches: Switches::default(),
    });
    let vector = Arc::new(TestVector {
        inner: ArroyVectorStore::open(&dir.path().join("vectors"), DIMS, VectorStoreOptions::default())
            .unwrap(),
        switches: Switches::default(),
    });
    let embeddings = Arc::new(
        EmbeddingService::new(Arc::new(HashedEmbedder::new(DIMS).unwrap()))
            .with_retry(RetryPolicy::none()),
    );
    let events = Arc::new(MemoryEventSink::new());

    let coordinator = IngestionCoordinator::new(lexical.clone(), vector.clone(), embeddings.clone())
        .with_retry(config.retry)
        .with_events(events.clone());
    let retriever = HybridRetriever::new(lexical.clone(), vector.clone(), embeddings, config)
        .with_generation(coordinator.generation())
        .with_events(events.clone());

    Harness {
        _dir: dir,
        lexical,
        vector,
        coordinator,
        retriever,
        events,
    }
}

pub fn doc(id: &str, text: &str) -> IngestRequest {
    IngestRequest::new(text).with_doc_id(id)
}

pub fn ids(response: &studysearch::QueryResponse) -> Vec<&str> {
    response.results.iter().map(|r| r.doc_id.as_str()).collect()
}
