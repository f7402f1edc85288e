//! Ingestion coordinator
//!
//! Assigns canonical document ids, embeds texts in batches and dual-writes
//! every document to the lexical and the vector store. The two writes are
//! independent failure domains: each is retried on its own, and a document
//! that only one store accepted is reported as degraded instead of being
//! rolled back.

mod locks;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::constants::{default_ingest_concurrency, DEFAULT_STORE_TIMEOUT_MS};
use crate::document::{validate_metadata, validate_text, DocId, Document, Metadata};
use crate::embed::EmbeddingService;
use crate::error::{Result, StoreKind, StudySearchError};
use crate::events::{EventSink, SearchEvent, TracingEventSink};
use crate::lexical::LexicalIndex;
use crate::utils::{retry_with_backoff, with_store_timeout, RetryPolicy};
use crate::vectordb::VectorIndex;
use locks::DocLocks;

/// Documents re-embedded per model call during a reindex
const REINDEX_BATCH_SIZE: usize = 64;

/// One document to ingest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Reuse an existing id (full overwrite); a fresh one is generated otherwise
    #[serde(default)]
    pub doc_id: Option<String>,
}

impl IngestRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: Metadata::new(),
            doc_id: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_doc_id(mut self, doc_id: impl Into<String>) -> Self {
        self.doc_id = Some(doc_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    /// Both stores acknowledged
    Ingested,
    /// Visible through one store only
    Degraded,
    Failed,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Ingested => "ingested",
            IngestStatus::Degraded => "degraded",
            IngestStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestOutcome {
    pub doc_id: DocId,
    pub status: IngestStatus,
    pub failed_stores: Vec<StoreKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteStatus {
    Deleted,
    /// One store confirmed; the other may still hold the document
    Partial,
    Failed,
}

impl DeleteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteStatus::Deleted => "deleted",
            DeleteStatus::Partial => "partial",
            DeleteStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteOutcome {
    pub doc_id: DocId,
    pub status: DeleteStatus,
    pub remaining: Vec<StoreKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReindexSummary {
    pub documents: usize,
    pub reindexed: usize,
    pub failed: Vec<DocId>,
}

/// Per-document write bookkeeping, discarded once the outcome is reported
#[derive(Debug, Clone)]
pub struct IngestionRecord {
    pub doc_id: DocId,
    pub lexical_committed: bool,
    pub vector_committed: bool,
    errors: Vec<(StoreKind, String)>,
}

impl IngestionRecord {
    pub fn new(doc_id: DocId) -> Self {
        Self {
            doc_id,
            lexical_committed: false,
            vector_committed: false,
            errors: Vec::new(),
        }
    }

    /// Record the final result of one store write
    pub fn settle(&mut self, store: StoreKind, result: Result<()>) {
        match result {
            Ok(()) => match store {
                StoreKind::Lexical => self.lexical_committed = true,
                StoreKind::Vector => self.vector_committed = true,
            },
            Err(e) => self.errors.push((store, e.to_string())),
        }
    }

    pub fn status(&self) -> IngestStatus {
        match (self.lexical_committed, self.vector_committed) {
            (true, true) => IngestStatus::Ingested,
            (false, false) => IngestStatus::Failed,
            _ => IngestStatus::Degraded,
        }
    }

    pub fn into_outcome(self) -> IngestOutcome {
        let status = self.status();
        let failed_stores = self.errors.iter().map(|(store, _)| *store).collect();
        let detail = describe(&self.errors);
        IngestOutcome {
            doc_id: self.doc_id,
            status,
            failed_stores,
            detail,
        }
    }
}

fn describe(errors: &[(StoreKind, String)]) -> Option<String> {
    if errors.is_empty() {
        return None;
    }
    Some(
        errors
            .iter()
            .map(|(store, message)| format!("{}: {}", store, message))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

/// Prefix a validation message with the offending batch position
fn at_position(index: usize, err: StudySearchError) -> StudySearchError {
    match err {
        StudySearchError::Validation { message } => {
            StudySearchError::validation(format!("document #{}: {}", index, message))
        }
        other => other,
    }
}

/// Dual-write coordinator over injected store handles
pub struct IngestionCoordinator {
    lexical: Arc<dyn LexicalIndex>,
    vector: Arc<dyn VectorIndex>,
    embeddings: Arc<EmbeddingService>,
    locks: DocLocks,
    generation: Arc<AtomicU64>,
    events: Arc<dyn EventSink>,
    retry: RetryPolicy,
    store_timeout: Duration,
    concurrency: usize,
}

impl IngestionCoordinator {
    pub fn new(
        lexical: Arc<dyn LexicalIndex>,
        vector: Arc<dyn VectorIndex>,
        embeddings: Arc<EmbeddingService>,
    ) -> Self {
        Self {
            lexical,
            vector,
            embeddings,
            locks: DocLocks::default(),
            generation: Arc::new(AtomicU64::new(0)),
            events: Arc::new(TracingEventSink),
            retry: RetryPolicy::default(),
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            concurrency: default_ingest_concurrency(),
        }
    }

    pub fn from_settings(
        lexical: Arc<dyn LexicalIndex>,
        vector: Arc<dyn VectorIndex>,
        embeddings: Arc<EmbeddingService>,
        settings: &Settings,
    ) -> Self {
        Self::new(lexical, vector, embeddings)
            .with_retry(settings.retry)
            .with_store_timeout(settings.store_timeout())
            .with_concurrency(settings.ingest_concurrency)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Share a write counter with readers that cache query results
    pub fn with_generation(mut self, generation: Arc<AtomicU64>) -> Self {
        self.generation = generation;
        self
    }

    /// Bumped after every write attempt
    pub fn generation(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.generation)
    }

    /// Ingest a batch, one outcome per request in request order
    ///
    /// The whole batch is validated before anything is written; a
    /// `Validation` error leaves both stores untouched.
    pub async fn ingest(&self, requests: Vec<IngestRequest>) -> Result<Vec<IngestOutcome>> {
        let documents = Self::prepare(requests)?;
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let texts: Vec<String> = documents.iter().map(|d| d.text.clone()).collect();
        let embeddings = self.embeddings.embed_batch(&texts).await;

        let outcomes: Vec<IngestOutcome> = stream::iter(documents.into_iter().zip(embeddings))
            .map(|(doc, embedding)| self.ingest_one(doc, embedding))
            .buffered(self.concurrency)
            .collect()
            .await;

        let degraded = outcomes
            .iter()
            .filter(|o| o.status != IngestStatus::Ingested)
            .count();
        info!(
            "📥 Ingested {} documents in {:?} ({} not fully ingested)",
            outcomes.len(),
            started.elapsed(),
            degraded
        );
        Ok(outcomes)
    }

    /// Check a batch without writing anything
    ///
    /// Blank text, malformed metadata, blank ids and ids repeated within the
    /// batch are `Validation` errors naming the batch position.
    pub fn validate_batch(requests: &[IngestRequest]) -> Result<()> {
        let mut seen = HashSet::new();
        for (index, request) in requests.iter().enumerate() {
            validate_text(&request.text).map_err(|e| at_position(index, e))?;
            validate_metadata(&request.metadata).map_err(|e| at_position(index, e))?;
            if let Some(raw) = &request.doc_id {
                let id = DocId::parse(raw.as_str()).map_err(|e| at_position(index, e))?;
                if !seen.insert(id) {
                    return Err(StudySearchError::validation(format!(
                        "document #{}: id '{}' appears more than once in the batch",
                        index, raw
                    )));
                }
            }
        }
        Ok(())
    }

    fn prepare(requests: Vec<IngestRequest>) -> Result<Vec<Document>> {
        Self::validate_batch(&requests)?;
        requests
            .into_iter()
            .map(|request| {
                let id = match request.doc_id {
                    Some(raw) => DocId::parse(raw)?,
                    None => DocId::generate(),
                };
                Ok(Document::new(id, request.text, request.metadata))
            })
            .collect()
    }

    async fn ingest_one(&self, doc: Document, embedding: Result<Vec<f32>>) -> IngestOutcome {
        let started = Instant::now();
        let _guard = self.locks.acquire(&doc.id).await;
        let mut record = IngestionRecord::new(doc.id.clone());

        let lexical = self.write_lexical(&doc);
        let vector = async {
            match embedding {
                Ok(vector) => self.write_vector(&doc.id, &vector, &doc.metadata).await,
                Err(e) => {
                    // An older vector under this id must not keep serving outdated text
                    if let Err(stale) = self.delete_from(StoreKind::Vector, &doc.id).await {
                        warn!("Could not drop stale vector for {}: {}", doc.id, stale);
                    }
                    Err(e)
                }
            }
        };
        let (lexical_result, vector_result) = tokio::join!(lexical, vector);
        record.settle(StoreKind::Lexical, lexical_result);
        record.settle(StoreKind::Vector, vector_result);
        self.generation.fetch_add(1, Ordering::SeqCst);

        let outcome = record.into_outcome();
        match outcome.status {
            IngestStatus::Ingested => debug!("Ingested {}", outcome.doc_id),
            _ => warn!(
                "Document {} {}: {}",
                outcome.doc_id,
                outcome.status.as_str(),
                outcome.detail.as_deref().unwrap_or("")
            ),
        }
        self.events.emit(&SearchEvent::DocumentIngested {
            doc_id: outcome.doc_id.clone(),
            status: outcome.status,
            failed_stores: outcome.failed_stores.clone(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
        outcome
    }

    async fn write_lexical(&self, doc: &Document) -> Result<()> {
        retry_with_backoff(
            &self.retry,
            "lexical write",
            StudySearchError::is_transient,
            move || with_store_timeout(StoreKind::Lexical, self.store_timeout, self.lexical.add(doc)),
        )
        .await
    }

    async fn write_vector(&self, id: &DocId, embedding: &[f32], metadata: &Metadata) -> Result<()> {
        retry_with_backoff(
            &self.retry,
            "vector write",
            StudySearchError::is_transient,
            move || {
                with_store_timeout(
                    StoreKind::Vector,
                    self.store_timeout,
                    self.vector.add(id, embedding, metadata),
                )
            },
        )
        .await
    }

    async fn delete_from(&self, store: StoreKind, id: &DocId) -> Result<()> {
        let label = format!("{} delete", store);
        retry_with_backoff(&self.retry, &label, StudySearchError::is_transient, move || {
            let call = async move {
                match store {
                    StoreKind::Lexical => self.lexical.delete(id).await,
                    StoreKind::Vector => self.vector.delete(id).await,
                }
            };
            with_store_timeout(store, self.store_timeout, call)
        })
        .await
    }

    /// Delete documents from both stores
    ///
    /// An id is free for reuse only once its outcome is `Deleted`.
    pub async fn delete(&self, ids: Vec<DocId>) -> Result<Vec<DeleteOutcome>> {
        let outcomes: Vec<DeleteOutcome> = stream::iter(ids)
            .map(|id| self.delete_one(id))
            .buffered(self.concurrency)
            .collect()
            .await;
        Ok(outcomes)
    }

    async fn delete_one(&self, id: DocId) -> DeleteOutcome {
        let _guard = self.locks.acquire(&id).await;
        let (lexical, vector) = tokio::join!(
            self.delete_from(StoreKind::Lexical, &id),
            self.delete_from(StoreKind::Vector, &id)
        );
        self.generation.fetch_add(1, Ordering::SeqCst);

        let mut errors = Vec::new();
        if let Err(e) = lexical {
            errors.push((StoreKind::Lexical, e.to_string()));
        }
        if let Err(e) = vector {
            errors.push((StoreKind::Vector, e.to_string()));
        }
        let status = match errors.len() {
            0 => DeleteStatus::Deleted,
            1 => DeleteStatus::Partial,
            _ => DeleteStatus::Failed,
        };
        let remaining: Vec<StoreKind> = errors.iter().map(|(store, _)| *store).collect();

        if status != DeleteStatus::Deleted {
            warn!("Delete of {} {}: remaining in {:?}", id, status.as_str(), remaining);
        }
        self.events.emit(&SearchEvent::DocumentDeleted {
            doc_id: id.clone(),
            status,
            remaining: remaining.clone(),
        });

        DeleteOutcome {
            doc_id: id,
            status,
            remaining,
            detail: describe(&errors),
        }
    }

    /// Rebuild the vector store from the texts held by the lexical store
    ///
    /// Used after the embedding model changes. `progress` receives
    /// `(done, total)` after every batch.
    pub async fn reindex_vectors<F>(&self, progress: F) -> Result<ReindexSummary>
    where
        F: Fn(usize, usize),
    {
        let lexical = &self.lexical;
        let documents = retry_with_backoff(
            &self.retry,
            "lexical scan",
            StudySearchError::is_transient,
            move || lexical.documents(),
        )
        .await?;
        let vector = &self.vector;
        retry_with_backoff(
            &self.retry,
            "vector clear",
            StudySearchError::is_transient,
            move || vector.clear(),
        )
        .await?;
        self.generation.fetch_add(1, Ordering::SeqCst);

        let total = documents.len();
        info!("🔄 Re-embedding {} documents with {}", total, self.embeddings.model_id());
        let mut summary = ReindexSummary {
            documents: total,
            ..ReindexSummary::default()
        };

        let mut done = 0;
        for batch in documents.chunks(REINDEX_BATCH_SIZE) {
            let texts: Vec<String> = batch.iter().map(|d| d.text.clone()).collect();
            let embeddings = self.embeddings.embed_batch(&texts).await;

            let results: Vec<(DocId, Result<()>)> = stream::iter(batch.iter().zip(embeddings))
                .map(|(doc, embedding)| async move {
                    let _guard = self.locks.acquire(&doc.id).await;
                    let result = match embedding {
                        Ok(vector) => self.write_vector(&doc.id, &vector, &doc.metadata).await,
                        Err(e) => Err(e),
                    };
                    (doc.id.clone(), result)
                })
                .buffered(self.concurrency)
                .collect()
                .await;

            for (id, result) in results {
                match result {
                    Ok(()) => summary.reindexed += 1,
                    Err(e) => {
                        warn!("Reindex of {} failed: {}", id, e);
                        summary.failed.push(id);
                    }
                }
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            done += batch.len();
            progress(done, total);
        }

        info!(
            "✅ Reindex complete: {}/{} documents have vectors",
            summary.reindexed, summary.documents
        );
        Ok(summary)
    }
}
