//! Hybrid retriever
//!
//! Fans a query out to the lexical and the vector store concurrently,
//! normalizes both score lists per query, fuses them and returns one ranked
//! list. Losing one store degrades the response (`partial = true`); losing
//! both is a `RetrievalUnavailable` error.

mod fusion;

pub use fusion::{fuse, min_max_normalize, sort_fused, FusedResult};

use moka::sync::Cache;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::Settings;
use crate::constants::{
    DEFAULT_ALPHA, DEFAULT_MAX_TOP_K, DEFAULT_OVER_FETCH_FACTOR, DEFAULT_QUERY_CACHE_TTL_SECS,
    DEFAULT_QUERY_TIMEOUT_MS, DEFAULT_STORE_TIMEOUT_MS, DEFAULT_TOP_K, MIN_OVER_FETCH_FACTOR,
    QUERY_CACHE_MAX_ENTRIES,
};
use crate::document::{DocType, FilterClause, MetadataFilter};
use crate::embed::EmbeddingService;
use crate::error::{Result, StoreKind, StudySearchError};
use crate::events::{EventSink, SearchEvent, TracingEventSink};
use crate::lexical::{LexicalHit, LexicalIndex};
use crate::utils::{retry_with_backoff, sha256_hex, with_store_timeout, RetryPolicy};
use crate::vectordb::{VectorHit, VectorIndex};

/// A hybrid search request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HybridQuery {
    pub text: String,
    /// Defaults to the retriever's configured top-k
    pub top_k: Option<usize>,
    /// Vector weight; defaults to the retriever's configured alpha
    pub alpha: Option<f32>,
    pub filter: MetadataFilter,
    pub doc_type: Option<DocType>,
}

impl HybridQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            top_k: None,
            alpha: None,
            filter: MetadataFilter::default(),
            doc_type: None,
        }
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn alpha(mut self, alpha: f32) -> Self {
        self.alpha = Some(alpha);
        self
    }

    pub fn filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn clause(mut self, clause: FilterClause) -> Self {
        self.filter.push(clause);
        self
    }

    pub fn doc_type(mut self, doc_type: DocType) -> Self {
        self.doc_type = Some(doc_type);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub results: Vec<FusedResult>,
    /// At least one store did not contribute
    pub partial: bool,
    pub degraded: Vec<StoreKind>,
    /// Alpha actually used (forced to 0 or 1 when a side is missing)
    pub alpha_applied: f32,
    pub took_ms: u64,
    pub cached: bool,
}

#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    pub alpha: f32,
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub over_fetch_factor: usize,
    pub store_timeout: Duration,
    /// Deadline for each side of a query, retries included
    pub query_timeout: Duration,
    pub retry: RetryPolicy,
    /// Zero disables the query cache
    pub cache_ttl: Duration,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            default_top_k: DEFAULT_TOP_K,
            max_top_k: DEFAULT_MAX_TOP_K,
            over_fetch_factor: DEFAULT_OVER_FETCH_FACTOR,
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            query_timeout: Duration::from_millis(DEFAULT_QUERY_TIMEOUT_MS),
            retry: RetryPolicy::default(),
            cache_ttl: Duration::from_secs(DEFAULT_QUERY_CACHE_TTL_SECS),
        }
    }
}

impl RetrieverConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            alpha: settings.alpha,
            default_top_k: settings.default_top_k,
            max_top_k: settings.max_top_k,
            over_fetch_factor: settings.over_fetch_factor.max(MIN_OVER_FETCH_FACTOR),
            store_timeout: settings.store_timeout(),
            query_timeout: settings.query_timeout(),
            retry: settings.retry,
            cache_ttl: Duration::from_secs(settings.query_cache_ttl_secs),
        }
    }
}

/// Validated query, with filters split per store
struct QueryPlan {
    text: String,
    top_k: usize,
    fetch_k: usize,
    alpha: f32,
    lexical_native: MetadataFilter,
    lexical_residual: MetadataFilter,
    vector_native: MetadataFilter,
    vector_residual: MetadataFilter,
    cache_key: String,
}

struct CachedResponse {
    generation: u64,
    response: QueryResponse,
}

pub struct HybridRetriever {
    lexical: Arc<dyn LexicalIndex>,
    vector: Arc<dyn VectorIndex>,
    embeddings: Arc<EmbeddingService>,
    config: RetrieverConfig,
    cache: Option<Cache<String, Arc<CachedResponse>>>,
    generation: Arc<AtomicU64>,
    events: Arc<dyn EventSink>,
}

impl HybridRetriever {
    pub fn new(
        lexical: Arc<dyn LexicalIndex>,
        vector: Arc<dyn VectorIndex>,
        embeddings: Arc<EmbeddingService>,
        config: RetrieverConfig,
    ) -> Self {
        let cache = (!config.cache_ttl.is_zero()).then(|| {
            Cache::builder()
                .max_capacity(QUERY_CACHE_MAX_ENTRIES)
                .time_to_live(config.cache_ttl)
                .build()
        });
        Self {
            lexical,
            vector,
            embeddings,
            config,
            cache,
            generation: Arc::new(AtomicU64::new(0)),
            events: Arc::new(TracingEventSink),
        }
    }

    /// Share the write counter of the coordinator feeding the same stores
    pub fn with_generation(mut self, generation: Arc<AtomicU64>) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &RetrieverConfig {
        &self.config
    }

    /// Similar questions only
    pub async fn search_questions(&self, text: &str, top_k: usize) -> Result<QueryResponse> {
        self.search(HybridQuery::new(text).top_k(top_k).doc_type(DocType::Question))
            .await
    }

    /// Study materials only
    pub async fn search_materials(&self, text: &str, top_k: usize) -> Result<QueryResponse> {
        self.search(HybridQuery::new(text).top_k(top_k).doc_type(DocType::Material))
            .await
    }

    pub async fn search(&self, query: HybridQuery) -> Result<QueryResponse> {
        let started = Instant::now();
        let plan = self.plan(query)?;

        if let Some(mut response) = self.cached(&plan.cache_key) {
            response.cached = true;
            response.took_ms = started.elapsed().as_millis() as u64;
            self.emit_completed(&response);
            return Ok(response);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let outcome = self.execute(&plan).await;
        let took_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(mut response) => {
                response.took_ms = took_ms;
                if !response.partial {
                    if let Some(cache) = &self.cache {
                        cache.insert(
                            plan.cache_key,
                            Arc::new(CachedResponse {
                                generation,
                                response: response.clone(),
                            }),
                        );
                    }
                }
                self.emit_completed(&response);
                Ok(response)
            }
            Err(e) => {
                self.events.emit(&SearchEvent::QueryFailed {
                    took_ms,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn plan(&self, query: HybridQuery) -> Result<QueryPlan> {
        let text = query.text.split_whitespace().collect::<Vec<_>>().join(" ");
        if text.is_empty() {
            return Err(StudySearchError::validation("query text must not be empty"));
        }

        let top_k = query.top_k.unwrap_or(self.config.default_top_k);
        if top_k == 0 || top_k > self.config.max_top_k {
            return Err(StudySearchError::validation(format!(
                "top_k must be between 1 and {}, got {}",
                self.config.max_top_k, top_k
            )));
        }

        let alpha = query.alpha.unwrap_or(self.config.alpha);
        if !alpha.is_finite() || !(0.0..=1.0).contains(&alpha) {
            return Err(StudySearchError::validation(format!(
                "alpha must be within [0, 1], got {}",
                alpha
            )));
        }

        let mut filter = query.filter;
        if let Some(doc_type) = query.doc_type {
            filter.push(doc_type.clause());
        }
        filter.validate()?;

        let (lexical_native, lexical_residual) = filter.partition(|op| self.lexical.supports(op));
        let (vector_native, vector_residual) = filter.partition(|op| self.vector.supports(op));

        let top_k_str = top_k.to_string();
        let alpha_str = alpha.to_string();
        let cache_key = sha256_hex(&[
            self.embeddings.model_id(),
            &text,
            &top_k_str,
            &alpha_str,
            &filter.cache_key(),
        ]);

        Ok(QueryPlan {
            fetch_k: top_k.saturating_mul(self.config.over_fetch_factor),
            text,
            top_k,
            alpha,
            lexical_native,
            lexical_residual,
            vector_native,
            vector_residual,
            cache_key,
        })
    }

    fn cached(&self, key: &str) -> Option<QueryResponse> {
        let cache = self.cache.as_ref()?;
        let entry = cache.get(key)?;
        if entry.generation != self.generation.load(Ordering::SeqCst) {
            cache.invalidate(key);
            return None;
        }
        debug!("Query cache hit");
        Some(entry.response.clone())
    }

    /// Both sides share one deadline; a side that misses it is degraded like
    /// any other store failure
    async fn execute(&self, plan: &QueryPlan) -> Result<QueryResponse> {
        let deadline = tokio::time::Instant::now() + self.config.query_timeout;
        let lexical = self.within_deadline(StoreKind::Lexical, deadline, self.search_lexical(plan));
        let vector = self.within_deadline(StoreKind::Vector, deadline, async {
            let embedding = self.embeddings.embed_query(&plan.text).await?;
            self.search_vector(&embedding, plan).await
        });
        let (lexical, vector) = tokio::join!(lexical, vector);

        let mut degraded = Vec::new();
        let mut failures = Vec::new();
        let lexical_hits = match lexical {
            Ok(hits) => Some(hits),
            Err(e) if e.is_validation() => return Err(e),
            Err(e) => {
                warn!("Lexical side unavailable, continuing vector-only: {}", e);
                degraded.push(StoreKind::Lexical);
                failures.push(format!("lexical: {}", e));
                None
            }
        };
        let vector_hits = match vector {
            Ok(hits) => Some(hits),
            Err(e) if e.is_validation() => return Err(e),
            Err(e) => {
                warn!("Vector side unavailable, continuing lexical-only: {}", e);
                degraded.push(StoreKind::Vector);
                failures.push(format!("vector: {}", e));
                None
            }
        };

        let alpha_applied = match (&lexical_hits, &vector_hits) {
            (Some(_), Some(_)) => plan.alpha,
            (Some(_), None) => 0.0,
            (None, Some(_)) => 1.0,
            (None, None) => {
                return Err(StudySearchError::retrieval_unavailable(failures.join("; ")))
            }
        };

        let lexical_hits = lexical_hits.unwrap_or_default();
        let vector_hits = vector_hits.unwrap_or_default();
        let mut results = fuse(&lexical_hits, &vector_hits, alpha_applied);

        // Clauses a store could not evaluate are applied to the candidates it produced
        results.retain(|r| {
            (r.lexical_raw.is_none() || plan.lexical_residual.matches(&r.metadata))
                && (r.vector_raw.is_none() || plan.vector_residual.matches(&r.metadata))
        });
        results.truncate(plan.top_k);

        debug!(
            "Fused {} lexical + {} vector candidates into {} results",
            lexical_hits.len(),
            vector_hits.len(),
            results.len()
        );

        Ok(QueryResponse {
            results,
            partial: !degraded.is_empty(),
            degraded,
            alpha_applied,
            took_ms: 0,
            cached: false,
        })
    }

    async fn search_lexical(&self, plan: &QueryPlan) -> Result<Vec<LexicalHit>> {
        retry_with_backoff(
            &self.config.retry,
            "lexical search",
            StudySearchError::is_transient,
            move || {
                with_store_timeout(
                    StoreKind::Lexical,
                    self.config.store_timeout,
                    self.lexical
                        .search(&plan.text, plan.fetch_k, &plan.lexical_native),
                )
            },
        )
        .await
    }

    async fn search_vector(&self, embedding: &[f32], plan: &QueryPlan) -> Result<Vec<VectorHit>> {
        retry_with_backoff(
            &self.config.retry,
            "vector search",
            StudySearchError::is_transient,
            move || {
                with_store_timeout(
                    StoreKind::Vector,
                    self.config.store_timeout,
                    self.vector
                        .search(embedding, plan.fetch_k, &plan.vector_native),
                )
            },
        )
        .await
    }

    async fn within_deadline<T>(
        &self,
        store: StoreKind,
        deadline: tokio::time::Instant,
        side: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout_at(deadline, side).await {
            Ok(result) => result,
            Err(_) => Err(StudySearchError::transient(
                store,
                format!(
                    "missed the {} ms query deadline",
                    self.config.query_timeout.as_millis()
                ),
            )),
        }
    }

    fn emit_completed(&self, response: &QueryResponse) {
        self.events.emit(&SearchEvent::QueryCompleted {
            took_ms: response.took_ms,
            results: response.results.len(),
            partial: response.partial,
            degraded: response.degraded.clone(),
            cached: response.cached,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{metadata_from, MetadataValue};
    use crate::embed::HashedEmbedder;
    use crate::events::MemoryEventSink;
    use crate::ingest::{IngestRequest, IngestionCoordinator};
    use crate::lexical::TantivyLexicalStore;
    use crate::vectordb::{ArroyVectorStore, VectorStoreOptions};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        coordinator: IngestionCoordinator,
        retriever: HybridRetriever,
        events: Arc<MemoryEventSink>,
    }

    async fn fixture(cache_ttl: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let lexical: Arc<dyn LexicalIndex> = Arc::new(TantivyLexicalStore::in_memory().unwrap());
        let vector: Arc<dyn VectorIndex> = Arc::new(
            ArroyVectorStore::open(&dir.path().join("vectors"), 384, VectorStoreOptions::default())
                .unwrap(),
        );
        let embeddings = Arc::new(EmbeddingService::new(Arc::new(HashedEmbedder::new(384).unwrap())));
        let coordinator =
            IngestionCoordinator::new(lexical.clone(), vector.clone(), embeddings.clone());
        let events = Arc::new(MemoryEventSink::new());
        let retriever = HybridRetriever::new(
            lexical,
            vector,
            embeddings,
            RetrieverConfig {
                cache_ttl,
                ..RetrieverConfig::default()
            },
        )
        .with_generation(coordinator.generation())
        .with_events(events.clone());

        coordinator
            .ingest(vec![
                IngestRequest::new("derivative of x squared")
                    .with_doc_id("A")
                    .with_metadata(metadata_from([("type", "question")])),
                IngestRequest::new("calculus differentiation rules")
                    .with_doc_id("B")
                    .with_metadata(metadata_from([("type", "material")])),
                IngestRequest::new("French Revolution causes")
                    .with_doc_id("C")
                    .with_metadata(metadata_from([("type", "question")])),
            ])
            .await
            .unwrap();

        Fixture {
            _dir: dir,
            coordinator,
            retriever,
            events,
        }
    }

    #[tokio::test]
    async fn test_validation() {
        let f = fixture(Duration::ZERO).await;
        for query in [
            HybridQuery::new("  "),
            HybridQuery::new("derivative").top_k(0),
            HybridQuery::new("derivative").alpha(1.5),
            HybridQuery::new("derivative").alpha(f32::NAN),
        ] {
            let err = f.retriever.search(query).await.unwrap_err();
            assert!(err.is_validation(), "{}", err);
        }
    }

    #[test]
    fn test_over_fetch_factor_has_a_floor() {
        let settings = Settings {
            over_fetch_factor: 1,
            ..Settings::default()
        };
        let config = RetrieverConfig::from_settings(&settings);
        assert_eq!(config.over_fetch_factor, MIN_OVER_FETCH_FACTOR);
        assert_eq!(config.over_fetch_factor, 3);
    }

    #[tokio::test]
    async fn test_hybrid_ranks_relevant_documents_first() {
        let f = fixture(Duration::ZERO).await;
        let response = f
            .retriever
            .search(HybridQuery::new("derivative rules").top_k(2).alpha(0.5))
            .await
            .unwrap();

        assert!(!response.partial);
        let ids: Vec<&str> = response.results.iter().map(|r| r.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["B", "A"]);
        assert!(response
            .results
            .iter()
            .all(|r| r.lexical_score > 0.0 || r.vector_score > 0.0));
    }

    #[tokio::test]
    async fn test_type_filter() {
        let f = fixture(Duration::ZERO).await;
        let response = f.retriever.search_questions("derivative rules", 5).await.unwrap();
        assert!(response
            .results
            .iter()
            .all(|r| r.metadata["type"] == MetadataValue::from("question")));
        assert!(response.results.iter().any(|r| r.doc_id.as_str() == "A"));

        let response = f.retriever.search_materials("derivative rules", 5).await.unwrap();
        let ids: Vec<&str> = response.results.iter().map(|r| r.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["B"]);
    }

    #[tokio::test]
    async fn test_range_filter_is_post_filtered_for_lexical_side() {
        let f = fixture(Duration::ZERO).await;
        f.coordinator
            .ingest(vec![IngestRequest::new("derivative practice set")
                .with_doc_id("D")
                .with_metadata(metadata_from([("difficulty", 4i64)]))])
            .await
            .unwrap();

        let response = f
            .retriever
            .search(
                HybridQuery::new("derivative")
                    .clause("difficulty>=3".parse().unwrap())
                    .top_k(5),
            )
            .await
            .unwrap();
        let ids: Vec<&str> = response.results.iter().map(|r| r.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["D"]);
    }

    #[tokio::test]
    async fn test_query_cache_invalidated_by_writes() {
        let f = fixture(Duration::from_secs(60)).await;
        let query = HybridQuery::new("French Revolution").top_k(3);

        let first = f.retriever.search(query.clone()).await.unwrap();
        assert!(!first.cached);
        let second = f.retriever.search(query.clone()).await.unwrap();
        assert!(second.cached);
        assert_eq!(first.results, second.results);

        f.coordinator.delete(vec!["C".into()]).await.unwrap();
        let third = f.retriever.search(query).await.unwrap();
        assert!(!third.cached);
        assert!(third.results.iter().all(|r| r.doc_id.as_str() != "C"));

        let events = f.events.events();
        assert_eq!(events.len(), 3);
    }
}
