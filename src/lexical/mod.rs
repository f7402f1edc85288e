//! Lexical (term-frequency) index store
//!
//! BM25-ranked keyword retrieval over document text. Scores are unbounded and
//! corpus-dependent; the hybrid retriever normalizes them per query before
//! fusion.

mod tantivy_store;

pub use tantivy_store::TantivyLexicalStore;

use async_trait::async_trait;

use crate::document::{DocId, Document, FilterOpKind, Metadata, MetadataFilter};
use crate::error::Result;

/// One lexical match
#[derive(Debug, Clone, PartialEq)]
pub struct LexicalHit {
    pub doc_id: DocId,
    /// Raw BM25 score (>= 0)
    pub score: f32,
    pub metadata: Metadata,
}

/// Lexical index adapter
///
/// Implementations are safe to share across tasks without extra locking.
#[async_trait]
pub trait LexicalIndex: Send + Sync {
    /// Filter operators this store evaluates natively
    fn supports(&self, op: FilterOpKind) -> bool;

    /// Insert or fully replace a document
    async fn add(&self, doc: &Document) -> Result<()>;

    /// Ranked keyword search, best first
    ///
    /// `filter` must only contain operators accepted by [`supports`](Self::supports).
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<LexicalHit>>;

    /// Remove a document; removing an absent id succeeds
    async fn delete(&self, doc_id: &DocId) -> Result<()>;

    async fn get(&self, doc_id: &DocId) -> Result<Option<Document>>;

    async fn count(&self) -> Result<usize>;

    /// Every stored document, ordered by id
    async fn documents(&self) -> Result<Vec<Document>>;
}
