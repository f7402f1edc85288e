//! Dense-vector index store
//!
//! Approximate nearest-neighbor search over embeddings with a metadata copy
//! per entry, so every filter operator can be evaluated next to the vectors.

mod store;

pub use store::{ArroyVectorStore, VectorStoreOptions};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::document::{DocId, FilterOpKind, Metadata, MetadataFilter};
use crate::error::Result;

/// What the vector store keeps per document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    pub doc_id: DocId,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// One vector match
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub doc_id: DocId,
    /// Cosine similarity in [-1, 1]
    pub similarity: f32,
    pub metadata: Metadata,
}

/// Vector index adapter
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn supports(&self, op: FilterOpKind) -> bool;

    /// Vector size this store accepts
    fn dimensions(&self) -> usize;

    /// Insert or fully replace the entry for `doc_id`
    async fn add(&self, doc_id: &DocId, embedding: &[f32], metadata: &Metadata) -> Result<()>;

    /// Most similar entries first
    async fn search(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<VectorHit>>;

    /// Remove an entry; removing an absent id succeeds
    async fn delete(&self, doc_id: &DocId) -> Result<()>;

    async fn get(&self, doc_id: &DocId) -> Result<Option<VectorEntry>>;

    async fn count(&self) -> Result<usize>;

    /// Drop every entry (used before a full reindex)
    async fn clear(&self) -> Result<()>;
}
