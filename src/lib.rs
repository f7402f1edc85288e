//! studysearch: hybrid lexical + semantic retrieval for study questions and
//! materials.
//!
//! Documents are dual-written to a BM25 index ([`lexical`]) and a vector
//! index ([`vectordb`]) by the [`ingest::IngestionCoordinator`]; queries fan
//! out to both through the [`search::HybridRetriever`], which min-max
//! normalizes each score list and fuses them with a tunable weight.

pub mod cli;
pub mod config;
pub mod constants;
pub mod document;
pub mod embed;
pub mod error;
pub mod events;
pub mod index;
pub mod ingest;
pub mod lexical;
pub mod logger;
pub mod output;
pub mod search;
pub mod utils;
pub mod vectordb;

// Re-export commonly used types
pub use config::Settings;
pub use document::{DocId, DocType, Document, FilterClause, FilterOp, Metadata, MetadataFilter, MetadataValue};
pub use embed::{cosine_similarity, Embedder, EmbeddingService, FastEmbedder, HashedEmbedder, ModelType};
pub use error::{Result, StoreKind, StudySearchError};
pub use events::{EventSink, MemoryEventSink, SearchEvent, TracingEventSink};
pub use index::{OpenMode, StudyIndex};
pub use ingest::{
    DeleteOutcome, DeleteStatus, IngestOutcome, IngestRequest, IngestStatus, IngestionCoordinator,
};
pub use lexical::{LexicalHit, LexicalIndex, TantivyLexicalStore};
pub use search::{FusedResult, HybridQuery, HybridRetriever, QueryResponse, RetrieverConfig};
pub use vectordb::{ArroyVectorStore, VectorEntry, VectorHit, VectorIndex, VectorStoreOptions};
