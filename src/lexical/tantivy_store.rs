//! Tantivy-based lexical store
//!
//! BM25 over the `text` field. Metadata is stored as a JSON blob for
//! round-tripping and indexed as `field=value` keyword terms in `meta_terms`,
//! which is what `=`, `!=` and `in` filters are translated to. Range filters
//! are not evaluated here.
//!
//! # Architecture Note
//! The writer is created lazily and lives behind a mutex; every write commits
//! and reloads the reader before returning, so a search issued after an
//! acknowledged write sees it. All engine work runs on the blocking pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tantivy::{
    collector::TopDocs,
    directory::MmapDirectory,
    query::{AllQuery, BooleanQuery, Occur, Query, QueryParser, TermQuery},
    schema::{Field, IndexRecordOption, Schema, Value, STORED, STRING, TEXT},
    Index, IndexReader, IndexSettings, IndexWriter, ReloadPolicy, TantivyDocument, Term,
};

use super::{LexicalHit, LexicalIndex};
use crate::constants::FTS_WRITER_HEAP_BYTES;
use crate::document::{
    DocId, Document, FilterOp, FilterOpKind, Metadata, MetadataFilter, MetadataValue,
};
use crate::error::{Result, StoreKind, StudySearchError};

/// Characters with meaning in tantivy's query grammar
const QUERY_SYNTAX_CHARS: [char; 17] = [
    ':', '(', ')', '[', ']', '{', '}', '^', '"', '~', '*', '?', '\\', '/', '+', '-', '!',
];

const DOC_ID: &str = "doc_id";
const TEXT_FIELD: &str = "text";
const METADATA: &str = "metadata";
const META_TERMS: &str = "meta_terms";
const CREATED_AT: &str = "created_at";

fn engine_error(e: impl std::fmt::Display) -> StudySearchError {
    StudySearchError::transient(StoreKind::Lexical, e.to_string())
}

#[derive(Clone, Copy)]
struct Fields {
    doc_id: Field,
    text: Field,
    metadata: Field,
    meta_terms: Field,
    created_at: Field,
}

impl Fields {
    fn schema() -> Schema {
        let mut builder = Schema::builder();
        // Exact-match key for overwrite and delete
        builder.add_text_field(DOC_ID, STRING | STORED);
        builder.add_text_field(TEXT_FIELD, TEXT | STORED);
        builder.add_text_field(METADATA, STORED);
        builder.add_text_field(META_TERMS, STRING);
        builder.add_text_field(CREATED_AT, STORED);
        builder.build()
    }

    fn resolve(schema: &Schema) -> Result<Self> {
        let field = |name: &str| {
            schema.get_field(name).map_err(|_| {
                StudySearchError::config(format!(
                    "lexical index has an incompatible schema (missing field '{}')",
                    name
                ))
            })
        };
        Ok(Self {
            doc_id: field(DOC_ID)?,
            text: field(TEXT_FIELD)?,
            metadata: field(METADATA)?,
            meta_terms: field(META_TERMS)?,
            created_at: field(CREATED_AT)?,
        })
    }
}

fn metadata_term(field: &str, value: &MetadataValue) -> String {
    format!("{}={}", field, value.canonical())
}

struct Inner {
    index: Index,
    reader: IndexReader,
    writer: Mutex<Option<IndexWriter>>,
    fields: Fields,
}

/// Lexical index backed by tantivy
pub struct TantivyLexicalStore {
    inner: Arc<Inner>,
}

impl TantivyLexicalStore {
    /// Create or open an on-disk index in `fts_path`
    pub fn open(fts_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(fts_path)
            .map_err(|e| StudySearchError::io(fts_path, e.to_string()))?;
        let index = Self::open_or_create_index_with_retry(fts_path)?;
        Self::from_index(index)
    }

    /// Index held entirely in memory (tests, ephemeral use)
    pub fn in_memory() -> Result<Self> {
        Self::from_index(Index::create_in_ram(Fields::schema()))
    }

    fn from_index(index: Index) -> Result<Self> {
        let fields = Fields::resolve(&index.schema())?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(engine_error)?;
        Ok(Self {
            inner: Arc::new(Inner {
                index,
                reader,
                writer: Mutex::new(None),
                fields,
            }),
        })
    }

    /// Open or create the index, retrying on lock contention
    fn open_or_create_index_with_retry(fts_path: &Path) -> Result<Index> {
        let max_retries = 3;
        let mut last_error = String::new();

        for attempt in 0..max_retries {
            if attempt > 0 {
                std::thread::sleep(std::time::Duration::from_millis(100 * (1 << attempt)));
            }

            let result = if fts_path.join("meta.json").exists() {
                Index::open_in_dir(fts_path).map_err(|e| e.to_string())
            } else {
                MmapDirectory::open(fts_path)
                    .map_err(|e| e.to_string())
                    .and_then(|dir| {
                        Index::create(dir, Fields::schema(), IndexSettings::default())
                            .map_err(|e| e.to_string())
                    })
            };

            match result {
                Ok(index) => return Ok(index),
                Err(e) => {
                    tracing::debug!("Lexical index open attempt {} failed: {}", attempt + 1, e);
                    last_error = e;
                }
            }
        }

        Err(engine_error(format!(
            "failed to open lexical index at {} after {} attempts: {}",
            fts_path.display(),
            max_retries,
            last_error
        )))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| engine_error(format!("lexical task failed: {}", e)))?
    }
}

impl Inner {
    /// Apply `op` and commit, recreating the writer once if it was killed
    fn write(&self, op: impl Fn(&mut IndexWriter) -> tantivy::Result<()>) -> Result<()> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| engine_error("lexical writer mutex poisoned"))?;

        for attempt in 0..2 {
            if guard.is_none() {
                *guard = Some(self.index.writer(FTS_WRITER_HEAP_BYTES).map_err(engine_error)?);
            }
            let writer = guard
                .as_mut()
                .ok_or_else(|| engine_error("lexical writer unavailable"))?;

            match op(writer).and_then(|_| writer.commit().map(|_| ())) {
                Ok(()) => return self.reader.reload().map_err(engine_error),
                Err(e) if attempt == 0 && e.to_string().contains("killed") => {
                    tracing::debug!("Lexical writer was killed, recreating: {}", e);
                    *guard = None;
                }
                Err(e) => {
                    if let Err(rollback) = writer.rollback() {
                        tracing::debug!("Lexical rollback after failed write failed: {}", rollback);
                    }
                    return Err(engine_error(e));
                }
            }
        }
        Err(engine_error("lexical writer could not be recovered"))
    }

    fn to_tantivy(&self, doc: &Document) -> Result<TantivyDocument> {
        let f = self.fields;
        let mut tdoc = TantivyDocument::new();
        tdoc.add_text(f.doc_id, doc.id.as_str());
        tdoc.add_text(f.text, &doc.text);
        tdoc.add_text(f.metadata, serde_json::to_string(&doc.metadata)?);
        for (field, value) in &doc.metadata {
            tdoc.add_text(f.meta_terms, metadata_term(field, value));
        }
        tdoc.add_text(f.created_at, doc.created_at.to_rfc3339());
        Ok(tdoc)
    }

    fn from_tantivy(&self, tdoc: &TantivyDocument) -> Result<Document> {
        let f = self.fields;
        let text_of = |field: Field| tdoc.get_first(field).and_then(|v| v.as_str());

        let id = text_of(f.doc_id)
            .ok_or_else(|| StudySearchError::serialization("stored document has no doc_id"))?;
        let metadata: Metadata = match text_of(f.metadata) {
            Some(raw) => serde_json::from_str(raw)?,
            None => Metadata::new(),
        };
        let created_at = text_of(f.created_at)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Document {
            id: DocId::from(id),
            text: text_of(f.text).unwrap_or_default().to_string(),
            metadata,
            created_at,
        })
    }

    fn term_query(&self, field: &str, value: &MetadataValue) -> Box<dyn Query> {
        let term = Term::from_field_text(self.fields.meta_terms, &metadata_term(field, value));
        Box::new(TermQuery::new(term, IndexRecordOption::Basic))
    }

    fn filter_clauses(&self, filter: &MetadataFilter) -> Result<Vec<(Occur, Box<dyn Query>)>> {
        filter
            .clauses()
            .iter()
            .map(|clause| match &clause.op {
                FilterOp::Eq(v) => Ok((Occur::Must, self.term_query(&clause.field, v))),
                FilterOp::Ne(v) => Ok((Occur::MustNot, self.term_query(&clause.field, v))),
                FilterOp::In(values) => {
                    let any: Vec<(Occur, Box<dyn Query>)> = values
                        .iter()
                        .map(|v| (Occur::Should, self.term_query(&clause.field, v)))
                        .collect();
                    Ok((Occur::Must, Box::new(BooleanQuery::new(any)) as Box<dyn Query>))
                }
                _ => Err(StudySearchError::validation(format!(
                    "lexical store cannot evaluate '{}'",
                    clause
                ))),
            })
            .collect()
    }

    /// Free text never fails to parse: dangling operators are read as plain
    /// terms, and text the lenient parser still trips over is retried with
    /// query-syntax characters blanked out
    fn parse_text_query(&self, query: &str) -> Box<dyn Query> {
        let parser = QueryParser::for_index(&self.index, vec![self.fields.text]);
        let (parsed, errors) = parser.parse_query_lenient(query);
        if errors.is_empty() {
            return parsed;
        }
        tracing::debug!("Lenient parse of '{}' reported {:?}", query, errors);

        let plain = query.replace(QUERY_SYNTAX_CHARS, " ");
        let (parsed, errors) = parser.parse_query_lenient(&plain);
        if !errors.is_empty() {
            tracing::debug!("Plain-term parse of '{}' reported {:?}", plain, errors);
        }
        parsed
    }

    fn search(&self, query: &str, top_k: usize, filter: &MetadataFilter) -> Result<Vec<LexicalHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let text_query = self.parse_text_query(query);
        let query: Box<dyn Query> = if filter.is_empty() {
            text_query
        } else {
            let mut clauses = vec![(Occur::Must, text_query)];
            clauses.extend(self.filter_clauses(filter)?);
            Box::new(BooleanQuery::new(clauses))
        };

        let searcher = self.reader.searcher();
        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(top_k))
            .map_err(engine_error)?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let tdoc: TantivyDocument = searcher.doc(address).map_err(engine_error)?;
            let doc = self.from_tantivy(&tdoc)?;
            hits.push(LexicalHit {
                doc_id: doc.id,
                score,
                metadata: doc.metadata,
            });
        }
        Ok(hits)
    }

    fn get(&self, doc_id: &DocId) -> Result<Option<Document>> {
        let term = Term::from_field_text(self.fields.doc_id, doc_id.as_str());
        let query = TermQuery::new(term, IndexRecordOption::Basic);
        let searcher = self.reader.searcher();
        let top = searcher
            .search(&query, &TopDocs::with_limit(1))
            .map_err(engine_error)?;
        match top.first() {
            Some((_, address)) => {
                let tdoc: TantivyDocument = searcher.doc(*address).map_err(engine_error)?;
                Ok(Some(self.from_tantivy(&tdoc)?))
            }
            None => Ok(None),
        }
    }

    fn documents(&self) -> Result<Vec<Document>> {
        let searcher = self.reader.searcher();
        let total = searcher.num_docs() as usize;
        if total == 0 {
            return Ok(Vec::new());
        }
        let top = searcher
            .search(&AllQuery, &TopDocs::with_limit(total))
            .map_err(engine_error)?;
        let mut docs = top
            .into_iter()
            .map(|(_, address)| {
                let tdoc: TantivyDocument = searcher.doc(address).map_err(engine_error)?;
                self.from_tantivy(&tdoc)
            })
            .collect::<Result<Vec<_>>>()?;
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }
}

#[async_trait]
impl LexicalIndex for TantivyLexicalStore {
    fn supports(&self, op: FilterOpKind) -> bool {
        matches!(op, FilterOpKind::Eq | FilterOpKind::Ne | FilterOpKind::In)
    }

    async fn add(&self, doc: &Document) -> Result<()> {
        let doc = doc.clone();
        self.blocking(move |inner| {
            let tdoc = inner.to_tantivy(&doc)?;
            let key = Term::from_field_text(inner.fields.doc_id, doc.id.as_str());
            inner.write(|writer| {
                writer.delete_term(key.clone());
                writer.add_document(tdoc.clone())?;
                Ok(())
            })
        })
        .await
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<LexicalHit>> {
        filter.ensure_supported("lexical", |op| self.supports(op))?;
        let query = query.to_string();
        let filter = filter.clone();
        self.blocking(move |inner| inner.search(&query, top_k, &filter))
            .await
    }

    async fn delete(&self, doc_id: &DocId) -> Result<()> {
        let doc_id = doc_id.clone();
        self.blocking(move |inner| {
            let key = Term::from_field_text(inner.fields.doc_id, doc_id.as_str());
            inner.write(|writer| {
                writer.delete_term(key.clone());
                Ok(())
            })
        })
        .await
    }

    async fn get(&self, doc_id: &DocId) -> Result<Option<Document>> {
        let doc_id = doc_id.clone();
        self.blocking(move |inner| inner.get(&doc_id)).await
    }

    async fn count(&self) -> Result<usize> {
        self.blocking(|inner| Ok(inner.reader.searcher().num_docs() as usize))
            .await
    }

    async fn documents(&self) -> Result<Vec<Document>> {
        self.blocking(|inner| inner.documents()).await
    }
}
