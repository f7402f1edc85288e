//! Structured events for an external observability layer
//!
//! The coordinator and retriever report ingestion outcomes and query
//! latency/degradation through an [`EventSink`]. The default sink writes
//! `tracing` events under the `studysearch::events` target so they can be
//! routed separately from diagnostic logs.

use serde::Serialize;
use std::sync::Mutex;

use crate::document::DocId;
use crate::error::StoreKind;
use crate::ingest::{DeleteStatus, IngestStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SearchEvent {
    DocumentIngested {
        doc_id: DocId,
        status: IngestStatus,
        failed_stores: Vec<StoreKind>,
        elapsed_ms: u64,
    },
    DocumentDeleted {
        doc_id: DocId,
        status: DeleteStatus,
        /// Stores that may still hold the document
        remaining: Vec<StoreKind>,
    },
    QueryCompleted {
        took_ms: u64,
        results: usize,
        partial: bool,
        degraded: Vec<StoreKind>,
        cached: bool,
    },
    QueryFailed {
        took_ms: u64,
        message: String,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &SearchEvent);
}

/// Emits every event as a `tracing` record
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &SearchEvent) {
        match event {
            SearchEvent::DocumentIngested {
                doc_id,
                status,
                failed_stores,
                elapsed_ms,
            } => {
                tracing::info!(
                    target: "studysearch::events",
                    doc_id = %doc_id,
                    status = status.as_str(),
                    failed_stores = ?failed_stores,
                    elapsed_ms,
                    "document ingested"
                );
            }
            SearchEvent::DocumentDeleted {
                doc_id,
                status,
                remaining,
            } => {
                tracing::info!(
                    target: "studysearch::events",
                    doc_id = %doc_id,
                    status = status.as_str(),
                    remaining = ?remaining,
                    "document deleted"
                );
            }
            SearchEvent::QueryCompleted {
                took_ms,
                results,
                partial,
                degraded,
                cached,
            } => {
                tracing::info!(
                    target: "studysearch::events",
                    took_ms,
                    results,
                    partial,
                    degraded = ?degraded,
                    cached,
                    "query completed"
                );
            }
            SearchEvent::QueryFailed { took_ms, message } => {
                tracing::warn!(
                    target: "studysearch::events",
                    took_ms,
                    message = %message,
                    "query failed"
                );
            }
        }
    }
}

/// Keeps events in memory; handy for tests and embedding applications
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<SearchEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SearchEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &SearchEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}
