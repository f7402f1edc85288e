//! Centralized error types for studysearch
//!
//! Every engine-specific failure (tantivy, heed, arroy, fastembed) is mapped
//! into this taxonomy at the adapter boundary, with the failing store named.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The two index stores a document lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Lexical,
    Vector,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Lexical => "lexical",
            StoreKind::Vector => "vector",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for studysearch operations
#[derive(Error, Debug)]
pub enum StudySearchError {
    /// Bad input, rejected before any store call. Never retried.
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Timeout, connection or I/O failure of one store. Retried with backoff.
    #[error("Transient {store} store error: {message}")]
    TransientStore { store: StoreKind, message: String },

    /// The embedding model could not be loaded or invoked
    #[error("Embedding model unavailable: {message}")]
    ModelUnavailable { message: String },

    /// Neither store could answer the query
    #[error("Retrieval unavailable: {message}")]
    RetrievalUnavailable { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// I/O operation errors outside the stores
    #[error("I/O error: {path} - {message}")]
    Io { path: PathBuf, message: String },

    /// (De)serialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl StudySearchError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a transient store error
    pub fn transient(store: StoreKind, message: impl Into<String>) -> Self {
        Self::TransientStore {
            store,
            message: message.into(),
        }
    }

    /// Create a model-unavailable error
    pub fn model_unavailable(message: impl Into<String>) -> Self {
        Self::ModelUnavailable {
            message: message.into(),
        }
    }

    /// Create a retrieval-unavailable error
    pub fn retrieval_unavailable(message: impl Into<String>) -> Self {
        Self::RetrievalUnavailable {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Io {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Whether a retry with backoff may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStore { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// The store this error is scoped to, if any
    pub fn store(&self) -> Option<StoreKind> {
        match self {
            Self::TransientStore { store, .. } => Some(*store),
            _ => None,
        }
    }
}

/// Result type alias for studysearch operations
pub type Result<T> = std::result::Result<T, StudySearchError>;

impl From<std::io::Error> for StudySearchError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StudySearchError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<serde_yaml_ng::Error> for StudySearchError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        Self::config(err.to_string())
    }
}
