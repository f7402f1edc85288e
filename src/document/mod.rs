//! Document model shared by both index stores
//!
//! A [`Document`] is identified by a [`DocId`] that is generated once at
//! ingestion and reused verbatim by the lexical and the vector store.

mod filter;

pub use filter::{FilterClause, FilterOp, FilterOpKind, MetadataFilter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::constants::TYPE_FIELD;
use crate::error::{Result, StudySearchError};

/// Canonical identifier shared by both stores for one logical document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(String);

impl DocId {
    /// Generate a fresh identifier (UUID v4)
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap a caller-supplied identifier, rejecting blank ones
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(StudySearchError::validation("doc_id must not be empty"));
        }
        if trimmed.len() != raw.len() {
            return Err(StudySearchError::validation(format!(
                "doc_id must not have surrounding whitespace: {:?}",
                raw
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Scalar metadata value
///
/// Untagged so JSON metadata reads naturally: `{"difficulty": 3, "subject": "math"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetadataValue {
    /// Parse a CLI-style literal: integers, floats and booleans are typed,
    /// everything else is text
    pub fn parse_literal(raw: &str) -> Self {
        if let Ok(i) = raw.parse::<i64>() {
            return MetadataValue::Int(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            if f.is_finite() {
                return MetadataValue::Float(f);
            }
        }
        match raw {
            "true" => MetadataValue::Bool(true),
            "false" => MetadataValue::Bool(false),
            _ => MetadataValue::Text(raw.to_string()),
        }
    }

    /// Numeric view, used by range operators
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Int(i) => Some(*i as f64),
            MetadataValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Canonical string form used for term matching
    ///
    /// Integers and integral floats share a form so `3` matches `3.0`.
    pub fn canonical(&self) -> String {
        match self {
            MetadataValue::Bool(b) => b.to_string(),
            MetadataValue::Int(i) => i.to_string(),
            MetadataValue::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => {
                (*f as i64).to_string()
            }
            MetadataValue::Float(f) => f.to_string(),
            MetadataValue::Text(s) => s.to_lowercase(),
        }
    }

    /// Equality with numeric coercion and case-insensitive text
    pub fn loosely_equals(&self, other: &MetadataValue) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => self.canonical() == other.canonical(),
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Bool(b) => write!(f, "{}", b),
            MetadataValue::Int(i) => write!(f, "{}", i),
            MetadataValue::Float(x) => write!(f, "{}", x),
            MetadataValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Text(s.to_string())
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        MetadataValue::Int(i)
    }
}

impl From<f64> for MetadataValue {
    fn from(f: f64) -> Self {
        MetadataValue::Float(f)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

/// Field → scalar mapping (type, subject, difficulty, owner, ...)
pub type Metadata = BTreeMap<String, MetadataValue>;

/// The two document families served by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    Question,
    Material,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Question => "question",
            DocType::Material => "material",
        }
    }

    /// The filter clause selecting this type
    pub fn clause(&self) -> FilterClause {
        FilterClause::new(TYPE_FIELD, FilterOp::Eq(MetadataValue::from(self.as_str())))
    }
}

/// A stored document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocId,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn new(id: DocId, text: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            id,
            text: text.into(),
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// Validate document text: blank text never reaches a store
pub fn validate_text(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(StudySearchError::validation("document text must not be empty"));
    }
    Ok(())
}

/// Validate metadata field names
pub fn validate_metadata(metadata: &Metadata) -> Result<()> {
    for (field, value) in metadata {
        filter::validate_field_name(field)?;
        if let MetadataValue::Float(f) = value {
            if !f.is_finite() {
                return Err(StudySearchError::validation(format!(
                    "metadata field '{}' must be a finite number",
                    field
                )));
            }
        }
    }
    Ok(())
}

/// Build a metadata map from `(field, value)` pairs
pub fn metadata_from<I, K, V>(pairs: I) -> Metadata
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<MetadataValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
