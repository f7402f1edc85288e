//! Typed metadata filters
//!
//! A filter is a conjunction of `(field, operator, value)` clauses. Each store
//! adapter declares which operators it can evaluate natively; clauses it
//! cannot are either rejected at translation time or kept back for the
//! retriever's post-filter.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{Metadata, MetadataValue};
use crate::error::{Result, StudySearchError};

/// Operator of a filter clause, carrying its operand(s)
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    Eq(MetadataValue),
    Ne(MetadataValue),
    In(Vec<MetadataValue>),
    Gt(MetadataValue),
    Gte(MetadataValue),
    Lt(MetadataValue),
    Lte(MetadataValue),
}

/// Operator without operand, used for capability checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOpKind {
    Eq,
    Ne,
    In,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl FilterOpKind {
    pub fn symbol(&self) -> &'static str {
        match self {
            FilterOpKind::Eq => "=",
            FilterOpKind::Ne => "!=",
            FilterOpKind::In => "in",
            FilterOpKind::Gt => ">",
            FilterOpKind::Gte => ">=",
            FilterOpKind::Lt => "<",
            FilterOpKind::Lte => "<=",
        }
    }

    pub fn is_range(&self) -> bool {
        matches!(
            self,
            FilterOpKind::Gt | FilterOpKind::Gte | FilterOpKind::Lt | FilterOpKind::Lte
        )
    }
}

impl FilterOp {
    pub fn kind(&self) -> FilterOpKind {
        match self {
            FilterOp::Eq(_) => FilterOpKind::Eq,
            FilterOp::Ne(_) => FilterOpKind::Ne,
            FilterOp::In(_) => FilterOpKind::In,
            FilterOp::Gt(_) => FilterOpKind::Gt,
            FilterOp::Gte(_) => FilterOpKind::Gte,
            FilterOp::Lt(_) => FilterOpKind::Lt,
            FilterOp::Lte(_) => FilterOpKind::Lte,
        }
    }
}

/// One `(field, operator, value)` condition
///
/// Serialized as `{"field": "difficulty", "op": "gte", "value": 2}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawClause", into = "RawClause")]
pub struct FilterClause {
    pub field: String,
    pub op: FilterOp,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawOperand {
    Many(Vec<MetadataValue>),
    One(MetadataValue),
}

#[derive(Serialize, Deserialize)]
struct RawClause {
    field: String,
    op: FilterOpKind,
    value: RawOperand,
}

impl TryFrom<RawClause> for FilterClause {
    type Error = StudySearchError;

    fn try_from(raw: RawClause) -> Result<Self> {
        let op = match (raw.op, raw.value) {
            (FilterOpKind::In, RawOperand::Many(values)) => FilterOp::In(values),
            (FilterOpKind::In, RawOperand::One(value)) => FilterOp::In(vec![value]),
            (kind, RawOperand::Many(_)) => {
                return Err(StudySearchError::validation(format!(
                    "filter on '{}': '{}' takes a single value",
                    raw.field,
                    kind.symbol()
                )))
            }
            (FilterOpKind::Eq, RawOperand::One(v)) => FilterOp::Eq(v),
            (FilterOpKind::Ne, RawOperand::One(v)) => FilterOp::Ne(v),
            (FilterOpKind::Gt, RawOperand::One(v)) => FilterOp::Gt(v),
            (FilterOpKind::Gte, RawOperand::One(v)) => FilterOp::Gte(v),
            (FilterOpKind::Lt, RawOperand::One(v)) => FilterOp::Lt(v),
            (FilterOpKind::Lte, RawOperand::One(v)) => FilterOp::Lte(v),
        };
        let clause = FilterClause::new(raw.field, op);
        clause.validate()?;
        Ok(clause)
    }
}

impl From<FilterClause> for RawClause {
    fn from(clause: FilterClause) -> Self {
        let op = clause.op.kind();
        let value = match clause.op {
            FilterOp::In(values) => RawOperand::Many(values),
            FilterOp::Eq(v)
            | FilterOp::Ne(v)
            | FilterOp::Gt(v)
            | FilterOp::Gte(v)
            | FilterOp::Lt(v)
            | FilterOp::Lte(v) => RawOperand::One(v),
        };
        RawClause {
            field: clause.field,
            op,
            value,
        }
    }
}

impl FilterClause {
    pub fn new(field: impl Into<String>, op: FilterOp) -> Self {
        Self {
            field: field.into(),
            op,
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Self::new(field, FilterOp::Eq(value.into()))
    }

    /// Reject clauses that can never be evaluated meaningfully
    pub fn validate(&self) -> Result<()> {
        validate_field_name(&self.field)?;
        match &self.op {
            FilterOp::In(values) if values.is_empty() => Err(StudySearchError::validation(
                format!("filter on '{}': 'in' needs at least one value", self.field),
            )),
            FilterOp::Gt(v) | FilterOp::Gte(v) | FilterOp::Lt(v) | FilterOp::Lte(v) => {
                match v.as_f64() {
                    Some(f) if f.is_finite() => Ok(()),
                    _ => Err(StudySearchError::validation(format!(
                        "filter on '{}': '{}' needs a numeric value, got '{}'",
                        self.field,
                        self.op.kind().symbol(),
                        v
                    ))),
                }
            }
            _ => Ok(()),
        }
    }

    /// Evaluate against a document's metadata
    ///
    /// A missing field fails every operator except `!=`.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        let actual = metadata.get(&self.field);
        match (&self.op, actual) {
            (FilterOp::Ne(expected), Some(v)) => !v.loosely_equals(expected),
            (FilterOp::Ne(_), None) => true,
            (_, None) => false,
            (FilterOp::Eq(expected), Some(v)) => v.loosely_equals(expected),
            (FilterOp::In(values), Some(v)) => values.iter().any(|e| v.loosely_equals(e)),
            (FilterOp::Gt(bound), Some(v)) => compare(v, bound, |a, b| a > b),
            (FilterOp::Gte(bound), Some(v)) => compare(v, bound, |a, b| a >= b),
            (FilterOp::Lt(bound), Some(v)) => compare(v, bound, |a, b| a < b),
            (FilterOp::Lte(bound), Some(v)) => compare(v, bound, |a, b| a <= b),
        }
    }
}

fn compare(actual: &MetadataValue, bound: &MetadataValue, cmp: fn(f64, f64) -> bool) -> bool {
    match (actual.as_f64(), bound.as_f64()) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

impl fmt::Display for FilterClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            FilterOp::In(values) => {
                let joined: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "{}={}", self.field, joined.join("|"))
            }
            FilterOp::Eq(v)
            | FilterOp::Ne(v)
            | FilterOp::Gt(v)
            | FilterOp::Gte(v)
            | FilterOp::Lt(v)
            | FilterOp::Lte(v) => write!(f, "{}{}{}", self.field, self.op.kind().symbol(), v),
        }
    }
}

impl FromStr for FilterClause {
    type Err = StudySearchError;

    /// Parse `field<op>value` where op is one of `!= >= <= = > <`;
    /// `field=a|b` is an `in` clause
    fn from_str(s: &str) -> Result<Self> {
        // Two-character operators first so ">=" is not read as ">"
        const OPERATORS: [&str; 6] = ["!=", ">=", "<=", "=", ">", "<"];

        let (pos, symbol) = OPERATORS
            .iter()
            .filter_map(|op| s.find(op).map(|pos| (pos, *op)))
            .min_by_key(|(pos, op)| (*pos, std::cmp::Reverse(op.len())))
            .ok_or_else(|| {
                StudySearchError::validation(format!(
                    "filter '{}' has no operator (expected one of != >= <= = > <)",
                    s
                ))
            })?;

        let field = s[..pos].trim();
        let raw_value = s[pos + symbol.len()..].trim();
        if raw_value.is_empty() {
            return Err(StudySearchError::validation(format!(
                "filter '{}' has no value",
                s
            )));
        }

        let value = MetadataValue::parse_literal(raw_value);
        let op = match symbol {
            "=" if raw_value.contains('|') => FilterOp::In(
                raw_value
                    .split('|')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(MetadataValue::parse_literal)
                    .collect(),
            ),
            "=" => FilterOp::Eq(value),
            "!=" => FilterOp::Ne(value),
            ">" => FilterOp::Gt(value),
            ">=" => FilterOp::Gte(value),
            "<" => FilterOp::Lt(value),
            _ => FilterOp::Lte(value),
        };

        let clause = FilterClause::new(field, op);
        clause.validate()?;
        Ok(clause)
    }
}

/// Conjunction of filter clauses
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataFilter {
    clauses: Vec<FilterClause>,
}

impl MetadataFilter {
    pub fn new(clauses: Vec<FilterClause>) -> Self {
        Self { clauses }
    }

    /// Add a clause (builder style)
    pub fn and(mut self, clause: FilterClause) -> Self {
        self.clauses.push(clause);
        self
    }

    pub fn push(&mut self, clause: FilterClause) {
        self.clauses.push(clause);
    }

    pub fn clauses(&self) -> &[FilterClause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        self.clauses.iter().try_for_each(FilterClause::validate)
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.clauses.iter().all(|c| c.matches(metadata))
    }

    /// Split into (clauses `supported` accepts, the rest)
    pub fn partition(&self, supported: impl Fn(FilterOpKind) -> bool) -> (Self, Self) {
        let (native, residual): (Vec<_>, Vec<_>) = self
            .clauses
            .iter()
            .cloned()
            .partition(|c| supported(c.op.kind()));
        (Self::new(native), Self::new(residual))
    }

    /// Fail fast when an adapter is handed an operator it cannot evaluate
    pub fn ensure_supported(
        &self,
        store: &str,
        supported: impl Fn(FilterOpKind) -> bool,
    ) -> Result<()> {
        match self.clauses.iter().find(|c| !supported(c.op.kind())) {
            Some(clause) => Err(StudySearchError::validation(format!(
                "{} store cannot evaluate operator '{}' (clause '{}')",
                store,
                clause.op.kind().symbol(),
                clause
            ))),
            None => Ok(()),
        }
    }

    /// Stable key fragment for caches
    pub fn cache_key(&self) -> String {
        let mut parts: Vec<String> = self.clauses.iter().map(|c| c.to_string()).collect();
        parts.sort();
        parts.join("&")
    }
}

impl FromIterator<FilterClause> for MetadataFilter {
    fn from_iter<T: IntoIterator<Item = FilterClause>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Field names are restricted so they can be embedded in index terms
pub(crate) fn validate_field_name(field: &str) -> Result<()> {
    let valid = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(StudySearchError::validation(format!(
            "invalid metadata field name '{}' (use letters, digits, '_', '-', '.')",
            field
        )))
    }
}
