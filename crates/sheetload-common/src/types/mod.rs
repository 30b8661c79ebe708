//! Row and record types flowing through the pipeline

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One row as read from the source: header name to raw cell text.
///
/// `row_index` is the zero-based position among the source's data rows
/// (the header is not counted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    pub row_index: usize,
    pub cells: BTreeMap<String, String>,
}

impl RawRow {
    pub fn new<K, V>(row_index: usize, cells: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            row_index,
            cells: cells.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Trimmed cell value; `None` when the column is absent.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells.get(column).map(|v| v.trim())
    }

    /// True when every cell is blank
    pub fn is_blank(&self) -> bool {
        self.cells.values().all(|v| v.trim().is_empty())
    }
}

/// A coerced cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
    Text(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Decimal view; integers widen.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Decimal(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Null => f.write_str("null"),
            FieldValue::Integer(v) => write!(f, "{}", v),
            FieldValue::Decimal(v) => write!(f, "{}", v),
            FieldValue::Boolean(v) => write!(f, "{}", v),
            FieldValue::Text(v) => f.write_str(v),
        }
    }
}

/// Whether a record may be loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ValidationState {
    Valid,
    /// `reason` is `<kind>:<detail>`, e.g. `type_error:amount`
    Rejected { reason: String },
}

/// A normalized row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedRecord {
    /// Source position of the row this record came from
    pub row_index: usize,

    /// Upsert key in both sinks
    pub id: String,

    /// The id was generated rather than read from the sheet
    pub id_synthesized: bool,

    /// Coerced values keyed by column name, one entry per schema column
    pub fields: BTreeMap<String, FieldValue>,

    pub validation: ValidationState,
}

impl TypedRecord {
    pub fn is_valid(&self) -> bool {
        matches!(self.validation, ValidationState::Valid)
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        match &self.validation {
            ValidationState::Valid => None,
            ValidationState::Rejected { reason } => Some(reason),
        }
    }

    /// Field value, `Null` for unknown columns
    pub fn field(&self, column: &str) -> &FieldValue {
        self.fields.get(column).unwrap_or(&FieldValue::Null)
    }
}
