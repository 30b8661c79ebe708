//! Row normalization
//!
//! Turns raw sheet rows into typed records: trims cells, coerces each schema
//! column to its declared type, applies defaults, and resolves the record id.
//! Failures never escape as errors; they are recorded on the returned record
//! as `rejected(<kind>:<detail>)` so the run summary can account for them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sheetload_common::{Column, FieldType, FieldValue, RawRow, Schema, TypedRecord, ValidationState};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// Literals accepted as `true` (case-insensitive)
pub const TRUTHY: &[&str] = &["true", "t", "yes", "y", "1"];

/// Literals accepted as `false` (case-insensitive)
pub const FALSY: &[&str] = &["false", "f", "no", "n", "0"];

/// Hex digits kept from the content digest
const CONTENT_HASH_LEN: usize = 16;

/// How ids are generated for rows without one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    /// `row-<index>`; stable across re-runs of the same sheet
    #[default]
    RowIndex,
    /// `sha-<digest>` of the row's non-id cells; stable under reordering
    ContentHash,
    /// Random v4 UUID; every run produces new ids
    Uuid,
}

impl std::str::FromStr for IdStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "row_index" | "row-index" | "index" => Ok(IdStrategy::RowIndex),
            "content_hash" | "content-hash" | "hash" => Ok(IdStrategy::ContentHash),
            "uuid" => Ok(IdStrategy::Uuid),
            _ => Err(anyhow::anyhow!("Invalid id strategy: {}", s)),
        }
    }
}

impl std::fmt::Display for IdStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IdStrategy::RowIndex => "row_index",
            IdStrategy::ContentHash => "content_hash",
            IdStrategy::Uuid => "uuid",
        };
        f.write_str(s)
    }
}

/// Coerce a trimmed, non-empty cell. `None` means the text is not a value of that type.
pub fn coerce(field_type: FieldType, raw: &str) -> Option<FieldValue> {
    match field_type {
        FieldType::Integer => parse_integer(raw).map(FieldValue::Integer),
        FieldType::Decimal => raw
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(FieldValue::Decimal),
        FieldType::Boolean => parse_bool(raw).map(FieldValue::Boolean),
        FieldType::Text => Some(FieldValue::Text(raw.to_string())),
    }
}

fn parse_integer(raw: &str) -> Option<i64> {
    if let Ok(v) = raw.parse::<i64>() {
        return Some(v);
    }

    // "10.0" from a spreadsheet export is still an integer
    let v = raw.parse::<f64>().ok()?;
    if v.is_finite() && v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64 {
        Some(v as i64)
    } else {
        None
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    let lowered = raw.to_lowercase();
    if TRUTHY.contains(&lowered.as_str()) {
        Some(true)
    } else if FALSY.contains(&lowered.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Coerce one column of a row, applying the column's default for empty cells.
///
/// Returns the rejection reason on failure.
pub fn coerce_cell(column: &Column, raw: Option<&str>) -> Result<FieldValue, String> {
    let raw = raw.map(str::trim).unwrap_or("");

    if raw.is_empty() {
        return match &column.default {
            Some(default) => coerce(column.field_type, default.trim())
                .ok_or_else(|| format!("type_error:{}", column.name)),
            None if column.required => Err(format!("missing_value:{}", column.name)),
            None => Ok(FieldValue::Null),
        };
    }

    coerce(column.field_type, raw).ok_or_else(|| format!("type_error:{}", column.name))
}

/// Normalizer for a single run.
///
/// Owns the run's id bookkeeping: every id handed to a valid record is
/// remembered, so ids stay unique for the lifetime of this value. Create a
/// fresh normalizer per run.
#[derive(Debug)]
pub struct Normalizer {
    schema: Schema,
    strategy: IdStrategy,
    used_ids: HashSet<String>,
    /// Ids supplied by rows of the current extraction
    reserved: HashSet<String>,
    synthesized: usize,
}

impl Normalizer {
    pub fn new(schema: Schema, strategy: IdStrategy) -> Self {
        Self {
            schema,
            strategy,
            used_ids: HashSet::new(),
            reserved: HashSet::new(),
            synthesized: 0,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Number of valid records that received a generated id
    pub fn synthesized_count(&self) -> usize {
        self.synthesized
    }

    /// Normalize one row
    pub fn normalize(&mut self, row: &RawRow) -> TypedRecord {
        let mut fields = BTreeMap::new();
        let mut rejection: Option<String> = None;

        for column in &self.schema.columns {
            let value = match coerce_cell(column, row.get(&column.name)) {
                Ok(value) => value,
                Err(reason) => {
                    rejection.get_or_insert(reason);
                    FieldValue::Null
                }
            };
            fields.insert(column.name.clone(), value);
        }

        let supplied = row
            .get(&self.schema.id_column)
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        let (id, id_synthesized) = match supplied {
            Some(id) => {
                if rejection.is_none() && self.used_ids.contains(&id) {
                    rejection = Some(format!("duplicate_id:{}", id));
                }
                (id, false)
            }
            None => (self.synthesize(row), true),
        };

        let validation = match rejection {
            Some(reason) => ValidationState::Rejected { reason },
            None => {
                self.used_ids.insert(id.clone());
                if id_synthesized {
                    self.synthesized += 1;
                }
                ValidationState::Valid
            }
        };

        TypedRecord {
            row_index: row.row_index,
            id,
            id_synthesized,
            fields,
            validation,
        }
    }

    /// Normalize a whole extraction, preserving order
    ///
    /// Every supplied id is reserved up front, so a generated id never takes
    /// the id a later row brings with it.
    pub fn normalize_all(&mut self, rows: &[RawRow]) -> Vec<TypedRecord> {
        for row in rows {
            if let Some(id) = row.get(&self.schema.id_column).filter(|id| !id.is_empty()) {
                self.reserved.insert(id.to_string());
            }
        }
        rows.iter().map(|row| self.normalize(row)).collect()
    }

    fn is_taken(&self, id: &str) -> bool {
        self.used_ids.contains(id) || self.reserved.contains(id)
    }

    fn synthesize(&self, row: &RawRow) -> String {
        let candidate = match self.strategy {
            IdStrategy::RowIndex => format!("row-{}", row.row_index),
            IdStrategy::ContentHash => self.content_hash(row),
            IdStrategy::Uuid => Uuid::new_v4().to_string(),
        };

        if !self.is_taken(&candidate) {
            return candidate;
        }

        (2..)
            .map(|n| format!("{}-{}", candidate, n))
            .find(|id| !self.is_taken(id))
            .unwrap_or(candidate)
    }

    fn content_hash(&self, row: &RawRow) -> String {
        let mut hasher = Sha256::new();
        for (column, value) in &row.cells {
            if *column == self.schema.id_column {
                continue;
            }
            hasher.update(column.as_bytes());
            hasher.update([0x1f]);
            hasher.update(value.trim().as_bytes());
            hasher.update([0x1e]);
        }
        let digest = hex::encode(hasher.finalize());
        format!("sha-{}", &digest[..CONTENT_HASH_LEN])
    }
}
