//! Column schema for sheet rows
//!
//! A schema names the identifier column and lists the typed columns a row is
//! coerced into. The same schema drives the relational table layout and the
//! document shape, so every name in it must be a plain SQL identifier.
//!
//! Schema files are TOML:
//!
//! ```toml
//! id_column = "id"
//!
//! [[columns]]
//! name = "quantity"
//! type = "decimal"
//! default = "0"
//!
//! [[columns]]
//! name = "product_name"
//! type = "text"
//! required = true
//! ```

use crate::error::{Result, SheetloadError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

#[allow(clippy::unwrap_used)]
static IDENTIFIER: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Columns written alongside the schema columns in both sinks
pub const RESERVED_COLUMNS: &[&str] = &["id_synthesized", "created_at", "updated_at", "inserted_at", "_id"];

/// True when `name` can be interpolated into SQL unquoted
pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Reject anything that is not a plain identifier
pub fn check_identifier(name: &str) -> Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(SheetloadError::InvalidIdentifier(name.to_string()))
    }
}

/// Declared column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Integer,
    Decimal,
    Boolean,
    Text,
}

impl FieldType {
    /// PostgreSQL column type
    pub fn sql_type(self) -> &'static str {
        match self {
            FieldType::Integer => "BIGINT",
            FieldType::Decimal => "DOUBLE PRECISION",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Text => "TEXT",
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FieldType::Integer => "integer",
            FieldType::Decimal => "decimal",
            FieldType::Boolean => "boolean",
            FieldType::Text => "text",
        };
        f.write_str(s)
    }
}

/// A typed column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,

    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// An empty cell rejects the row unless a default is set
    #[serde(default)]
    pub required: bool,

    /// Raw value used for empty cells, coerced like any cell
    #[serde(default)]
    pub default: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// Column layout for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default = "default_id_column")]
    pub id_column: String,
    pub columns: Vec<Column>,
}

fn default_id_column() -> String {
    "id".to_string()
}

impl Schema {
    pub fn new(id_column: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            id_column: id_column.into(),
            columns,
        }
    }

    /// The `sales_data` sheet layout
    pub fn sales() -> Self {
        Self::new(
            "id",
            vec![
                Column::new("quantity", FieldType::Decimal).with_default("0"),
                Column::new("product_name", FieldType::Text).with_default("Unknown"),
                Column::new("total_amount", FieldType::Decimal).with_default("0"),
                Column::new("payment_method", FieldType::Text).with_default("Unknown"),
                Column::new("customer_type", FieldType::Text).with_default("Unknown"),
            ],
        )
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let schema: Schema = toml::from_str(s)?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Check names are usable in both sinks
    pub fn validate(&self) -> Result<()> {
        check_identifier(&self.id_column)?;

        if self.columns.is_empty() {
            return Err(SheetloadError::invalid_schema("schema has no columns"));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            check_identifier(&column.name)?;

            if column.name == self.id_column {
                return Err(SheetloadError::invalid_schema(format!(
                    "column '{}' duplicates the id column",
                    column.name
                )));
            }
            if RESERVED_COLUMNS.contains(&column.name.as_str()) {
                return Err(SheetloadError::invalid_schema(format!(
                    "column name '{}' is reserved",
                    column.name
                )));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(SheetloadError::invalid_schema(format!(
                    "duplicate column '{}'",
                    column.name
                )));
            }
        }

        Ok(())
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::sales()
    }
}
