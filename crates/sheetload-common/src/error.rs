//! Error types shared across sheetload crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, SheetloadError>;

/// Main error type for the common crate
#[derive(Error, Debug)]
pub enum SheetloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Schema file error: {0}")]
    SchemaFile(#[from] toml::de::Error),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Invalid identifier '{0}': must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidIdentifier(String),
}

impl SheetloadError {
    /// Create an invalid schema error
    pub fn invalid_schema(msg: impl Into<String>) -> Self {
        Self::InvalidSchema(msg.into())
    }
}
