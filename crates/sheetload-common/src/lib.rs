//! sheetload common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, schema handling, logging and error types for the sheetload workspace.
//!
//! # Overview
//!
//! - **Types**: raw sheet rows, typed field values and normalized records
//! - **Schema**: the column layout rows are coerced into, loadable from TOML
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` environment variables
//! - **Errors**: the common error and result types
//!
//! # Example
//!
//! ```no_run
//! use sheetload_common::schema::Schema;
//!
//! fn load() -> sheetload_common::Result<Schema> {
//!     let schema = Schema::from_file("schema.toml")?;
//!     schema.validate()?;
//!     Ok(schema)
//! }
//! ```

pub mod error;
pub mod logging;
pub mod schema;
pub mod types;

// Re-export commonly used types
pub use error::{Result, SheetloadError};
pub use schema::{Column, FieldType, Schema};
pub use types::{FieldValue, RawRow, TypedRecord, ValidationState};
