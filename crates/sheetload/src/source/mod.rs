//! Row sources
//!
//! A source yields every data row of a sheet, header-mapped. Any failure is
//! fatal for the run, so sources report a single error type.

pub mod csv;
pub mod sheets;

use async_trait::async_trait;
use sheetload_common::RawRow;
use thiserror::Error;

pub use self::csv::CsvSource;
pub use self::sheets::SheetsSource;

/// The source could not be read
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Sheets API returned {status} for {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid CSV: {0}")]
    Csv(#[from] ::csv::Error),

    #[error("Source has no header row")]
    MissingHeader,

    #[error("Source configuration: {0}")]
    Config(String),

    #[error("Google authentication failed: {0}")]
    Auth(String),
}

pub type Result<T> = std::result::Result<T, SourceError>;

/// Where rows come from
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Read every data row
    async fn fetch_rows(&self) -> Result<Vec<RawRow>>;

    /// Short label for logs
    fn describe(&self) -> String;
}

/// Map a header row and data rows to [`RawRow`]s.
///
/// Header cells are trimmed. Short rows are padded with empty cells and
/// extra cells beyond the header are dropped. Blank rows are skipped but
/// still consume a row index, so indexes track source positions.
pub fn rows_from_grid<I, R, S>(header: &[String], rows: I) -> Vec<RawRow>
where
    I: IntoIterator<Item = R>,
    R: IntoIterator<Item = S>,
    S: Into<String>,
{
    let header: Vec<String> = header.iter().map(|h| h.trim().to_string()).collect();

    rows.into_iter()
        .enumerate()
        .filter_map(|(row_index, cells)| {
            let mut values: Vec<String> = cells.into_iter().map(Into::into).collect();
            values.resize(header.len(), String::new());

            let row = RawRow::new(
                row_index,
                header
                    .iter()
                    .zip(values)
                    .filter(|(name, _)| !name.is_empty())
                    .map(|(name, value)| (name.clone(), value)),
            );

            if row.is_blank() {
                None
            } else {
                Some(row)
            }
        })
        .collect()
}

/// Source used for tests and dry runs over rows already in memory
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    rows: Vec<RawRow>,
}

impl StaticSource {
    pub fn new(rows: Vec<RawRow>) -> Self {
        Self { rows }
    }
}

#[async_trait]
impl RowSource for StaticSource {
    async fn fetch_rows(&self) -> Result<Vec<RawRow>> {
        Ok(self.rows.clone())
    }

    fn describe(&self) -> String {
        format!("{} in-memory rows", self.rows.len())
    }
}
