//! Local CSV file source

use super::{rows_from_grid, Result, RowSource, SourceError};
use async_trait::async_trait;
use sheetload_common::RawRow;
use std::path::{Path, PathBuf};
use tracing::info;

/// Reads a CSV export of the sheet; the first record is the header
#[derive(Debug, Clone)]
pub struct CsvSource {
    path: PathBuf,
}

impl CsvSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(path: &Path) -> Result<Vec<RawRow>> {
        let file = std::fs::File::open(path).map_err(|e| SourceError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let mut reader = ::csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);

        let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        if header.iter().all(|h| h.trim().is_empty()) {
            return Err(SourceError::MissingHeader);
        }

        let records = reader
            .records()
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows_from_grid(
            &header,
            records.iter().map(|r| r.iter().map(str::to_string).collect::<Vec<_>>()),
        ))
    }
}

#[async_trait]
impl RowSource for CsvSource {
    async fn fetch_rows(&self) -> Result<Vec<RawRow>> {
        let path = self.path.clone();
        let rows = tokio::task::spawn_blocking(move || Self::read(&path))
            .await
            .map_err(|e| SourceError::Malformed(format!("CSV reader task failed: {}", e)))??;

        info!(path = %self.path.display(), rows = rows.len(), "Read rows from CSV");
        Ok(rows)
    }

    fn describe(&self) -> String {
        format!("CSV file {}", self.path.display())
    }
}
