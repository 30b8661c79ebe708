//! CSV source tests

use anyhow::Result;
use sheetload::source::{CsvSource, RowSource, SourceError};
use std::io::Write;
use tempfile::NamedTempFile;

fn csv_file(contents: &str) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

#[tokio::test]
async fn test_reads_rows_with_header() -> Result<()> {
    let file = csv_file("id, name ,amount\n,A,10\n,,\nx1,C,30\n")?;
    let rows = CsvSource::new(file.path()).fetch_rows().await?;

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].row_index, 0);
    assert_eq!(rows[0].get("name"), Some("A"));
    assert_eq!(rows[0].get("id"), Some(""));

    // The all-empty record keeps its index
    assert_eq!(rows[1].row_index, 2);
    assert_eq!(rows[1].get("id"), Some("x1"));
    assert_eq!(rows[1].get("amount"), Some("30"));

    Ok(())
}

#[tokio::test]
async fn test_ragged_rows() -> Result<()> {
    let file = csv_file("id,name,amount\nr1,short\nr2,long,5,ignored\n")?;
    let rows = CsvSource::new(file.path()).fetch_rows().await?;

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("amount"), Some(""));
    assert_eq!(rows[1].get("amount"), Some("5"));
    assert_eq!(rows[1].cells.len(), 3);

    Ok(())
}

#[tokio::test]
async fn test_quoted_cells() -> Result<()> {
    let file = csv_file("id,name,amount\nr1,\"Smith, J\",\"1,5\"\n")?;
    let rows = CsvSource::new(file.path()).fetch_rows().await?;

    assert_eq!(rows[0].get("name"), Some("Smith, J"));
    assert_eq!(rows[0].get("amount"), Some("1,5"));

    Ok(())
}

#[tokio::test]
async fn test_header_only_file_has_no_rows() -> Result<()> {
    let file = csv_file("id,name,amount\n")?;
    let rows = CsvSource::new(file.path()).fetch_rows().await?;
    assert!(rows.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_missing_file() {
    let source = CsvSource::new("/nonexistent/sheetload/sales.csv");
    let result = source.fetch_rows().await;
    assert!(matches!(result, Err(SourceError::Io { .. })));
    assert!(source.describe().contains("sales.csv"));
}

#[tokio::test]
async fn test_empty_file_has_no_header() -> Result<()> {
    let file = csv_file("")?;
    let result = CsvSource::new(file.path()).fetch_rows().await;
    assert!(matches!(result, Err(SourceError::MissingHeader)));
    Ok(())
}
