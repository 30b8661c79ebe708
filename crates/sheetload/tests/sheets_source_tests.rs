//! Google Sheets source against a mock values API
//!
//! Uses wiremock to stand in for `sheets.googleapis.com`.

use anyhow::Result;
use serde_json::json;
use sheetload::config::SheetsConfig;
use sheetload::source::{RowSource, SheetsSource, SourceError};
use wiremock::matchers::{header, method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(server: &MockServer) -> SheetsConfig {
    SheetsConfig {
        spreadsheet_id: Some("sheet-1".to_string()),
        range: "Sheet1".to_string(),
        api_key: Some("test-key".to_string()),
        access_token: None,
        credentials_file: None,
        base_url: server.uri(),
        timeout_secs: 5,
    }
}

/// A values response with a header, a short row, a blank row and a numeric cell
fn mock_values_response() -> serde_json::Value {
    json!({
        "range": "Sheet1!A1:Z1000",
        "majorDimension": "ROWS",
        "values": [
            ["id", "name", "amount"],
            ["", "A"],
            [],
            ["x1", "C", 30, "extra"]
        ]
    })
}

#[tokio::test]
async fn test_fetch_rows_maps_header() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v4/spreadsheets/sheet-1/values/Sheet1"))
        .and(query_param("key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(mock_values_response()))
        .expect(1)
        .mount(&server)
        .await;

    let source = SheetsSource::new(&config(&server))?;
    let rows = source.fetch_rows().await?;

    assert_eq!(rows.len(), 2);

    assert_eq!(rows[0].row_index, 0);
    assert_eq!(rows[0].get("id"), Some(""));
    assert_eq!(rows[0].get("name"), Some("A"));
    assert_eq!(rows[0].get("amount"), Some(""));

    // The blank row still consumes index 1
    assert_eq!(rows[1].row_index, 2);
    assert_eq!(rows[1].get("id"), Some("x1"));
    assert_eq!(rows[1].get("amount"), Some("30"));
    assert_eq!(rows[1].cells.len(), 3);

    Ok(())
}

#[tokio::test]
async fn test_access_token_uses_bearer_auth() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path_regex(r"^/v4/spreadsheets/sheet-1/values/.+$"))
        .and(header("authorization", "Bearer secret-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(mock_values_response()))
        .expect(1)
        .mount(&server)
        .await;

    let config = SheetsConfig {
        access_token: Some("secret-token".to_string()),
        range: "Sales Data!A1:C".to_string(),
        ..config(&server)
    };

    let rows = SheetsSource::new(&config)?.fetch_rows().await?;
    assert_eq!(rows.len(), 2);

    Ok(())
}

#[tokio::test]
async fn test_error_status_is_reported() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": {"code": 403, "message": "The caller does not have permission", "status": "PERMISSION_DENIED"}
        })))
        .mount(&server)
        .await;

    let result = SheetsSource::new(&config(&server))?.fetch_rows().await;

    match result {
        Err(SourceError::Status { status, body, .. }) => {
            assert_eq!(status, 403);
            assert!(body.contains("PERMISSION_DENIED"));
        }
        other => panic!("expected a status error, got {:?}", other),
    }

    Ok(())
}

#[tokio::test]
async fn test_malformed_body() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
        .mount(&server)
        .await;

    let result = SheetsSource::new(&config(&server))?.fetch_rows().await;
    assert!(matches!(result, Err(SourceError::Malformed(_))));

    Ok(())
}

#[tokio::test]
async fn test_empty_range_yields_no_rows() -> Result<()> {
    let server = MockServer::start().await;

    // The API omits `values` entirely for an empty range
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "range": "Sheet1!A1:Z1000",
            "majorDimension": "ROWS"
        })))
        .mount(&server)
        .await;

    let rows = SheetsSource::new(&config(&server))?.fetch_rows().await?;
    assert!(rows.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_blank_header_is_rejected() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "values": [["", " "], ["a", "b"]]
        })))
        .mount(&server)
        .await;

    let result = SheetsSource::new(&config(&server))?.fetch_rows().await;
    assert!(matches!(result, Err(SourceError::MissingHeader)));

    Ok(())
}

#[tokio::test]
async fn test_unreachable_server() -> Result<()> {
    let server = MockServer::start().await;
    let config = SheetsConfig {
        base_url: "http://127.0.0.1:1".to_string(),
        ..config(&server)
    };

    let result = SheetsSource::new(&config)?.fetch_rows().await;
    assert!(matches!(result, Err(SourceError::Http { .. })));

    Ok(())
}

#[test]
fn test_missing_credentials() {
    let config = SheetsConfig {
        spreadsheet_id: Some("sheet-1".to_string()),
        range: "Sheet1".to_string(),
        api_key: None,
        access_token: None,
        credentials_file: None,
        base_url: "https://sheets.googleapis.com".to_string(),
        timeout_secs: 5,
    };

    assert!(matches!(SheetsSource::new(&config), Err(SourceError::Config(_))));
}
