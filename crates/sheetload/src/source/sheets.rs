//! Google Sheets values API source

use super::{rows_from_grid, Result, RowSource, SourceError};
use crate::config::SheetsConfig;
use async_trait::async_trait;
use gcp_auth::{CustomServiceAccount, TokenProvider};
use reqwest::{Client, RequestBuilder, Url};
use serde::Deserialize;
use sheetload_common::RawRow;
use std::time::Duration;
use tracing::{debug, info};

/// Longest response body kept in an error message
const MAX_ERROR_BODY: usize = 512;

/// Read-only access to spreadsheets
const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets.readonly";

enum Credentials {
    ApiKey(String),
    Bearer(String),
    /// Tokens are minted from a service-account key and cached until expiry
    ServiceAccount(CustomServiceAccount),
}

impl Credentials {
    fn from_config(config: &SheetsConfig) -> Result<Self> {
        if let Some(token) = &config.access_token {
            return Ok(Credentials::Bearer(token.clone()));
        }
        if let Some(path) = &config.credentials_file {
            let account = CustomServiceAccount::from_file(path).map_err(|e| {
                SourceError::Config(format!("invalid service account key {}: {}", path.display(), e))
            })?;
            return Ok(Credentials::ServiceAccount(account));
        }
        match &config.api_key {
            Some(key) => Ok(Credentials::ApiKey(key.clone())),
            None => Err(SourceError::Config("missing Google credentials".to_string())),
        }
    }

    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        match self {
            Credentials::ApiKey(key) => Ok(request.query(&[("key", key.as_str())])),
            Credentials::Bearer(token) => Ok(request.bearer_auth(token)),
            Credentials::ServiceAccount(account) => {
                let token = account
                    .token(&[SHEETS_SCOPE])
                    .await
                    .map_err(|e| SourceError::Auth(e.to_string()))?;
                Ok(request.bearer_auth(token.as_str()))
            }
        }
    }
}

/// `spreadsheets.values.get` response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValueRange {
    #[serde(default)]
    range: Option<String>,
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

fn cell_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Reads one range of a spreadsheet; the first row is the header
pub struct SheetsSource {
    client: Client,
    base_url: String,
    spreadsheet_id: String,
    range: String,
    credentials: Credentials,
}

impl SheetsSource {
    pub fn new(config: &SheetsConfig) -> Result<Self> {
        let spreadsheet_id = config
            .require_credentials()
            .map_err(|e| SourceError::Config(e.to_string()))?
            .to_string();

        // Access token, then service account, then API key
        let credentials = Credentials::from_config(config)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SourceError::Http {
                url: config.base_url.clone(),
                source: e,
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            spreadsheet_id,
            range: config.range.clone(),
            credentials,
        })
    }

    /// `{base}/v4/spreadsheets/{id}/values/{range}` with each segment escaped
    pub fn values_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| SourceError::Config(format!("invalid Sheets API base URL: {}", e)))?;

        url.path_segments_mut()
            .map_err(|_| SourceError::Config(format!("invalid Sheets API base URL: {}", self.base_url)))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", self.spreadsheet_id.as_str(), "values", self.range.as_str()]);

        Ok(url)
    }
}

#[async_trait]
impl RowSource for SheetsSource {
    async fn fetch_rows(&self) -> Result<Vec<RawRow>> {
        let url = self.values_url()?;
        let display_url = url.to_string();
        debug!(url = %display_url, "Fetching sheet values");

        let request = self.credentials.authorize(self.client.get(url)).await?;

        let response = request.send().await.map_err(|e| SourceError::Http {
            url: display_url.clone(),
            source: e,
        })?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY).rev().find(|i| body.is_char_boundary(*i)).unwrap_or(0);
                body.truncate(cut);
            }
            return Err(SourceError::Status {
                url: display_url,
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await.map_err(|e| SourceError::Http {
            url: display_url.clone(),
            source: e,
        })?;
        let value_range: ValueRange =
            serde_json::from_slice(&bytes).map_err(|e| SourceError::Malformed(e.to_string()))?;

        let mut grid = value_range.values.into_iter();
        let Some(header) = grid.next() else {
            info!(range = %self.range, "Sheet range is empty");
            return Ok(Vec::new());
        };
        let header: Vec<String> = header.into_iter().map(cell_text).collect();
        if header.iter().all(|h| h.trim().is_empty()) {
            return Err(SourceError::MissingHeader);
        }

        let rows = rows_from_grid(&header, grid.map(|row| row.into_iter().map(cell_text)));

        info!(
            range = value_range.range.as_deref().unwrap_or(&self.range),
            rows = rows.len(),
            "Fetched rows from Google Sheets"
        );

        Ok(rows)
    }

    fn describe(&self) -> String {
        format!("Google Sheet {} ({})", self.spreadsheet_id, self.range)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(base_url: &str) -> SheetsConfig {
        SheetsConfig {
            spreadsheet_id: Some("sheet-1".to_string()),
            range: "Sales Data!A1:F".to_string(),
            api_key: Some("k".to_string()),
            access_token: None,
            credentials_file: None,
            base_url: base_url.to_string(),
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_values_url_escapes_range() {
        let source = SheetsSource::new(&config("https://sheets.googleapis.com/")).unwrap();
        let url = source.values_url().unwrap();
        assert_eq!(
            url.as_str(),
            "https://sheets.googleapis.com/v4/spreadsheets/sheet-1/values/Sales%20Data!A1:F"
        );
    }

    #[test]
    fn test_requires_credentials() {
        let mut cfg = config("https://sheets.googleapis.com");
        cfg.api_key = None;
        assert!(matches!(SheetsSource::new(&cfg), Err(SourceError::Config(_))));
    }

    #[test]
    fn test_access_token_wins_over_other_credentials() {
        let mut cfg = config("https://sheets.googleapis.com");
        cfg.access_token = Some("t".to_string());
        cfg.credentials_file = Some("/nonexistent/key.json".into());
        let source = SheetsSource::new(&cfg).unwrap();
        assert!(matches!(source.credentials, Credentials::Bearer(_)));
    }

    #[test]
    fn test_unreadable_service_account_key() {
        let mut cfg = config("https://sheets.googleapis.com");
        cfg.credentials_file = Some("/nonexistent/key.json".into());
        match SheetsSource::new(&cfg) {
            Err(SourceError::Config(message)) => assert!(message.contains("key.json")),
            _ => panic!("expected a config error"),
        }
    }

    #[test]
    fn test_cell_text() {
        assert_eq!(cell_text(serde_json::json!("a")), "a");
        assert_eq!(cell_text(serde_json::json!(12.5)), "12.5");
        assert_eq!(cell_text(serde_json::json!(true)), "true");
        assert_eq!(cell_text(serde_json::Value::Null), "");
    }
}
