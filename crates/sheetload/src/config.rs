//! Configuration management

use crate::normalizer::{coerce, IdStrategy};
use crate::retry::RetryPolicy;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use sheetload_common::schema::check_identifier;
use sheetload_common::Schema;
use sqlx::postgres::PgConnectOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Source Constants
// ============================================================================

/// Default A1 range read from the spreadsheet.
pub const DEFAULT_SHEET_RANGE: &str = "Sheet1";

/// Default Sheets API endpoint.
pub const DEFAULT_SHEETS_API_BASE_URL: &str = "https://sheets.googleapis.com";

/// Default timeout for a single Sheets API request in seconds.
pub const DEFAULT_SHEETS_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Database Constants
// ============================================================================

/// Default PostgreSQL host when `DATABASE_URL` is not set.
pub const DEFAULT_POSTGRES_HOST: &str = "localhost";

/// Default PostgreSQL port.
pub const DEFAULT_POSTGRES_PORT: u16 = 5432;

/// Default PostgreSQL database name.
pub const DEFAULT_POSTGRES_DATABASE: &str = "postgres";

/// Default PostgreSQL user.
pub const DEFAULT_POSTGRES_USER: &str = "postgres";

/// Default target table.
pub const DEFAULT_POSTGRES_TABLE: &str = "sales_data";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// PostgreSQL limit on bind parameters in one statement.
pub const POSTGRES_MAX_BIND_PARAMS: usize = 65_535;

/// Default MongoDB connection string.
pub const DEFAULT_MONGODB_URI: &str = "mongodb://localhost:27017";

/// Default MongoDB database.
pub const DEFAULT_MONGODB_DATABASE: &str = "sheetload";

/// Default MongoDB collection.
pub const DEFAULT_MONGODB_COLLECTION: &str = "sales_data";

// ============================================================================
// Load Constants
// ============================================================================

/// Default number of records per batch.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default retries after the first attempt of a sink operation.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default first retry delay in milliseconds; doubles per attempt.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 500;

/// Default cap on a single retry delay in milliseconds.
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Default timeout for one sink attempt in seconds.
pub const DEFAULT_SINK_TIMEOUT_SECS: u64 = 60;

/// Default number of document upserts in flight per batch.
pub const DEFAULT_DOCUMENT_CONCURRENCY: usize = 16;

/// Full ETL configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub sheets: SheetsConfig,
    pub postgres: PostgresConfig,
    pub mongo: MongoConfig,
    pub load: LoadConfig,
    pub schema: Schema,
}

/// Google Sheets source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetsConfig {
    pub spreadsheet_id: Option<String>,
    pub range: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    /// Service-account key file
    pub credentials_file: Option<PathBuf>,
    pub base_url: String,
    pub timeout_secs: u64,
}

/// PostgreSQL sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Full connection URL; wins over the individual parts
    #[serde(skip_serializing)]
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub table: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

/// MongoDB sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoConfig {
    #[serde(skip_serializing)]
    pub uri: String,
    pub database: String,
    pub collection: String,
}

/// Batching, retry and timeout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub sink_timeout_secs: u64,
    pub run_timeout_secs: Option<u64>,
    pub document_concurrency: usize,
    pub id_strategy: IdStrategy,
}

impl SheetsConfig {
    /// Ensure the sheet can actually be read
    pub fn require_credentials(&self) -> anyhow::Result<&str> {
        let id = self
            .spreadsheet_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .context("SPREADSHEET_ID must be set to read from Google Sheets")?;

        if self.api_key.is_none() && self.access_token.is_none() && self.credentials_file.is_none() {
            anyhow::bail!(
                "Set GOOGLE_ACCESS_TOKEN, GOOGLE_CREDENTIALS_FILE or GOOGLE_API_KEY to read from Google Sheets"
            );
        }

        Ok(id)
    }
}

impl PostgresConfig {
    /// Connection options for the pool
    pub fn connect_options(&self) -> anyhow::Result<PgConnectOptions> {
        if let Some(url) = &self.url {
            return PgConnectOptions::from_str(url).context("Invalid DATABASE_URL");
        }

        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user);
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        Ok(options)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl LoadConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_secs(self.sink_timeout_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

fn var<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(lookup, key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: '{}' ({})", key, raw, e)),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from `.env`, the environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let schema = match var(&lookup, "ETL_SCHEMA_FILE") {
            Some(path) => Schema::from_file(&path)
                .with_context(|| format!("Failed to load schema file {}", path))?,
            None => Schema::sales(),
        };

        let config = Config {
            sheets: SheetsConfig {
                spreadsheet_id: var(&lookup, "SPREADSHEET_ID"),
                range: var(&lookup, "SHEET_RANGE").unwrap_or_else(|| DEFAULT_SHEET_RANGE.to_string()),
                api_key: var(&lookup, "GOOGLE_API_KEY"),
                access_token: var(&lookup, "GOOGLE_ACCESS_TOKEN"),
                credentials_file: var(&lookup, "GOOGLE_CREDENTIALS_FILE").map(PathBuf::from),
                base_url: var(&lookup, "SHEETS_API_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_SHEETS_API_BASE_URL.to_string()),
                timeout_secs: parse_var(&lookup, "SHEETS_TIMEOUT_SECS", DEFAULT_SHEETS_TIMEOUT_SECS)?,
            },
            postgres: PostgresConfig {
                url: var(&lookup, "DATABASE_URL"),
                host: var(&lookup, "POSTGRES_HOST").unwrap_or_else(|| DEFAULT_POSTGRES_HOST.to_string()),
                port: parse_var(&lookup, "POSTGRES_PORT", DEFAULT_POSTGRES_PORT)?,
                database: var(&lookup, "POSTGRES_DATABASE")
                    .unwrap_or_else(|| DEFAULT_POSTGRES_DATABASE.to_string()),
                user: var(&lookup, "POSTGRES_USER").unwrap_or_else(|| DEFAULT_POSTGRES_USER.to_string()),
                password: var(&lookup, "POSTGRES_PASSWORD"),
                table: var(&lookup, "POSTGRES_TABLE").unwrap_or_else(|| DEFAULT_POSTGRES_TABLE.to_string()),
                max_connections: parse_var(
                    &lookup,
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                )?,
                connect_timeout_secs: parse_var(
                    &lookup,
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                )?,
            },
            mongo: MongoConfig {
                uri: var(&lookup, "MONGODB_URI").unwrap_or_else(|| DEFAULT_MONGODB_URI.to_string()),
                database: var(&lookup, "MONGODB_DATABASE")
                    .unwrap_or_else(|| DEFAULT_MONGODB_DATABASE.to_string()),
                collection: var(&lookup, "MONGODB_COLLECTION")
                    .unwrap_or_else(|| DEFAULT_MONGODB_COLLECTION.to_string()),
            },
            load: LoadConfig {
                batch_size: parse_var(&lookup, "ETL_BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
                max_retries: parse_var(&lookup, "ETL_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
                backoff_base_ms: parse_var(&lookup, "ETL_BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS)?,
                backoff_max_ms: parse_var(&lookup, "ETL_BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS)?,
                sink_timeout_secs: parse_var(&lookup, "ETL_SINK_TIMEOUT_SECS", DEFAULT_SINK_TIMEOUT_SECS)?,
                run_timeout_secs: match var(&lookup, "ETL_RUN_TIMEOUT_SECS") {
                    Some(_) => Some(parse_var(&lookup, "ETL_RUN_TIMEOUT_SECS", 0)?),
                    None => None,
                },
                document_concurrency: parse_var(
                    &lookup,
                    "ETL_DOCUMENT_CONCURRENCY",
                    DEFAULT_DOCUMENT_CONCURRENCY,
                )?,
                id_strategy: parse_var(&lookup, "ETL_ID_STRATEGY", IdStrategy::default())?,
            },
            schema,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.schema.validate()?;

        // Defaults are coerced like cells, so a bad one would reject every empty cell
        for column in &self.schema.columns {
            if let Some(default) = &column.default {
                if coerce(column.field_type, default.trim()).is_none() {
                    anyhow::bail!(
                        "Default '{}' for column '{}' is not a valid {}",
                        default,
                        column.name,
                        column.field_type
                    );
                }
            }
        }

        check_identifier(&self.postgres.table).context("Invalid POSTGRES_TABLE")?;

        if self.postgres.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.mongo.database.is_empty() || self.mongo.database.contains(['/', '\\', '.', ' ', '"', '$']) {
            anyhow::bail!("Invalid MongoDB database name: '{}'", self.mongo.database);
        }

        if self.mongo.collection.contains('$') || self.mongo.collection.starts_with("system.") {
            anyhow::bail!("Invalid MongoDB collection name: '{}'", self.mongo.collection);
        }

        if self.load.batch_size == 0 {
            anyhow::bail!("Batch size must be greater than 0");
        }

        // Every row binds the id, the id_synthesized flag and one value per column
        let params_per_row = self.schema.columns.len() + 2;
        let params = self.load.batch_size.checked_mul(params_per_row);
        if params.is_none_or(|params| params > POSTGRES_MAX_BIND_PARAMS) {
            anyhow::bail!(
                "Batch size {} with {} columns exceeds the PostgreSQL limit of {} bind parameters; use at most {}",
                self.load.batch_size,
                self.schema.columns.len(),
                POSTGRES_MAX_BIND_PARAMS,
                POSTGRES_MAX_BIND_PARAMS / params_per_row
            );
        }

        if self.load.backoff_base_ms > self.load.backoff_max_ms {
            anyhow::bail!(
                "Backoff base ({}ms) cannot be greater than backoff max ({}ms)",
                self.load.backoff_base_ms,
                self.load.backoff_max_ms
            );
        }

        if self.load.sink_timeout_secs == 0 {
            anyhow::bail!("Sink timeout must be greater than 0");
        }

        if self.load.run_timeout_secs == Some(0) {
            anyhow::bail!("Run timeout must be greater than 0 when set");
        }

        if self.load.document_concurrency == 0 {
            anyhow::bail!("Document concurrency must be greater than 0");
        }

        if self.load.id_strategy == IdStrategy::Uuid {
            tracing::warn!("ETL_ID_STRATEGY=uuid generates new ids on every run; re-runs will duplicate rows");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sheets: SheetsConfig {
                spreadsheet_id: None,
                range: DEFAULT_SHEET_RANGE.to_string(),
                api_key: None,
                access_token: None,
                credentials_file: None,
                base_url: DEFAULT_SHEETS_API_BASE_URL.to_string(),
                timeout_secs: DEFAULT_SHEETS_TIMEOUT_SECS,
            },
            postgres: PostgresConfig {
                url: None,
                host: DEFAULT_POSTGRES_HOST.to_string(),
                port: DEFAULT_POSTGRES_PORT,
                database: DEFAULT_POSTGRES_DATABASE.to_string(),
                user: DEFAULT_POSTGRES_USER.to_string(),
                password: None,
                table: DEFAULT_POSTGRES_TABLE.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            mongo: MongoConfig {
                uri: DEFAULT_MONGODB_URI.to_string(),
                database: DEFAULT_MONGODB_DATABASE.to_string(),
                collection: DEFAULT_MONGODB_COLLECTION.to_string(),
            },
            load: LoadConfig {
                batch_size: DEFAULT_BATCH_SIZE,
                max_retries: DEFAULT_MAX_RETRIES,
                backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
                backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
                sink_timeout_secs: DEFAULT_SINK_TIMEOUT_SECS,
                run_timeout_secs: None,
                document_concurrency: DEFAULT_DOCUMENT_CONCURRENCY,
                id_strategy: IdStrategy::default(),
            },
            schema: Schema::sales(),
        }
    }
}
