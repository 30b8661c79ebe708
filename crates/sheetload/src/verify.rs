//! Post-load verification: connectivity, counts and a sample of what landed

use crate::load::{MongoDocumentSink, PgRelationalSink, SinkError};
use mongodb::bson::Bson;
use serde::Serialize;
use tracing::{info, warn};

/// What one sink holds
#[derive(Debug, Clone, Serialize)]
pub struct SinkSnapshot {
    pub count: u64,
    pub sample: Vec<serde_json::Value>,
}

/// Verification of one sink
#[derive(Debug, Clone, Serialize)]
pub struct SinkCheck {
    pub sink: &'static str,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SinkSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SinkCheck {
    fn from_result(sink: &'static str, target: String, result: Result<SinkSnapshot, SinkError>) -> Self {
        match result {
            Ok(snapshot) => {
                info!(sink, target = %target, count = snapshot.count, "Verified sink");
                Self {
                    sink,
                    target,
                    snapshot: Some(snapshot),
                    error: None,
                }
            }
            Err(e) => {
                warn!(sink, target = %target, "Verification failed: {}", e);
                Self {
                    sink,
                    target,
                    snapshot: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Both sinks' checks
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub postgres: SinkCheck,
    pub mongodb: SinkCheck,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.postgres.is_ok() && self.mongodb.is_ok()
    }
}

async fn snapshot_postgres(sink: &PgRelationalSink, limit: i64) -> Result<SinkSnapshot, SinkError> {
    let count = sink.count().await?;
    let sample = sink.preview(limit).await?;
    Ok(SinkSnapshot {
        count: u64::try_from(count).unwrap_or_default(),
        sample,
    })
}

async fn snapshot_mongo(sink: &MongoDocumentSink, limit: i64) -> Result<SinkSnapshot, SinkError> {
    sink.ping().await?;
    let count = sink.count().await?;
    let sample = sink
        .preview(limit)
        .await?
        .into_iter()
        .map(|doc| Bson::Document(doc).into_relaxed_extjson())
        .collect();
    Ok(SinkSnapshot { count, sample })
}

/// Count and sample both sinks
pub async fn verify(relational: &PgRelationalSink, document: &MongoDocumentSink, limit: i64) -> VerifyReport {
    let (postgres, mongodb) = tokio::join!(
        snapshot_postgres(relational, limit),
        snapshot_mongo(document, limit)
    );

    VerifyReport {
        postgres: SinkCheck::from_result("postgres", relational.table().to_string(), postgres),
        mongodb: SinkCheck::from_result("mongodb", document.collection().name().to_string(), mongodb),
    }
}

impl std::fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for check in [&self.postgres, &self.mongodb] {
            match (&check.snapshot, &check.error) {
                (Some(snapshot), _) => {
                    writeln!(f, "{} ({}): {} records", check.sink, check.target, snapshot.count)?;
                    for item in &snapshot.sample {
                        writeln!(f, "  {}", item)?;
                    }
                }
                (None, Some(error)) => writeln!(f, "{} ({}): FAILED {}", check.sink, check.target, error)?,
                (None, None) => writeln!(f, "{} ({}): no data", check.sink, check.target)?,
            }
        }
        Ok(())
    }
}
