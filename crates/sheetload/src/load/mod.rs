//! Sink loading
//!
//! Two loaders with different failure contracts:
//!
//! - [`RelationalLoader`] writes a whole [`Batch`] in one transaction and
//!   either commits everything or reports one error for the batch.
//! - [`DocumentLoader`] writes each record on its own and reports one
//!   [`RecordOutcome`] per record, so a batch can partially succeed.
//!
//! Loaders make a single attempt bounded by the sink timeout. Retrying is the
//! orchestrator's job (see [`crate::retry::RetryPolicy`]).

pub mod mongo;
pub mod postgres;

use crate::retry::Retryable;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sheetload_common::TypedRecord;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use mongo::MongoDocumentSink;
pub use postgres::PgRelationalSink;

/// What went wrong in a sink write
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// Unique, foreign key, not-null or check violation
    ConstraintViolation,
    /// Value rejected by the store (overflow, bad format)
    DataException,
    /// Table or column layout does not match
    SchemaMismatch,
    /// Connection lost, refused or not yet available
    Connectivity,
    /// Serialization failure or deadlock
    Concurrency,
    /// Server out of connections or similar
    ResourceExhausted,
    /// The sink call exceeded its timeout
    Timeout,
    /// The run budget expired before the batch was scheduled
    DeadlineExceeded,
    /// Document store refused the write
    WriteRejected,
    Other,
}

impl FailureCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCause::ConstraintViolation => "constraint_violation",
            FailureCause::DataException => "data_exception",
            FailureCause::SchemaMismatch => "schema_mismatch",
            FailureCause::Connectivity => "connectivity",
            FailureCause::Concurrency => "concurrency",
            FailureCause::ResourceExhausted => "resource_exhausted",
            FailureCause::Timeout => "timeout",
            FailureCause::DeadlineExceeded => "deadline_exceeded",
            FailureCause::WriteRejected => "write_rejected",
            FailureCause::Other => "other",
        }
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a retry can succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkErrorKind {
    Transient,
    Permanent,
}

/// A failed sink write
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{cause} ({kind:?}): {message}")]
pub struct SinkError {
    pub kind: SinkErrorKind,
    pub cause: FailureCause,
    pub message: String,
}

impl SinkError {
    pub fn new(kind: SinkErrorKind, cause: FailureCause, message: impl Into<String>) -> Self {
        Self {
            kind,
            cause,
            message: message.into(),
        }
    }

    pub fn transient(cause: FailureCause, message: impl Into<String>) -> Self {
        Self::new(SinkErrorKind::Transient, cause, message)
    }

    pub fn permanent(cause: FailureCause, message: impl Into<String>) -> Self {
        Self::new(SinkErrorKind::Permanent, cause, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::transient(
            FailureCause::Timeout,
            format!("sink call timed out after {}ms", after.as_millis()),
        )
    }

    pub fn deadline_exceeded() -> Self {
        Self::permanent(
            FailureCause::DeadlineExceeded,
            "run timeout reached before the batch was scheduled",
        )
    }
}

impl Retryable for SinkError {
    fn is_transient(&self) -> bool {
        self.kind == SinkErrorKind::Transient
    }
}

/// Rows written by one successful call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
}

impl UpsertCounts {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn record(&mut self, upsert: Upsert) {
        match upsert {
            Upsert::Inserted => self.inserted += 1,
            Upsert::Updated => self.updated += 1,
        }
    }
}

impl std::ops::AddAssign for UpsertCounts {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
    }
}

/// Effect of a successful single-record upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Upsert {
    Inserted,
    Updated,
}

/// Per-record result from the document sink
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    pub id: String,
    pub result: Result<Upsert, SinkError>,
}

impl RecordOutcome {
    pub fn ok(id: impl Into<String>, upsert: Upsert) -> Self {
        Self {
            id: id.into(),
            result: Ok(upsert),
        }
    }

    pub fn failed(id: impl Into<String>, error: SinkError) -> Self {
        Self {
            id: id.into(),
            result: Err(error),
        }
    }
}

/// A record that did not make it into a sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFailure {
    pub id: String,
    pub cause: FailureCause,
    pub message: String,
}

impl RowFailure {
    pub fn from_error(id: impl Into<String>, error: &SinkError) -> Self {
        Self {
            id: id.into(),
            cause: error.cause,
            message: error.message.clone(),
        }
    }
}

/// Outcome of one batch against one sink
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadResult {
    pub counts: UpsertCounts,
    pub failures: Vec<RowFailure>,
}

impl LoadResult {
    pub fn loaded(&self) -> usize {
        self.counts.total()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// Every record of the batch failed with the same error
    pub fn batch_failed(batch: &Batch, error: &SinkError) -> Self {
        Self {
            counts: UpsertCounts::default(),
            failures: batch
                .records()
                .iter()
                .map(|r| RowFailure::from_error(r.id.clone(), error))
                .collect(),
        }
    }
}

/// Non-empty run of valid records, written as one unit
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    index: usize,
    records: Vec<TypedRecord>,
}

impl Batch {
    /// `None` when `records` is empty or holds a rejected record
    pub fn new(index: usize, records: Vec<TypedRecord>) -> Option<Self> {
        if records.is_empty() || records.iter().any(|r| !r.is_valid()) {
            return None;
        }
        Some(Self { index, records })
    }

    /// Split the valid records into batches of at most `size`, in order
    pub fn partition(records: impl IntoIterator<Item = TypedRecord>, size: usize) -> Vec<Batch> {
        let size = size.max(1);
        let valid: Vec<TypedRecord> = records.into_iter().filter(|r| r.is_valid()).collect();

        valid
            .chunks(size)
            .enumerate()
            .filter_map(|(index, chunk)| Batch::new(index, chunk.to_vec()))
            .collect()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn records(&self) -> &[TypedRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Batch-atomic store keyed by record id
#[async_trait]
pub trait RelationalSink: Send + Sync {
    /// Upsert every record in one transaction.
    ///
    /// Everything up to the commit must finish within `timeout` (see
    /// [`bounded`]). The commit itself is not bounded: once it is sent, the
    /// outcome reported is the store's.
    async fn upsert_batch(&self, records: &[TypedRecord], timeout: Duration) -> Result<UpsertCounts, SinkError>;

    /// Release connections
    async fn close(&self) {}
}

/// Per-record store keyed by record id
#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Upsert each record independently; one outcome per input record
    async fn upsert_many(&self, records: &[TypedRecord]) -> Vec<RecordOutcome>;

    /// Release connections
    async fn close(&self) {}
}

/// Run `work`, failing with a transient timeout once `timeout` elapses
pub async fn bounded<T, F>(timeout: Duration, work: F) -> Result<T, SinkError>
where
    F: Future<Output = Result<T, SinkError>>,
{
    match tokio::time::timeout(timeout, work).await {
        Ok(result) => result,
        Err(_) => Err(SinkError::timeout(timeout)),
    }
}

/// Single-attempt, time-bounded relational batch load
#[derive(Clone)]
pub struct RelationalLoader {
    sink: Arc<dyn RelationalSink>,
    timeout: Duration,
}

impl RelationalLoader {
    pub fn new(sink: Arc<dyn RelationalSink>, timeout: Duration) -> Self {
        Self { sink, timeout }
    }

    pub async fn load_batch(&self, batch: &Batch) -> Result<UpsertCounts, SinkError> {
        self.sink.upsert_batch(batch.records(), self.timeout).await
    }

    pub async fn close(&self) {
        self.sink.close().await;
    }
}

/// Single-attempt, time-bounded document load
#[derive(Clone)]
pub struct DocumentLoader {
    sink: Arc<dyn DocumentSink>,
    timeout: Duration,
}

impl DocumentLoader {
    pub fn new(sink: Arc<dyn DocumentSink>, timeout: Duration) -> Self {
        Self { sink, timeout }
    }

    /// Upsert `records`. On timeout every record is reported as a timeout.
    pub async fn load_records(&self, records: &[TypedRecord]) -> Vec<RecordOutcome> {
        match tokio::time::timeout(self.timeout, self.sink.upsert_many(records)).await {
            Ok(outcomes) => outcomes,
            Err(_) => {
                let error = SinkError::timeout(self.timeout);
                records
                    .iter()
                    .map(|r| RecordOutcome::failed(r.id.clone(), error.clone()))
                    .collect()
            }
        }
    }

    pub async fn close(&self) {
        self.sink.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sheetload_common::ValidationState;
    use std::collections::BTreeMap;

    fn record(id: &str, valid: bool) -> TypedRecord {
        TypedRecord {
            row_index: 0,
            id: id.to_string(),
            id_synthesized: false,
            fields: BTreeMap::new(),
            validation: if valid {
                ValidationState::Valid
            } else {
                ValidationState::Rejected {
                    reason: "type_error:x".to_string(),
                }
            },
        }
    }

    #[test]
    fn test_batch_requires_valid_non_empty() {
        assert!(Batch::new(0, vec![]).is_none());
        assert!(Batch::new(0, vec![record("a", true), record("b", false)]).is_none());

        let batch = Batch::new(3, vec![record("a", true)]).unwrap();
        assert_eq!(batch.index(), 3);
        assert_eq!(batch.len(), 1);
        assert!(!batch.is_empty());
    }

    #[test]
    fn test_partition_keeps_order_and_skips_rejected() {
        let records = vec![
            record("a", true),
            record("b", false),
            record("c", true),
            record("d", true),
            record("e", true),
        ];
        let batches = Batch::partition(records, 2);

        assert_eq!(batches.len(), 2);
        let ids: Vec<Vec<&str>> = batches
            .iter()
            .map(|b| b.records().iter().map(|r| r.id.as_str()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["a", "c"], vec!["d", "e"]]);
        assert_eq!(batches[1].index(), 1);
    }

    #[test]
    fn test_partition_of_nothing_is_empty() {
        assert!(Batch::partition(vec![record("x", false)], 10).is_empty());
    }

    #[test]
    fn test_batch_failed_reports_every_record() {
        let batch = Batch::new(0, vec![record("a", true), record("b", true)]).unwrap();
        let error = SinkError::permanent(FailureCause::ConstraintViolation, "duplicate key");
        let result = LoadResult::batch_failed(&batch, &error);

        assert_eq!(result.loaded(), 0);
        assert_eq!(result.failed(), 2);
        assert!(result
            .failures
            .iter()
            .all(|f| f.cause == FailureCause::ConstraintViolation));
    }

    #[test]
    fn test_sink_error_retryable() {
        assert!(SinkError::timeout(Duration::from_secs(1)).is_transient());
        assert!(!SinkError::deadline_exceeded().is_transient());
        assert_eq!(FailureCause::DeadlineExceeded.to_string(), "deadline_exceeded");
        assert_eq!(
            serde_json::to_string(&FailureCause::ConstraintViolation).unwrap(),
            "\"constraint_violation\""
        );
    }

    struct SlowSink;

    #[async_trait]
    impl RelationalSink for SlowSink {
        async fn upsert_batch(&self, records: &[TypedRecord], timeout: Duration) -> Result<UpsertCounts, SinkError> {
            bounded(timeout, async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await?;
            Ok(UpsertCounts {
                inserted: records.len(),
                updated: 0,
            })
        }
    }

    /// Fast statement, slow commit
    struct SlowCommitSink;

    #[async_trait]
    impl RelationalSink for SlowCommitSink {
        async fn upsert_batch(&self, records: &[TypedRecord], timeout: Duration) -> Result<UpsertCounts, SinkError> {
            bounded(timeout, async { Ok(()) }).await?;
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(UpsertCounts {
                inserted: records.len(),
                updated: 0,
            })
        }
    }

    #[async_trait]
    impl DocumentSink for SlowSink {
        async fn upsert_many(&self, records: &[TypedRecord]) -> Vec<RecordOutcome> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            records
                .iter()
                .map(|r| RecordOutcome::ok(r.id.clone(), Upsert::Inserted))
                .collect()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loader_timeouts_are_transient() {
        let batch = Batch::new(0, vec![record("a", true), record("b", true)]).unwrap();

        let relational = RelationalLoader::new(Arc::new(SlowSink), Duration::from_secs(1));
        let err = relational.load_batch(&batch).await.unwrap_err();
        assert_eq!(err.cause, FailureCause::Timeout);
        assert!(err.is_transient());

        let document = DocumentLoader::new(Arc::new(SlowSink), Duration::from_secs(1));
        let outcomes = document.load_records(batch.records()).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes
            .iter()
            .all(|o| matches!(&o.result, Err(e) if e.cause == FailureCause::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_commit_is_not_reported_as_timeout() {
        let batch = Batch::new(0, vec![record("a", true), record("b", true)]).unwrap();

        let relational = RelationalLoader::new(Arc::new(SlowCommitSink), Duration::from_secs(1));
        let counts = relational.load_batch(&batch).await.unwrap();
        assert_eq!(counts.inserted, 2);
    }
}
