//! Common test utilities for sheetload integration tests
//!
//! In-memory sinks that keep the two atomicity contracts:
//!
//! - [`MemoryTable`] applies a whole batch or nothing
//! - [`MemoryCollection`] applies each record on its own
//!
//! Both support failure injection by id and a number of transient failures
//! before succeeding.

#![allow(dead_code)]

use async_trait::async_trait;
use sheetload::load::{
    bounded, DocumentSink, FailureCause, RecordOutcome, RelationalSink, SinkError, Upsert, UpsertCounts,
};
use sheetload::source::{RowSource, SourceError};
use sheetload_common::{Column, FieldType, RawRow, Schema, TypedRecord};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sheetload=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// `id`, required text `name`, required decimal `amount`
pub fn example_schema() -> Schema {
    Schema::new(
        "id",
        vec![
            Column::new("name", FieldType::Text).required(),
            Column::new("amount", FieldType::Decimal).required(),
        ],
    )
}

pub fn row(index: usize, id: &str, name: &str, amount: &str) -> RawRow {
    RawRow::new(index, [("id", id), ("name", name), ("amount", amount)])
}

/// The three-row sheet: one synthesized id, one bad amount, one supplied id
pub fn example_rows() -> Vec<RawRow> {
    vec![row(0, "", "A", "10"), row(1, "", "B", "bad"), row(2, "x1", "C", "30")]
}

/// `count` valid rows with supplied ids `r0..r{count}`
pub fn numbered_rows(count: usize) -> Vec<RawRow> {
    (0..count)
        .map(|i| row(i, &format!("r{}", i), &format!("item {}", i), &format!("{}.5", i)))
        .collect()
}

// ============================================================================
// Sources
// ============================================================================

/// Source that is always unreachable
pub struct UnreachableSource;

#[async_trait]
impl RowSource for UnreachableSource {
    async fn fetch_rows(&self) -> sheetload::source::Result<Vec<RawRow>> {
        Err(SourceError::Status {
            url: "https://sheets.test/v4/spreadsheets/x/values/Sheet1".to_string(),
            status: 503,
            body: "unavailable".to_string(),
        })
    }

    fn describe(&self) -> String {
        "unreachable sheet".to_string()
    }
}

// ============================================================================
// Relational sink
// ============================================================================

/// Batch-atomic table keyed by id
#[derive(Default)]
pub struct MemoryTable {
    rows: Mutex<BTreeMap<String, TypedRecord>>,
    reject_ids: Mutex<HashSet<String>>,
    transient_failures: AtomicUsize,
    delay: Duration,
    calls: AtomicUsize,
    closed: AtomicUsize,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any batch holding `id` fails with a constraint violation
    pub fn reject_id(self, id: &str) -> Self {
        self.reject_ids.lock().unwrap().insert(id.to_string());
        self
    }

    /// The next `count` calls fail with a connectivity error
    pub fn fail_transiently(self, count: usize) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Every call takes `delay` before touching the table
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn get(&self, id: &str) -> Option<TypedRecord> {
        self.rows.lock().unwrap().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.rows.lock().unwrap().keys().cloned().collect()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) > 0
    }
}

#[async_trait]
impl RelationalSink for MemoryTable {
    async fn upsert_batch(&self, records: &[TypedRecord], timeout: Duration) -> Result<UpsertCounts, SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        bounded(timeout, async {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(())
        })
        .await?;

        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SinkError::transient(FailureCause::Connectivity, "connection reset"));
        }

        let rejected = self.reject_ids.lock().unwrap().clone();
        if let Some(bad) = records.iter().find(|r| rejected.contains(&r.id)) {
            return Err(SinkError::permanent(
                FailureCause::ConstraintViolation,
                format!("check constraint violated by {}", bad.id),
            ));
        }

        let mut rows = self.rows.lock().unwrap();
        let mut counts = UpsertCounts::default();
        for record in records {
            match rows.insert(record.id.clone(), record.clone()) {
                None => counts.inserted += 1,
                Some(_) => counts.updated += 1,
            }
        }
        Ok(counts)
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Document sink
// ============================================================================

/// Per-record collection keyed by id
#[derive(Default)]
pub struct MemoryCollection {
    docs: Mutex<BTreeMap<String, TypedRecord>>,
    reject_ids: Mutex<HashSet<String>>,
    transient_by_id: Mutex<HashMap<String, usize>>,
    reject_all: std::sync::atomic::AtomicBool,
    attempts: Mutex<HashMap<String, usize>>,
    closed: AtomicUsize,
}

impl MemoryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes of `id` fail permanently
    pub fn reject_id(self, id: &str) -> Self {
        self.reject_ids.lock().unwrap().insert(id.to_string());
        self
    }

    /// Every write fails permanently
    pub fn reject_everything(self) -> Self {
        self.reject_all.store(true, Ordering::SeqCst);
        self
    }

    /// The first `count` writes of `id` fail transiently
    pub fn fail_transiently(self, id: &str, count: usize) -> Self {
        self.transient_by_id.lock().unwrap().insert(id.to_string(), count);
        self
    }

    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    pub fn get(&self, id: &str) -> Option<TypedRecord> {
        self.docs.lock().unwrap().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.docs.lock().unwrap().keys().cloned().collect()
    }

    /// Write attempts seen for `id`
    pub fn attempts(&self, id: &str) -> usize {
        self.attempts.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) > 0
    }

    fn upsert_one(&self, record: &TypedRecord) -> RecordOutcome {
        *self.attempts.lock().unwrap().entry(record.id.clone()).or_insert(0) += 1;

        if self.reject_all.load(Ordering::SeqCst) || self.reject_ids.lock().unwrap().contains(&record.id) {
            return RecordOutcome::failed(
                record.id.clone(),
                SinkError::permanent(FailureCause::ConstraintViolation, "E11000 duplicate key error"),
            );
        }

        if let Some(remaining) = self.transient_by_id.lock().unwrap().get_mut(&record.id) {
            if *remaining > 0 {
                *remaining -= 1;
                return RecordOutcome::failed(
                    record.id.clone(),
                    SinkError::transient(FailureCause::Connectivity, "server selection timeout"),
                );
            }
        }

        match self.docs.lock().unwrap().insert(record.id.clone(), record.clone()) {
            None => RecordOutcome::ok(record.id.clone(), Upsert::Inserted),
            Some(_) => RecordOutcome::ok(record.id.clone(), Upsert::Updated),
        }
    }
}

#[async_trait]
impl DocumentSink for MemoryCollection {
    async fn upsert_many(&self, records: &[TypedRecord]) -> Vec<RecordOutcome> {
        records.iter().map(|r| self.upsert_one(r)).collect()
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
