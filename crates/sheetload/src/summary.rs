//! Run summary
//!
//! The summary is the record of what a run did: every extracted row shows up
//! either as rejected or, per sink, as loaded or failed.

use crate::load::{FailureCause, LoadResult, RowFailure, UpsertCounts};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::Path;

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    Extracting,
    Normalizing,
    Loading,
    Done,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Aborted)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Init => "INIT",
            RunState::Extracting => "EXTRACTING",
            RunState::Normalizing => "NORMALIZING",
            RunState::Loading => "LOADING",
            RunState::Done => "DONE",
            RunState::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// A row the normalizer refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub row_index: usize,
    pub id: String,
    pub reason: String,
}

/// Per-sink totals across all batches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkTotals {
    pub loaded: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
    pub failures: Vec<RowFailure>,
}

impl SinkTotals {
    pub fn absorb(&mut self, result: LoadResult) {
        self.add_counts(result.counts);
        self.failed += result.failures.len();
        self.failures.extend(result.failures);
    }

    fn add_counts(&mut self, counts: UpsertCounts) {
        self.inserted += counts.inserted;
        self.updated += counts.updated;
        self.loaded += counts.total();
    }

    /// Failure count per cause
    pub fn causes(&self) -> BTreeMap<FailureCause, usize> {
        let mut causes = BTreeMap::new();
        for failure in &self.failures {
            *causes.entry(failure.cause).or_insert(0) += 1;
        }
        causes
    }
}

/// Result of one pipeline run
///
/// Serializes with flat `loaded_*` and `failed_*` counters next to the
/// per-sink totals.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunSummary {
    pub state: RunState,
    pub total: usize,
    pub valid: usize,
    pub rejected: usize,
    pub synthesized_ids: usize,
    pub batches: usize,
    pub relational: SinkTotals,
    pub document: SinkTotals,
    pub rejections: Vec<Rejection>,
    /// Set when the run aborted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn new() -> Self {
        Self {
            state: RunState::Init,
            total: 0,
            valid: 0,
            rejected: 0,
            synthesized_ids: 0,
            batches: 0,
            relational: SinkTotals::default(),
            document: SinkTotals::default(),
            rejections: Vec::new(),
            error: None,
            duration_ms: 0,
        }
    }

    pub fn loaded_relational(&self) -> usize {
        self.relational.loaded
    }

    pub fn loaded_document(&self) -> usize {
        self.document.loaded
    }

    pub fn failed_relational(&self) -> usize {
        self.relational.failed
    }

    pub fn failed_document(&self) -> usize {
        self.document.failed
    }

    /// Done with nothing failed in either sink
    pub fn is_clean(&self) -> bool {
        self.state == RunState::Done && self.relational.failed == 0 && self.document.failed == 0
    }

    /// Every valid record is accounted for in both sinks
    pub fn is_balanced(&self) -> bool {
        self.total == self.valid + self.rejected
            && self.relational.loaded + self.relational.failed == self.valid
            && self.document.loaded + self.document.failed == self.valid
    }

    /// Process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self.state {
            RunState::Done if self.is_clean() => 0,
            RunState::Done => 1,
            _ => 2,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

#[derive(Serialize)]
struct SummaryRecord<'a> {
    state: RunState,
    total: usize,
    valid: usize,
    rejected: usize,
    synthesized_ids: usize,
    batches: usize,
    loaded_relational: usize,
    loaded_document: usize,
    failed_relational: usize,
    failed_document: usize,
    relational: &'a SinkTotals,
    document: &'a SinkTotals,
    rejections: &'a [Rejection],
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    duration_ms: u64,
}

impl Serialize for RunSummary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SummaryRecord {
            state: self.state,
            total: self.total,
            valid: self.valid,
            rejected: self.rejected,
            synthesized_ids: self.synthesized_ids,
            batches: self.batches,
            loaded_relational: self.loaded_relational(),
            loaded_document: self.loaded_document(),
            failed_relational: self.failed_relational(),
            failed_document: self.failed_document(),
            relational: &self.relational,
            document: &self.document,
            rejections: &self.rejections,
            error: self.error.as_deref(),
            duration_ms: self.duration_ms,
        }
        .serialize(serializer)
    }
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Run {}", self.state)?;
        if let Some(error) = &self.error {
            writeln!(f, "  error:     {}", error)?;
        }
        writeln!(
            f,
            "  rows:      total={} valid={} rejected={} synthesized_ids={}",
            self.total, self.valid, self.rejected, self.synthesized_ids
        )?;
        for (name, totals) in [("postgres", &self.relational), ("mongodb", &self.document)] {
            writeln!(
                f,
                "  {:<9}  loaded={} (inserted={} updated={}) failed={}",
                format!("{}:", name),
                totals.loaded,
                totals.inserted,
                totals.updated,
                totals.failed
            )?;
            for (cause, count) in totals.causes() {
                writeln!(f, "             {} x{}", cause, count)?;
            }
        }
        for rejection in &self.rejections {
            writeln!(
                f,
                "  rejected row {} ({}): {}",
                rejection.row_index, rejection.id, rejection.reason
            )?;
        }
        write!(f, "  took {}ms", self.duration_ms)
    }
}
