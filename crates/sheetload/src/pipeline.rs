// Pipeline orchestration
//
// INIT -> EXTRACTING -> NORMALIZING -> LOADING -> DONE, or ABORTED when the
// source cannot be read. Only extraction can abort; everything after it is
// contained to its row, batch or record and ends up in the summary.

use crate::config::LoadConfig;
use crate::load::{
    Batch, DocumentLoader, DocumentSink, FailureCause, LoadResult, RelationalLoader, RelationalSink, RowFailure,
    SinkError,
};
use crate::normalizer::{IdStrategy, Normalizer};
use crate::retry::{RetryPolicy, Retryable};
use crate::source::{RowSource, SourceError};
use crate::summary::{Rejection, RunState, RunSummary};
use sheetload_common::{Schema, TypedRecord};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Errors that end a run
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Source unavailable: {0}")]
    SourceUnavailable(#[from] SourceError),
}

/// Run settings
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub sink_timeout: Duration,
    pub run_timeout: Option<Duration>,
    pub id_strategy: IdStrategy,
    /// Extract and normalize only
    pub dry_run: bool,
}

impl PipelineOptions {
    pub fn from_config(config: &LoadConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            retry: config.retry_policy(),
            sink_timeout: config.sink_timeout(),
            run_timeout: config.run_timeout(),
            id_strategy: config.id_strategy,
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&crate::config::Config::default().load)
    }
}

/// Sheet to PostgreSQL and MongoDB pipeline
pub struct Pipeline {
    source: Arc<dyn RowSource>,
    relational: RelationalLoader,
    document: DocumentLoader,
    schema: Schema,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn RowSource>,
        relational: Arc<dyn RelationalSink>,
        document: Arc<dyn DocumentSink>,
        schema: Schema,
        options: PipelineOptions,
    ) -> Self {
        Self {
            source,
            relational: RelationalLoader::new(relational, options.sink_timeout),
            document: DocumentLoader::new(document, options.sink_timeout),
            schema,
            options,
        }
    }

    /// Run once. Never fails; an aborted run is reported in the summary.
    pub async fn run(&self) -> RunSummary {
        let started = Instant::now();
        let deadline = self.options.run_timeout.map(|budget| started + budget);
        let mut summary = RunSummary::new();

        info!(source = %self.source.describe(), dry_run = self.options.dry_run, "Starting ETL run");

        transition(&mut summary, RunState::Extracting);
        let rows = match self.source.fetch_rows().await.map_err(PipelineError::from) {
            Ok(rows) => rows,
            Err(e) => {
                error!("Aborting run: {}", e);
                summary.error = Some(e.to_string());
                transition(&mut summary, RunState::Aborted);
                summary.duration_ms = elapsed_ms(started);
                return summary;
            }
        };
        summary.total = rows.len();
        info!(rows = rows.len(), "Extracted rows");

        transition(&mut summary, RunState::Normalizing);
        let mut normalizer = Normalizer::new(self.schema.clone(), self.options.id_strategy);
        let records = normalizer.normalize_all(&rows);
        drop(rows);

        for record in &records {
            if let Some(reason) = record.rejection_reason() {
                warn!(row = record.row_index, id = %record.id, reason, "Rejected row");
                summary.rejections.push(Rejection {
                    row_index: record.row_index,
                    id: record.id.clone(),
                    reason: reason.to_string(),
                });
            }
        }
        summary.rejected = summary.rejections.len();
        summary.valid = summary.total - summary.rejected;
        summary.synthesized_ids = normalizer.synthesized_count();
        info!(
            valid = summary.valid,
            rejected = summary.rejected,
            synthesized_ids = summary.synthesized_ids,
            "Normalized rows"
        );

        let batches = Batch::partition(records, self.options.batch_size);
        summary.batches = batches.len();

        transition(&mut summary, RunState::Loading);
        if self.options.dry_run {
            info!(batches = batches.len(), "Dry run, skipping sink writes");
        } else {
            self.load_all(&batches, deadline, &mut summary).await;
        }

        transition(&mut summary, RunState::Done);
        summary.duration_ms = elapsed_ms(started);
        info!(
            total = summary.total,
            valid = summary.valid,
            rejected = summary.rejected,
            loaded_relational = summary.loaded_relational(),
            loaded_document = summary.loaded_document(),
            failed_relational = summary.failed_relational(),
            failed_document = summary.failed_document(),
            duration_ms = summary.duration_ms,
            "ETL run finished"
        );

        summary
    }

    async fn load_all(&self, batches: &[Batch], deadline: Option<Instant>, summary: &mut RunSummary) {
        let total = batches.len();

        for (position, batch) in batches.iter().enumerate() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                let skipped = &batches[position..];
                let error = SinkError::deadline_exceeded();
                warn!(
                    batches = skipped.len(),
                    records = skipped.iter().map(Batch::len).sum::<usize>(),
                    "Run timeout reached, not scheduling remaining batches"
                );
                for batch in skipped {
                    summary.relational.absorb(LoadResult::batch_failed(batch, &error));
                    summary.document.absorb(LoadResult::batch_failed(batch, &error));
                }
                break;
            }

            info!(batch = batch.index(), records = batch.len(), "Loading batch {}/{}", position + 1, total);

            let (relational, document) = tokio::join!(self.load_relational(batch), self.load_document(batch));

            info!(
                batch = batch.index(),
                relational_loaded = relational.loaded(),
                relational_failed = relational.failed(),
                document_loaded = document.loaded(),
                document_failed = document.failed(),
                "Batch complete"
            );

            summary.relational.absorb(relational);
            summary.document.absorb(document);
        }
    }

    /// Whole-batch upsert with retries; all-or-nothing
    pub async fn load_relational(&self, batch: &Batch) -> LoadResult {
        let operation = format!("relational batch {}", batch.index());
        let result = self
            .options
            .retry
            .run(&operation, |_| self.relational.load_batch(batch))
            .await;

        match result {
            Ok(counts) => LoadResult {
                counts,
                failures: Vec::new(),
            },
            Err(e) => {
                error!(batch = batch.index(), sink = "postgres", cause = %e.cause, "Batch failed: {}", e.message);
                LoadResult::batch_failed(batch, &e)
            }
        }
    }

    /// Per-record upserts; only records that failed transiently are retried
    pub async fn load_document(&self, batch: &Batch) -> LoadResult {
        let policy = &self.options.retry;
        let mut result = LoadResult::default();
        let mut pending: Vec<TypedRecord> = batch.records().to_vec();
        let mut attempt = 1;

        while !pending.is_empty() {
            debug!(batch = batch.index(), attempt, records = pending.len(), "Document upsert attempt");

            let outcomes = self.document.load_records(&pending).await;
            let mut retry: HashMap<String, SinkError> = HashMap::new();
            let mut reported: HashSet<String> = HashSet::with_capacity(outcomes.len());

            for outcome in outcomes {
                if !reported.insert(outcome.id.clone()) {
                    continue;
                }
                match outcome.result {
                    Ok(upsert) => result.counts.record(upsert),
                    Err(e) if e.is_transient() && attempt < policy.max_attempts() => {
                        retry.insert(outcome.id, e);
                    }
                    Err(e) => {
                        error!(batch = batch.index(), sink = "mongodb", id = %outcome.id, cause = %e.cause, "Record failed: {}", e.message);
                        result.failures.push(RowFailure::from_error(outcome.id, &e));
                    }
                }
            }

            // Records the sink did not report on count as failed
            for record in pending.iter().filter(|r| !reported.contains(&r.id)) {
                let e = SinkError::permanent(FailureCause::Other, "no outcome reported by sink");
                result.failures.push(RowFailure::from_error(record.id.clone(), &e));
            }

            if retry.is_empty() {
                break;
            }

            let delay = policy.delay_for(attempt);
            warn!(
                batch = batch.index(),
                sink = "mongodb",
                records = retry.len(),
                "Document attempt {}/{} failed for {} records. Retrying in {}ms...",
                attempt,
                policy.max_attempts(),
                retry.len(),
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;

            pending.retain(|r| retry.contains_key(&r.id));
            attempt += 1;
        }

        result
    }

    /// Release both sinks' connections
    pub async fn close(&self) {
        tokio::join!(self.relational.close(), self.document.close());
        debug!("Closed sink connections");
    }
}

fn transition(summary: &mut RunSummary, to: RunState) {
    info!(from = %summary.state, to = %to, "Pipeline state transition");
    summary.state = to;
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
