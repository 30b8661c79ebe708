//! sheetload
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Upsert-safe ETL from a Google Sheet into PostgreSQL and MongoDB.
//!
//! # Overview
//!
//! - **Sources**: the Sheets values API or a local CSV export (`source`)
//! - **Normalizer**: typed coercion, defaults and run-unique ids (`normalizer`)
//! - **Loaders**: batch-atomic PostgreSQL upserts and per-record MongoDB
//!   upserts (`load`)
//! - **Pipeline**: extraction, normalization, batching and the dual load,
//!   reported as a [`RunSummary`] (`pipeline`, `summary`)
//! - **Verify**: counts and samples what landed in both stores (`verify`)
//!
//! Re-running over the same sheet is idempotent: every write is an upsert keyed
//! by the record id, and the default id strategy is deterministic.

pub mod config;
pub mod load;
pub mod normalizer;
pub mod pipeline;
pub mod retry;
pub mod source;
pub mod summary;
pub mod verify;

// Re-export commonly used types
pub use config::Config;
pub use normalizer::{IdStrategy, Normalizer};
pub use pipeline::{Pipeline, PipelineError, PipelineOptions};
pub use retry::RetryPolicy;
pub use summary::{RunState, RunSummary};

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Load Google Sheet rows into PostgreSQL and MongoDB
#[derive(Parser, Debug)]
#[command(name = "sheetload")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute (defaults to `run`)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Extract, normalize and load into both stores
    Run(RunArgs),

    /// Check connectivity and show what the stores hold
    Verify {
        /// Rows and documents to show from each store
        #[arg(short, long, default_value_t = 5, value_parser = clap::value_parser!(i64).range(1..))]
        limit: i64,
    },
}

/// Options for a pipeline run
#[derive(clap::Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Extract and normalize without writing to either store
    #[arg(long)]
    pub dry_run: bool,

    /// Read rows from a CSV file instead of Google Sheets
    #[arg(long, value_name = "PATH")]
    pub csv: Option<PathBuf>,

    /// Also write the run summary as JSON
    #[arg(long, value_name = "PATH")]
    pub summary_json: Option<PathBuf>,
}

impl Cli {
    /// The command to run; no subcommand means `run` with defaults
    pub fn resolved_command(&self) -> Commands {
        match &self.command {
            Some(Commands::Run(args)) => Commands::Run(args.clone()),
            Some(Commands::Verify { limit }) => Commands::Verify { limit: *limit },
            None => Commands::Run(RunArgs::default()),
        }
    }
}
