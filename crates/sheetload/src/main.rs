//! sheetload - main entry point

use anyhow::Context;
use clap::Parser;
use sheetload::load::{mongo, postgres, DocumentSink, MongoDocumentSink, PgRelationalSink, RelationalSink};
use sheetload::source::{CsvSource, RowSource, SheetsSource};
use sheetload::{verify, Cli, Commands, Config, Pipeline, PipelineOptions, RunArgs};
use sheetload_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use std::process;
use std::sync::Arc;
use tracing::{error, info};

/// Exit code for configuration errors and aborted runs
const EXIT_ABORTED: i32 = 2;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { LogLevel::Debug } else { LogLevel::Info };

    // Console and file by default; LOG_* variables take precedence
    let log_config = LogConfig::builder()
        .level(log_level)
        .output(LogOutput::Both)
        .log_file_prefix("sheetload")
        .build();

    let log_config = match log_config.with_env_overrides() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: invalid logging configuration: {:#}", e);
            process::exit(EXIT_ABORTED);
        }
    };

    let guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {:#}", e);
            None
        }
    };

    let code = match cli.resolved_command() {
        Commands::Run(args) => run(args).await,
        Commands::Verify { limit } => verify_sinks(limit).await,
    };

    // process::exit skips destructors; flush the file writer first
    drop(guard);
    process::exit(code);
}

/// Both sinks, connected lazily
struct Sinks {
    relational: Arc<PgRelationalSink>,
    document: Arc<MongoDocumentSink>,
}

impl Sinks {
    async fn connect(config: &Config) -> anyhow::Result<Self> {
        let pool = postgres::connect_lazy(&config.postgres)?;

        let relational = match PgRelationalSink::new(pool.clone(), &config.postgres.table, config.schema.clone()) {
            Ok(sink) => sink,
            Err(e) => {
                pool.close().await;
                return Err(e).context("Invalid PostgreSQL target");
            }
        };

        let client = match mongo::connect(&config.mongo).await {
            Ok(client) => client,
            Err(e) => {
                pool.close().await;
                return Err(e).context("Failed to create MongoDB client");
            }
        };

        let document = MongoDocumentSink::new(
            client,
            &config.mongo.database,
            &config.mongo.collection,
            config.schema.clone(),
            config.load.document_concurrency,
        );

        Ok(Self {
            relational: Arc::new(relational),
            document: Arc::new(document),
        })
    }

    async fn close(&self) {
        tokio::join!(self.relational.close(), self.document.close());
    }
}

async fn run(args: RunArgs) -> i32 {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            eprintln!("Error: {:#}", e);
            return EXIT_ABORTED;
        }
    };

    let source: Arc<dyn RowSource> = match &args.csv {
        Some(path) => Arc::new(CsvSource::new(path)),
        None => match SheetsSource::new(&config.sheets) {
            Ok(source) => Arc::new(source),
            Err(e) => {
                error!(error = %e, "Invalid source configuration");
                eprintln!("Error: {}", e);
                return EXIT_ABORTED;
            }
        },
    };

    let sinks = match Sinks::connect(&config).await {
        Ok(sinks) => sinks,
        Err(e) => {
            error!(error = %e, "Failed to set up sinks");
            eprintln!("Error: {:#}", e);
            return EXIT_ABORTED;
        }
    };

    let pipeline = Pipeline::new(
        source,
        sinks.relational.clone(),
        sinks.document.clone(),
        config.schema.clone(),
        PipelineOptions::from_config(&config.load).dry_run(args.dry_run),
    );

    let summary = pipeline.run().await;
    pipeline.close().await;

    println!("{}", summary);

    if let Some(path) = &args.summary_json {
        match summary.write_json(path) {
            Ok(()) => info!(path = %path.display(), "Wrote run summary"),
            Err(e) => error!(path = %path.display(), "Failed to write run summary: {:#}", e),
        }
    }

    summary.exit_code()
}

async fn verify_sinks(limit: i64) -> i32 {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return EXIT_ABORTED;
        }
    };

    let sinks = match Sinks::connect(&config).await {
        Ok(sinks) => sinks,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return EXIT_ABORTED;
        }
    };

    let report = verify::verify(&sinks.relational, &sinks.document, limit).await;
    sinks.close().await;

    print!("{}", report);

    if report.is_ok() {
        0
    } else {
        1
    }
}
