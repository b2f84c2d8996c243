//! IDP Importer - batch data ingestion tool

use anyhow::{Context, Result};
use clap::Parser;
use idp_common::logging::{init_logging, LogConfig, LogLevel};
use idp_importer::{
    EngineConfig, ImportEngine, ImportJob, JobScheduler, LogNotifier, PgStore, WebhookNotifier,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "idp-importer")]
#[command(author, version, about = "IDP data importer")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Execute one importer now
    Run {
        /// Importer id
        importer_id: Uuid,

        /// Resume this run's checkpoint instead of starting fresh
        #[arg(long)]
        log_id: Option<Uuid>,
    },

    /// Resume every incomplete checkpoint once
    ResumeAll,

    /// Run the queue worker and the periodic resume sweep
    Worker,

    /// Enqueue an import job instead of running it inline
    Enqueue {
        /// Importer id
        importer_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::from_env()?
        .with_level(log_level)
        .with_file_prefix("idp-importer");
    init_logging(&log_config)?;

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let config = EngineConfig::from_env()?;

    let store = PgStore::connect(&database_url)
        .await
        .context("Failed to connect to database")?;

    let reference_dataset =
        std::env::var("IMPORTER_REFERENCE_DATASET").unwrap_or_else(|_| "default".to_string());
    let reference = store
        .load_reference(&reference_dataset)
        .await
        .context("Failed to load reference dataset")?;
    info!(
        dataset = %reference_dataset,
        entities = reference.len(),
        "Loaded reference dataset"
    );

    let notifier: Arc<dyn idp_importer::AlertNotifier> =
        match std::env::var("IMPORTER_ALERT_WEBHOOK") {
            Ok(endpoint) => Arc::new(WebhookNotifier::new(endpoint)),
            Err(_) => Arc::new(LogNotifier),
        };

    let pool = store.pool().clone();
    let engine = Arc::new(ImportEngine::new(
        Arc::new(store),
        notifier,
        Arc::new(reference),
        config.clone(),
    ));

    match cli.command {
        Command::Run {
            importer_id,
            log_id,
        } => {
            let result = engine.run(importer_id, log_id).await?;
            info!(
                run_id = %result.run_id,
                status = %result.status,
                total = result.total_count,
                success = result.success_count,
                "Run finished"
            );
        },
        Command::ResumeAll => {
            let report = engine.resume_all_incomplete().await?;
            info!(
                scanned = report.scanned,
                completed = report.completed,
                still_incomplete = report.still_incomplete,
                errored = report.errored,
                "Resume sweep finished"
            );
        },
        Command::Worker => {
            let scheduler = JobScheduler::new(config, pool, engine);
            let handle = scheduler.start().await?;
            handle.await?;
        },
        Command::Enqueue { importer_id } => {
            let scheduler = JobScheduler::new(config, pool, engine);
            scheduler
                .enqueue(ImportJob::new(importer_id).with_triggered_by("manual"))
                .await?;
            info!(importer_id = %importer_id, "Job enqueued");
        },
    }

    Ok(())
}
