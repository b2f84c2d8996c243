//! Job scheduler
//!
//! Wires the import queue to the engine: an apalis worker backed by
//! PostgreSQL storage consumes `ImportJob` work items, and a periodic
//! sweep resumes incomplete checkpoints. External schedulers only need
//! [`JobScheduler::enqueue`].

use anyhow::Result;
use apalis::prelude::*;
use apalis_postgres::PostgresStorage;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::EngineConfig;
use crate::jobs::ImportJob;
use crate::orchestrator::ImportEngine;

/// Job scheduler
pub struct JobScheduler {
    config: EngineConfig,
    db: PgPool,
    engine: Arc<ImportEngine>,
}

impl JobScheduler {
    /// Create a new job scheduler
    pub fn new(config: EngineConfig, db: PgPool, engine: Arc<ImportEngine>) -> Self {
        Self { config, db, engine }
    }

    /// Queue storage handle for producers
    pub fn storage(&self) -> PostgresStorage<ImportJob> {
        PostgresStorage::new(&self.db)
    }

    /// Enqueue one import job
    pub async fn enqueue(&self, job: ImportJob) -> Result<()> {
        let mut storage = self.storage();
        storage
            .push(job)
            .await
            .map_err(|e| anyhow::anyhow!("failed to enqueue import job: {e}"))?;
        Ok(())
    }

    /// Start the worker and the resume sweep
    ///
    /// The worker consumes `ImportJob` items; the sweep calls
    /// `resume_all_incomplete` once at startup and then on an interval,
    /// so a crashed process picks its unfinished runs back up.
    pub async fn start(self) -> Result<JoinHandle<()>> {
        info!("Starting import job scheduler");

        let storage = self.storage();
        let engine = self.engine.clone();
        let sweep_engine = self.engine.clone();
        let sweep_interval = std::time::Duration::from_secs(self.config.resume_interval_secs);

        // Resume sweep: startup pass plus a steady interval
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                match sweep_engine.resume_all_incomplete().await {
                    Ok(report) if report.scanned > 0 => {
                        info!(
                            scanned = report.scanned,
                            completed = report.completed,
                            "Resume sweep finished"
                        );
                    },
                    Ok(_) => {},
                    Err(e) => error!(error = %e, "Resume sweep failed"),
                }
            }
        });

        let handle = tokio::spawn(async move {
            info!("Import worker started");
            if let Err(e) = Monitor::new()
                .register(move |_index| {
                    WorkerBuilder::new("idp-import-worker")
                        .data(engine.clone())
                        .backend(storage.clone())
                        .build(process_import_job)
                })
                .run()
                .await
            {
                error!("Import worker error: {:?}", e);
            }
            info!("Import worker stopped");
        });

        Ok(handle)
    }
}

/// Process one import job
///
/// Invoked by the apalis worker; delegates to the engine and reports the
/// outcome. A `Failed` run is a normal outcome here (already finalized
/// and alerted by the engine), not a job error.
async fn process_import_job(job: ImportJob, engine: Data<Arc<ImportEngine>>) -> Result<()> {
    info!(
        importer_id = %job.importer_id,
        log_id = ?job.log_id,
        triggered_by = ?job.triggered_by,
        "Processing import job"
    );

    let result = engine.run(job.importer_id, job.log_id).await?;

    info!(
        run_id = %result.run_id,
        status = %result.status,
        total = result.total_count,
        success = result.success_count,
        "Import job finished"
    );

    Ok(())
}
