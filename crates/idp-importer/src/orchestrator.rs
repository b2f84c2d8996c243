//! Ingestion orchestrator
//!
//! Drives one run through its state machine:
//! fetch -> map/validate -> batch-persist -> checkpoint -> finalize.
//! Record-level failures are logged and skipped; adapter-level errors fail
//! the attempt; batch-level persistence errors are retried with backoff
//! and then recorded in the checkpoint note so a later resume can finish
//! the work.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::adapters::{adapter_for, FormatAdapter};
use crate::alerts::{recipients_for, AlertEvent, AlertNotifier};
use crate::attrs::AttributeStore;
use crate::config::{EngineConfig, ImporterConfig};
use crate::mapper::{RecordId, RecordMapper, TargetRecord};
use crate::models::{RecordFailure, RunResult, RunStatus, RunSummary};
use crate::progress::Checkpoint;
use crate::reference::ReferenceDataset;
use crate::staging::Staging;
use crate::store::ImportStore;
use idp_common::{ImportError, Result};

/// Adapter lookup used by the engine; replaceable to plug in formats
/// beyond the built-in registry
pub type AdapterRegistry = Arc<dyn Fn(crate::config::InputFormat) -> Box<dyn FormatAdapter> + Send + Sync>;

/// Outcome of one `resume_all_incomplete` sweep
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResumeReport {
    pub scanned: usize,
    pub completed: usize,
    pub still_incomplete: usize,
    pub errored: usize,
}

/// The ingestion engine: one instance serves many importers, one run at a
/// time per call. Runs share no mutable state beyond the store.
pub struct ImportEngine {
    store: Arc<dyn ImportStore>,
    notifier: Arc<dyn AlertNotifier>,
    reference: Arc<dyn ReferenceDataset>,
    config: EngineConfig,
    staging: Staging,
    registry: AdapterRegistry,
    cancel: CancellationToken,
}

impl ImportEngine {
    pub fn new(
        store: Arc<dyn ImportStore>,
        notifier: Arc<dyn AlertNotifier>,
        reference: Arc<dyn ReferenceDataset>,
        config: EngineConfig,
    ) -> Self {
        let staging = Staging::new(
            config.staging_dir.clone(),
            std::time::Duration::from_secs(config.staging_max_age_secs),
        );
        Self {
            store,
            notifier,
            reference,
            config,
            staging,
            registry: Arc::new(adapter_for),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the adapter registry (embedders with custom formats)
    pub fn with_registry(mut self, registry: AdapterRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Handle for cooperative cancellation; checked between batches
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute one attempt for an importer
    ///
    /// With `log_id`, resumes that run's checkpoint instead of starting
    /// fresh; if the run has no checkpoint yet (extraction never
    /// completed), the attempt starts over on the same run.
    ///
    /// # Errors
    ///
    /// Errors are returned only for pre-run problems (unknown importer or
    /// run, store failures). Once a run exists, attempt failures finalize
    /// the run as `Failed` and come back as a normal `RunResult`.
    pub async fn run(&self, importer_id: Uuid, log_id: Option<Uuid>) -> Result<RunResult> {
        let importer = self.store.importer(importer_id).await?;

        if let Some(log_id) = log_id {
            let run = self.store.run(log_id).await?;
            if run.importer_id != importer_id {
                return Err(ImportError::Configuration(format!(
                    "run {log_id} does not belong to importer {importer_id}"
                )));
            }
            if let Some(checkpoint) = self.store.checkpoint(log_id).await? {
                return self.resume_checkpoint(&importer, log_id, checkpoint).await;
            }
            info!(run_id = %log_id, "Run has no checkpoint; starting a fresh attempt");
            return self.fresh_attempt(&importer, log_id).await;
        }

        let run = self.store.create_run(importer_id).await?;
        self.fresh_attempt(&importer, run.id).await
    }

    /// Resume one incomplete run by its log id
    pub async fn resume(&self, log_id: Uuid) -> Result<RunResult> {
        let run = self.store.run(log_id).await?;
        let importer = self.store.importer(run.importer_id).await?;
        let checkpoint = self
            .store
            .checkpoint(log_id)
            .await?
            .ok_or_else(|| {
                ImportError::Configuration(format!("run {log_id} has no checkpoint to resume"))
            })?;
        self.resume_checkpoint(&importer, log_id, checkpoint).await
    }

    /// Scan for checkpoints with `done = false` and resume each one
    ///
    /// One run failing to resume never aborts the sweep.
    pub async fn resume_all_incomplete(&self) -> Result<ResumeReport> {
        let log_ids = self.store.incomplete_checkpoints().await?;
        let mut report = ResumeReport {
            scanned: log_ids.len(),
            ..Default::default()
        };

        info!(count = log_ids.len(), "Resuming incomplete checkpoints");

        for log_id in log_ids {
            match self.resume(log_id).await {
                Ok(result) if result.status == RunStatus::Success => report.completed += 1,
                Ok(_) => report.still_incomplete += 1,
                Err(e) => {
                    error!(run_id = %log_id, error = %e, "Resume failed");
                    report.errored += 1;
                },
            }
        }

        info!(
            scanned = report.scanned,
            completed = report.completed,
            still_incomplete = report.still_incomplete,
            errored = report.errored,
            "Resume sweep finished"
        );
        Ok(report)
    }

    // ======================================================================
    // Attempt phases
    // ======================================================================

    async fn fresh_attempt(&self, importer: &ImporterConfig, run_id: Uuid) -> Result<RunResult> {
        info!(run_id = %run_id, importer = %importer.name, "Starting import run");
        self.store.set_run_status(run_id, RunStatus::Start).await?;
        self.alert(
            importer,
            AlertEvent::Start,
            self.summary(importer, run_id, RunStatus::Start, 0, 0, None),
        );

        let mut total: i64 = 0;
        match self.extract_and_stage(importer, run_id, &mut total).await {
            Ok(()) => {
                self.store.set_run_counts(run_id, total, 0).await?;
                self.persist_and_finalize(importer, run_id, total).await
            },
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Attempt failed before persistence");
                self.store
                    .finalize_run(run_id, RunStatus::Failed, total, 0)
                    .await?;
                self.alert(
                    importer,
                    AlertEvent::Failure,
                    self.summary(
                        importer,
                        run_id,
                        RunStatus::Failed,
                        total,
                        0,
                        Some(e.to_string()),
                    ),
                );
                Ok(RunResult {
                    run_id,
                    importer_id: importer.id,
                    status: RunStatus::Failed,
                    total_count: total,
                    success_count: 0,
                })
            },
        }
    }

    /// Fetch, map/validate, stage, and build the checkpoint
    ///
    /// `total` is written through even on error so a failed attempt still
    /// reports how far it got.
    async fn extract_and_stage(
        &self,
        importer: &ImporterConfig,
        run_id: Uuid,
        total: &mut i64,
    ) -> Result<()> {
        let adapter = (self.registry)(importer.input_format);
        let attrs = AttributeStore::new(importer.attributes.clone());
        attrs.validate(&adapter.declare_schema())?;

        self.store.set_run_status(run_id, RunStatus::Running).await?;

        let mapper = RecordMapper::for_importer(importer, self.reference.clone());
        let fetch_budget = self.config.fetch_timeout();

        let consume = async {
            let extraction = adapter.extract(&attrs, &self.staging).await?;
            if let Some(rows) = extraction.source_rows {
                info!(run_id = %run_id, source_rows = rows, "Extraction started");
            }

            let mut records = extraction.records;
            let mut chunk: Vec<TargetRecord> = Vec::with_capacity(self.config.batch_size);
            let mut target_ids: Vec<RecordId> = Vec::new();
            let mut invalid: i64 = 0;

            while let Some(item) = records.next().await {
                let raw = item?;
                *total += 1;

                match mapper.map(&raw) {
                    Ok(record) => {
                        target_ids.push(record.key.clone());
                        chunk.push(record);
                        if chunk.len() >= self.config.batch_size {
                            self.store.stage_records(run_id, &chunk).await?;
                            chunk.clear();
                        }
                    },
                    Err(map_err) => {
                        invalid += 1;
                        self.store
                            .add_failure(RecordFailure::new(run_id, map_err.row, map_err.reason))
                            .await?;
                    },
                }
            }
            if !chunk.is_empty() {
                self.store.stage_records(run_id, &chunk).await?;
            }

            info!(
                run_id = %run_id,
                total = *total,
                valid = target_ids.len(),
                invalid,
                "Extraction completed"
            );

            // The checkpoint exists only once extraction completed; a
            // crash before this point leaves a fresh attempt.
            self.store.get_or_create_checkpoint(run_id).await?;
            self.store.merge_targets(run_id, &target_ids).await?;
            Ok(())
        };

        timeout(fetch_budget, consume).await.map_err(|_| {
            ImportError::Timeout(format!(
                "extraction exceeded {}s",
                self.config.fetch_timeout_secs
            ))
        })?
    }

    async fn persist_and_finalize(
        &self,
        importer: &ImporterConfig,
        run_id: Uuid,
        total: i64,
    ) -> Result<RunResult> {
        let checkpoint = self.store.get_or_create_checkpoint(run_id).await?;
        self.persist_remaining(run_id, &checkpoint).await?;
        self.finalize(importer, run_id, total).await
    }

    async fn resume_checkpoint(
        &self,
        importer: &ImporterConfig,
        run_id: Uuid,
        checkpoint: Checkpoint,
    ) -> Result<RunResult> {
        if checkpoint.done {
            info!(run_id = %run_id, "Checkpoint already done; nothing to resume");
            let run = self.store.run(run_id).await?;
            return Ok(RunResult::from_run(&run));
        }

        let run = self.store.run(run_id).await?;
        info!(
            run_id = %run_id,
            remaining = checkpoint.remaining().len(),
            "Resuming persistence from checkpoint"
        );

        self.store.set_run_status(run_id, RunStatus::Running).await?;
        self.persist_remaining(run_id, &checkpoint).await?;
        self.finalize(importer, run_id, run.total_count).await
    }

    /// Persist `target_ids - saved_ids` in deterministic batches
    ///
    /// Cancellation is checked between batches; a cancelled attempt keeps
    /// its checkpoint and finalizes as Failed-resumable.
    async fn persist_remaining(&self, run_id: Uuid, checkpoint: &Checkpoint) -> Result<()> {
        let remaining = checkpoint.remaining();
        if remaining.is_empty() {
            return Ok(());
        }

        let batches = remaining.chunks(self.config.batch_size);
        let batch_count = (remaining.len() + self.config.batch_size - 1) / self.config.batch_size;
        info!(run_id = %run_id, records = remaining.len(), batches = batch_count, "Persisting batches");

        for (index, batch) in batches.enumerate() {
            if self.cancel.is_cancelled() {
                warn!(run_id = %run_id, "Cancellation requested; stopping between batches");
                break;
            }

            let records = self.store.staged_records(run_id, batch).await?;

            // Ids with no staged payload cannot be persisted; explain them
            // in the note instead of stalling the run.
            if records.len() < batch.len() {
                let found: std::collections::BTreeSet<&RecordId> =
                    records.iter().map(|r| &r.key).collect();
                let missing: Vec<RecordId> = batch
                    .iter()
                    .filter(|id| !found.contains(id))
                    .cloned()
                    .collect();
                warn!(run_id = %run_id, missing = missing.len(), "Staged payloads missing");
                self.store
                    .annotate_checkpoint(run_id, &missing, "staged payload missing")
                    .await?;
            }

            if records.is_empty() {
                continue;
            }

            match self.write_batch_with_retry(&records).await {
                Ok(()) => {
                    let ids: Vec<RecordId> = records.iter().map(|r| r.key.clone()).collect();
                    self.store.append_saved(run_id, &ids).await?;
                    self.store.clear_notes(run_id, &ids).await?;
                    info!(run_id = %run_id, batch = index + 1, records = ids.len(), "Batch saved");
                },
                Err(e) => {
                    warn!(
                        run_id = %run_id,
                        batch = index + 1,
                        error = %e,
                        "Batch failed after retries; recording and moving on"
                    );
                    let ids: Vec<RecordId> = records.iter().map(|r| r.key.clone()).collect();
                    self.store
                        .annotate_checkpoint(run_id, &ids, &e.to_string())
                        .await?;
                },
            }
        }

        Ok(())
    }

    async fn write_batch_with_retry(&self, records: &[TargetRecord]) -> Result<()> {
        let mut attempt: u32 = 1;
        loop {
            let result = match timeout(
                self.config.write_timeout(),
                self.store.write_targets(records),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ImportError::Timeout(format!(
                    "batch write exceeded {}s",
                    self.config.write_timeout_secs
                ))),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    warn!(attempt, error = %e, "Batch write failed; backing off");
                    tokio::time::sleep(self.config.retry_backoff(attempt)).await;
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Terminal transition from the reloaded checkpoint
    async fn finalize(
        &self,
        importer: &ImporterConfig,
        run_id: Uuid,
        total: i64,
    ) -> Result<RunResult> {
        let checkpoint = self
            .store
            .checkpoint(run_id)
            .await?
            .ok_or_else(|| ImportError::Database(format!("checkpoint for run {run_id} vanished")))?;

        let success = checkpoint.saved_ids.len() as i64;

        let status = if checkpoint.is_complete() {
            self.store.mark_done(run_id).await?;
            self.store
                .finalize_run(run_id, RunStatus::Success, total, success)
                .await?;
            info!(run_id = %run_id, total, success, "Run succeeded");
            self.alert(
                importer,
                AlertEvent::Success,
                self.summary(importer, run_id, RunStatus::Success, total, success, None),
            );
            RunStatus::Success
        } else {
            let unsaved = checkpoint.remaining().len();
            self.store
                .finalize_run(run_id, RunStatus::Failed, total, success)
                .await?;
            warn!(run_id = %run_id, unsaved, "Run failed with unsaved records; checkpoint kept for resume");
            self.alert(
                importer,
                AlertEvent::Failure,
                self.summary(
                    importer,
                    run_id,
                    RunStatus::Failed,
                    total,
                    success,
                    Some(format!("{unsaved} records unsaved; see checkpoint note")),
                ),
            );
            RunStatus::Failed
        };

        Ok(RunResult {
            run_id,
            importer_id: importer.id,
            status,
            total_count: total,
            success_count: success,
        })
    }

    // ======================================================================
    // Alerts
    // ======================================================================

    fn summary(
        &self,
        importer: &ImporterConfig,
        run_id: Uuid,
        status: RunStatus,
        total: i64,
        success: i64,
        error: Option<String>,
    ) -> RunSummary {
        RunSummary {
            run_id,
            importer_id: importer.id,
            importer_name: importer.name.clone(),
            status,
            total_count: total,
            success_count: success,
            error,
        }
    }

    /// Fire-and-forget; notifier failures never touch the run
    fn alert(&self, importer: &ImporterConfig, event: AlertEvent, summary: RunSummary) {
        let recipients = recipients_for(&importer.alerts, event);
        if recipients.is_empty() {
            return;
        }

        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(event, &recipients, &summary).await {
                warn!(
                    event = event.as_str(),
                    run_id = %summary.run_id,
                    error = %e,
                    "Alert notification failed"
                );
            }
        });
    }
}
