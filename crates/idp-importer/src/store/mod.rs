//! Persistence boundary
//!
//! `ImportStore` is the single durable surface the orchestrator talks to:
//! importer definitions, runs, per-record failures, staged records,
//! checkpoints, and the target table. Checkpoint mutations are atomic per
//! call so concurrently completing batches cannot lose updates.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::ImporterConfig;
use crate::mapper::{RecordId, TargetRecord};
use crate::models::{RecordFailure, Run, RunStatus};
use crate::progress::Checkpoint;
use idp_common::Result;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait ImportStore: Send + Sync {
    // ------------------------------------------------------------------
    // Importer definitions (written by the external admin surface)
    // ------------------------------------------------------------------

    /// Load an importer definition
    ///
    /// # Errors
    ///
    /// `Configuration` when no importer with this id exists.
    async fn importer(&self, id: Uuid) -> Result<ImporterConfig>;

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    async fn create_run(&self, importer_id: Uuid) -> Result<Run>;

    async fn run(&self, id: Uuid) -> Result<Run>;

    async fn set_run_status(&self, id: Uuid, status: RunStatus) -> Result<()>;

    /// Update counts; pass the values the run should now report
    async fn set_run_counts(&self, id: Uuid, total: i64, success: i64) -> Result<()>;

    /// Terminal transition: set status, counts, and `finished_at`
    async fn finalize_run(
        &self,
        id: Uuid,
        status: RunStatus,
        total: i64,
        success: i64,
    ) -> Result<()>;

    /// Operational visibility: runs for an importer, optionally by status
    async fn runs_by_importer(
        &self,
        importer_id: Uuid,
        status: Option<RunStatus>,
    ) -> Result<Vec<Run>>;

    // ------------------------------------------------------------------
    // Per-record failure log
    // ------------------------------------------------------------------

    async fn add_failure(&self, failure: RecordFailure) -> Result<()>;

    async fn failures(&self, run_id: Uuid) -> Result<Vec<RecordFailure>>;

    // ------------------------------------------------------------------
    // Staged records (normalized payloads awaiting persistence)
    // ------------------------------------------------------------------

    async fn stage_records(&self, run_id: Uuid, records: &[TargetRecord]) -> Result<()>;

    async fn staged_records(&self, run_id: Uuid, ids: &[RecordId]) -> Result<Vec<TargetRecord>>;

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    async fn get_or_create_checkpoint(&self, log_id: Uuid) -> Result<Checkpoint>;

    async fn checkpoint(&self, log_id: Uuid) -> Result<Option<Checkpoint>>;

    /// Append-only merge into `target_ids`
    async fn merge_targets(&self, log_id: Uuid, ids: &[RecordId]) -> Result<()>;

    /// Atomic append to `saved_ids`; ids outside `target_ids` are ignored
    async fn append_saved(&self, log_id: Uuid, ids: &[RecordId]) -> Result<()>;

    async fn annotate_checkpoint(
        &self,
        log_id: Uuid,
        ids: &[RecordId],
        reason: &str,
    ) -> Result<()>;

    async fn clear_notes(&self, log_id: Uuid, ids: &[RecordId]) -> Result<()>;

    /// Set `done = true`; stores guard on `saved_ids` covering `target_ids`
    async fn mark_done(&self, log_id: Uuid) -> Result<()>;

    /// Runs whose checkpoints are not done, for the resume sweep
    async fn incomplete_checkpoints(&self) -> Result<Vec<Uuid>>;

    // ------------------------------------------------------------------
    // Target records
    // ------------------------------------------------------------------

    /// Idempotent upsert keyed by `RecordId`; last write wins
    async fn write_targets(&self, records: &[TargetRecord]) -> Result<()>;
}
