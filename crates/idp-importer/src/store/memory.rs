//! In-memory store
//!
//! Backs tests and dry runs with the same semantics as the Postgres
//! store: every checkpoint mutation happens under one lock, so the
//! subset and monotonicity invariants hold under concurrent batch
//! completions.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::ImportStore;
use crate::config::ImporterConfig;
use crate::mapper::{RecordId, TargetRecord};
use crate::models::{RecordFailure, Run, RunStatus};
use crate::progress::Checkpoint;
use idp_common::{ImportError, Result};

#[derive(Default)]
struct Inner {
    importers: HashMap<Uuid, ImporterConfig>,
    runs: HashMap<Uuid, Run>,
    failures: Vec<RecordFailure>,
    staged: HashMap<(Uuid, RecordId), TargetRecord>,
    checkpoints: HashMap<Uuid, Checkpoint>,
    targets: BTreeMap<RecordId, TargetRecord>,
}

/// Store holding everything in process memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an importer definition (test/admin surface)
    pub async fn insert_importer(&self, config: ImporterConfig) {
        self.inner.lock().await.importers.insert(config.id, config);
    }

    /// Number of target records currently persisted
    pub async fn target_count(&self) -> usize {
        self.inner.lock().await.targets.len()
    }

    /// Fetch one persisted target record
    pub async fn target(&self, key: &RecordId) -> Option<TargetRecord> {
        self.inner.lock().await.targets.get(key).cloned()
    }

    /// All persisted target keys, in key order
    pub async fn target_keys(&self) -> Vec<RecordId> {
        self.inner.lock().await.targets.keys().cloned().collect()
    }
}

#[async_trait]
impl ImportStore for MemoryStore {
    async fn importer(&self, id: Uuid) -> Result<ImporterConfig> {
        self.inner
            .lock()
            .await
            .importers
            .get(&id)
            .cloned()
            .ok_or_else(|| ImportError::Configuration(format!("unknown importer {id}")))
    }

    async fn create_run(&self, importer_id: Uuid) -> Result<Run> {
        let run = Run::new(importer_id);
        self.inner.lock().await.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn run(&self, id: Uuid) -> Result<Run> {
        self.inner
            .lock()
            .await
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| ImportError::Configuration(format!("unknown run {id}")))
    }

    async fn set_run_status(&self, id: Uuid, status: RunStatus) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let run = inner
            .runs
            .get_mut(&id)
            .ok_or_else(|| ImportError::Configuration(format!("unknown run {id}")))?;
        run.status = status;
        Ok(())
    }

    async fn set_run_counts(&self, id: Uuid, total: i64, success: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let run = inner
            .runs
            .get_mut(&id)
            .ok_or_else(|| ImportError::Configuration(format!("unknown run {id}")))?;
        run.total_count = total;
        run.success_count = success;
        Ok(())
    }

    async fn finalize_run(
        &self,
        id: Uuid,
        status: RunStatus,
        total: i64,
        success: i64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let run = inner
            .runs
            .get_mut(&id)
            .ok_or_else(|| ImportError::Configuration(format!("unknown run {id}")))?;
        run.status = status;
        run.total_count = total;
        run.success_count = success;
        run.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn runs_by_importer(
        &self,
        importer_id: Uuid,
        status: Option<RunStatus>,
    ) -> Result<Vec<Run>> {
        let inner = self.inner.lock().await;
        let mut runs: Vec<Run> = inner
            .runs
            .values()
            .filter(|r| r.importer_id == importer_id)
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }

    async fn add_failure(&self, failure: RecordFailure) -> Result<()> {
        self.inner.lock().await.failures.push(failure);
        Ok(())
    }

    async fn failures(&self, run_id: Uuid) -> Result<Vec<RecordFailure>> {
        Ok(self
            .inner
            .lock()
            .await
            .failures
            .iter()
            .filter(|f| f.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn stage_records(&self, run_id: Uuid, records: &[TargetRecord]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for record in records {
            inner
                .staged
                .insert((run_id, record.key.clone()), record.clone());
        }
        Ok(())
    }

    async fn staged_records(&self, run_id: Uuid, ids: &[RecordId]) -> Result<Vec<TargetRecord>> {
        let inner = self.inner.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.staged.get(&(run_id, id.clone())).cloned())
            .collect())
    }

    async fn get_or_create_checkpoint(&self, log_id: Uuid) -> Result<Checkpoint> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .checkpoints
            .entry(log_id)
            .or_insert_with(|| Checkpoint::new(log_id))
            .clone())
    }

    async fn checkpoint(&self, log_id: Uuid) -> Result<Option<Checkpoint>> {
        Ok(self.inner.lock().await.checkpoints.get(&log_id).cloned())
    }

    async fn merge_targets(&self, log_id: Uuid, ids: &[RecordId]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let checkpoint = inner
            .checkpoints
            .get_mut(&log_id)
            .ok_or_else(|| ImportError::Database(format!("no checkpoint for run {log_id}")))?;
        checkpoint.merge_targets(ids.iter().cloned());
        Ok(())
    }

    async fn append_saved(&self, log_id: Uuid, ids: &[RecordId]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let checkpoint = inner
            .checkpoints
            .get_mut(&log_id)
            .ok_or_else(|| ImportError::Database(format!("no checkpoint for run {log_id}")))?;
        checkpoint.append_saved(ids);
        Ok(())
    }

    async fn annotate_checkpoint(
        &self,
        log_id: Uuid,
        ids: &[RecordId],
        reason: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let checkpoint = inner
            .checkpoints
            .get_mut(&log_id)
            .ok_or_else(|| ImportError::Database(format!("no checkpoint for run {log_id}")))?;
        checkpoint.annotate(ids, reason);
        Ok(())
    }

    async fn clear_notes(&self, log_id: Uuid, ids: &[RecordId]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(checkpoint) = inner.checkpoints.get_mut(&log_id) {
            checkpoint.clear_notes(ids);
        }
        Ok(())
    }

    async fn mark_done(&self, log_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let checkpoint = inner
            .checkpoints
            .get_mut(&log_id)
            .ok_or_else(|| ImportError::Database(format!("no checkpoint for run {log_id}")))?;
        if checkpoint.is_complete() {
            checkpoint.done = true;
        }
        Ok(())
    }

    async fn incomplete_checkpoints(&self) -> Result<Vec<Uuid>> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<Uuid> = inner
            .checkpoints
            .values()
            .filter(|c| !c.done)
            .map(|c| c.log_id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn write_targets(&self, records: &[TargetRecord]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for record in records {
            inner.targets.insert(record.key.clone(), record.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ImportType, InputFormat};
    use serde_json::json;

    fn importer() -> ImporterConfig {
        ImporterConfig {
            id: Uuid::new_v4(),
            name: "m".into(),
            import_type: ImportType::IndicatorValue,
            input_format: InputFormat::CsvHttp,
            reference_dataset: None,
            admin_code_type: "pcode".into(),
            schedule: None,
            run_on_create: false,
            attributes: Default::default(),
            mappings: Default::default(),
            key_fields: Vec::new(),
            date_format: None,
            alerts: Vec::new(),
        }
    }

    fn record(n: u32) -> TargetRecord {
        TargetRecord {
            key: RecordId::from_natural_key([n.to_string().as_str()]),
            kind: ImportType::IndicatorValue,
            geography_id: Uuid::new_v4(),
            indicator: Some("POP".into()),
            period: Some("2021".into()),
            value: Some(n as f64),
            data: json!({}),
        }
    }

    #[tokio::test]
    async fn test_importer_lookup() {
        let store = MemoryStore::new();
        let config = importer();
        let id = config.id;
        store.insert_importer(config).await;

        assert!(store.importer(id).await.is_ok());
        assert!(matches!(
            store.importer(Uuid::new_v4()).await,
            Err(ImportError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_operations_preserve_invariant() {
        let store = MemoryStore::new();
        let run = store.create_run(Uuid::new_v4()).await.unwrap();

        store.get_or_create_checkpoint(run.id).await.unwrap();
        let ids: Vec<RecordId> = (0..3).map(|n| record(n).key).collect();
        store.merge_targets(run.id, &ids).await.unwrap();

        // Appending a foreign id must not break the subset invariant
        let foreign = RecordId::from_natural_key(["foreign"]);
        store
            .append_saved(run.id, &[ids[0].clone(), foreign])
            .await
            .unwrap();

        let checkpoint = store.checkpoint(run.id).await.unwrap().unwrap();
        assert!(checkpoint.invariant_holds());
        assert_eq!(checkpoint.saved_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_done_requires_completion() {
        let store = MemoryStore::new();
        let run = store.create_run(Uuid::new_v4()).await.unwrap();

        store.get_or_create_checkpoint(run.id).await.unwrap();
        let ids: Vec<RecordId> = (0..2).map(|n| record(n).key).collect();
        store.merge_targets(run.id, &ids).await.unwrap();

        store.mark_done(run.id).await.unwrap();
        assert!(!store.checkpoint(run.id).await.unwrap().unwrap().done);

        store.append_saved(run.id, &ids).await.unwrap();
        store.mark_done(run.id).await.unwrap();
        assert!(store.checkpoint(run.id).await.unwrap().unwrap().done);
    }

    #[tokio::test]
    async fn test_write_targets_is_idempotent_upsert() {
        let store = MemoryStore::new();
        let mut a = record(1);
        store.write_targets(&[a.clone()]).await.unwrap();

        a.value = Some(99.0);
        store.write_targets(&[a.clone()]).await.unwrap();

        assert_eq!(store.target_count().await, 1);
        assert_eq!(store.target(&a.key).await.unwrap().value, Some(99.0));
    }

    #[tokio::test]
    async fn test_staged_records_round_trip() {
        let store = MemoryStore::new();
        let run = store.create_run(Uuid::new_v4()).await.unwrap();
        let records = vec![record(1), record(2)];
        store.stage_records(run.id, &records).await.unwrap();

        let fetched = store
            .staged_records(run.id, &[records[1].key.clone()])
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].key, records[1].key);

        // Staged payloads are scoped per run
        let other = store.create_run(Uuid::new_v4()).await.unwrap();
        assert!(store
            .staged_records(other.id, &[records[0].key.clone()])
            .await
            .unwrap()
            .is_empty());
    }
}
