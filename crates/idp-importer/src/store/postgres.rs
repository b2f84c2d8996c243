//! Postgres store
//!
//! All importer state lives in Postgres; see the migrations for the
//! schema. Checkpoint mutations are single statements so concurrently
//! completing batches cannot lose updates, and `saved_ids` can never
//! escape `target_ids` (the append filters against it, `mark_done`
//! guards on coverage).

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

use super::ImportStore;
use crate::config::{ImportType, ImporterConfig, InputFormat};
use crate::mapper::{RecordId, TargetRecord};
use crate::models::{RecordFailure, Run, RunStatus};
use crate::progress::Checkpoint;
use idp_common::{ImportError, Result};

#[derive(Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Connect and run pending migrations
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(db_err)?;

        let store = Self::new(Arc::new(pool));
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| ImportError::Database(e.to_string()))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Load one named reference hierarchy into memory for code resolution
    pub async fn load_reference(&self, dataset: &str) -> Result<crate::reference::InMemoryReference> {
        let rows = sqlx::query(
            r#"
            SELECT id, code_type, code, name, level
            FROM geographies
            WHERE dataset = $1
            "#,
        )
        .bind(dataset)
        .fetch_all(&*self.pool)
        .await
        .map_err(db_err)?;

        let mut reference = crate::reference::InMemoryReference::new(dataset);
        for row in &rows {
            let code_type: String = row.try_get("code_type").map_err(db_err)?;
            reference.insert(
                &code_type,
                crate::reference::GeoEntity {
                    id: row.try_get("id").map_err(db_err)?,
                    code: row.try_get("code").map_err(db_err)?,
                    name: row.try_get("name").map_err(db_err)?,
                    level: row.try_get("level").map_err(db_err)?,
                },
            );
        }
        Ok(reference)
    }
}

#[async_trait]
impl ImportStore for PgStore {
    async fn importer(&self, id: Uuid) -> Result<ImporterConfig> {
        let row = sqlx::query(
            r#"
            SELECT id, name, import_type, input_format, reference_dataset,
                   admin_code_type, schedule, run_on_create, attributes,
                   mappings, key_fields, date_format, alerts
            FROM importers
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ImportError::Configuration(format!("unknown importer {id}")))?;

        row_to_importer(&row)
    }

    async fn create_run(&self, importer_id: Uuid) -> Result<Run> {
        let run = Run::new(importer_id);

        sqlx::query(
            r#"
            INSERT INTO import_runs (id, importer_id, status, started_at, total_count, success_count)
            VALUES ($1, $2, $3, $4, 0, 0)
            "#,
        )
        .bind(run.id)
        .bind(run.importer_id)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .execute(&*self.pool)
        .await
        .map_err(db_err)?;

        Ok(run)
    }

    async fn run(&self, id: Uuid) -> Result<Run> {
        let row = sqlx::query(
            r#"
            SELECT id, importer_id, status, started_at, finished_at, total_count, success_count
            FROM import_runs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ImportError::Configuration(format!("unknown run {id}")))?;

        row_to_run(&row)
    }

    async fn set_run_status(&self, id: Uuid, status: RunStatus) -> Result<()> {
        sqlx::query("UPDATE import_runs SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&*self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_run_counts(&self, id: Uuid, total: i64, success: i64) -> Result<()> {
        sqlx::query("UPDATE import_runs SET total_count = $1, success_count = $2 WHERE id = $3")
            .bind(total)
            .bind(success)
            .bind(id)
            .execute(&*self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn finalize_run(
        &self,
        id: Uuid,
        status: RunStatus,
        total: i64,
        success: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE import_runs
            SET status = $1, total_count = $2, success_count = $3, finished_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(status.as_str())
        .bind(total)
        .bind(success)
        .bind(id)
        .execute(&*self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn runs_by_importer(
        &self,
        importer_id: Uuid,
        status: Option<RunStatus>,
    ) -> Result<Vec<Run>> {
        let rows = sqlx::query(
            r#"
            SELECT id, importer_id, status, started_at, finished_at, total_count, success_count
            FROM import_runs
            WHERE importer_id = $1
              AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY started_at
            "#,
        )
        .bind(importer_id)
        .bind(status.map(|s| s.as_str().to_string()))
        .fetch_all(&*self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_run).collect()
    }

    async fn add_failure(&self, failure: RecordFailure) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO import_record_failures (run_id, row_ref, reason, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(failure.run_id)
        .bind(&failure.row)
        .bind(&failure.reason)
        .bind(failure.created_at)
        .execute(&*self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn failures(&self, run_id: Uuid) -> Result<Vec<RecordFailure>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, row_ref, reason, created_at
            FROM import_record_failures
            WHERE run_id = $1
            ORDER BY id
            "#,
        )
        .bind(run_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                Ok(RecordFailure {
                    run_id: row.try_get("run_id").map_err(db_err)?,
                    row: row.try_get("row_ref").map_err(db_err)?,
                    reason: row.try_get("reason").map_err(db_err)?,
                    created_at: row.try_get("created_at").map_err(db_err)?,
                })
            })
            .collect()
    }

    async fn stage_records(&self, run_id: Uuid, records: &[TargetRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO import_staged_records (run_id, record_key, payload)
                VALUES ($1, $2, $3)
                ON CONFLICT (run_id, record_key) DO UPDATE SET payload = EXCLUDED.payload
                "#,
            )
            .bind(run_id)
            .bind(record.key.as_str())
            .bind(serde_json::to_value(record)?)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn staged_records(&self, run_id: Uuid, ids: &[RecordId]) -> Result<Vec<TargetRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT payload
            FROM import_staged_records
            WHERE run_id = $1 AND record_key = ANY($2)
            ORDER BY record_key
            "#,
        )
        .bind(run_id)
        .bind(id_strings(ids))
        .fetch_all(&*self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let payload: Value = row.try_get("payload").map_err(db_err)?;
                Ok(serde_json::from_value(payload)?)
            })
            .collect()
    }

    async fn get_or_create_checkpoint(&self, log_id: Uuid) -> Result<Checkpoint> {
        sqlx::query(
            r#"
            INSERT INTO import_checkpoints (log_id)
            VALUES ($1)
            ON CONFLICT (log_id) DO NOTHING
            "#,
        )
        .bind(log_id)
        .execute(&*self.pool)
        .await
        .map_err(db_err)?;

        self.checkpoint(log_id)
            .await?
            .ok_or_else(|| ImportError::Database(format!("checkpoint for run {log_id} vanished")))
    }

    async fn checkpoint(&self, log_id: Uuid) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"
            SELECT target_ids, saved_ids, note, done
            FROM import_checkpoints
            WHERE log_id = $1
            "#,
        )
        .bind(log_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(db_err)?;

        row.map(|row| row_to_checkpoint(log_id, &row)).transpose()
    }

    async fn merge_targets(&self, log_id: Uuid, ids: &[RecordId]) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE import_checkpoints
            SET target_ids = (
                    SELECT COALESCE(ARRAY_AGG(DISTINCT v), '{}')
                    FROM UNNEST(target_ids || $2::TEXT[]) AS v
                ),
                updated_at = NOW()
            WHERE log_id = $1
            "#,
        )
        .bind(log_id)
        .bind(id_strings(ids))
        .execute(&*self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn append_saved(&self, log_id: Uuid, ids: &[RecordId]) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE import_checkpoints
            SET saved_ids = (
                    SELECT COALESCE(ARRAY_AGG(DISTINCT v), '{}')
                    FROM UNNEST(saved_ids || $2::TEXT[]) AS v
                    WHERE v = ANY(target_ids)
                ),
                updated_at = NOW()
            WHERE log_id = $1
            "#,
        )
        .bind(log_id)
        .bind(id_strings(ids))
        .execute(&*self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn annotate_checkpoint(
        &self,
        log_id: Uuid,
        ids: &[RecordId],
        reason: &str,
    ) -> Result<()> {
        let notes: serde_json::Map<String, Value> = ids
            .iter()
            .map(|id| (id.as_str().to_string(), Value::String(reason.to_string())))
            .collect();

        sqlx::query(
            r#"
            UPDATE import_checkpoints
            SET note = note || $2::JSONB, updated_at = NOW()
            WHERE log_id = $1
            "#,
        )
        .bind(log_id)
        .bind(Value::Object(notes))
        .execute(&*self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn clear_notes(&self, log_id: Uuid, ids: &[RecordId]) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE import_checkpoints
            SET note = note - $2::TEXT[], updated_at = NOW()
            WHERE log_id = $1
            "#,
        )
        .bind(log_id)
        .bind(id_strings(ids))
        .execute(&*self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn mark_done(&self, log_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE import_checkpoints
            SET done = TRUE, updated_at = NOW()
            WHERE log_id = $1 AND saved_ids @> target_ids
            "#,
        )
        .bind(log_id)
        .execute(&*self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn incomplete_checkpoints(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT log_id
            FROM import_checkpoints
            WHERE done = FALSE
            ORDER BY updated_at
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| row.try_get("log_id").map_err(db_err))
            .collect()
    }

    async fn write_targets(&self, records: &[TargetRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO import_target_records
                    (record_key, kind, geography_id, indicator, period, value, data, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
                ON CONFLICT (record_key) DO UPDATE SET
                    kind = EXCLUDED.kind,
                    geography_id = EXCLUDED.geography_id,
                    indicator = EXCLUDED.indicator,
                    period = EXCLUDED.period,
                    value = EXCLUDED.value,
                    data = EXCLUDED.data,
                    updated_at = NOW()
                "#,
            )
            .bind(record.key.as_str())
            .bind(record.kind.as_str())
            .bind(record.geography_id)
            .bind(record.indicator.as_deref())
            .bind(record.period.as_deref())
            .bind(record.value)
            .bind(&record.data)
            .execute(&mut *tx)
            .await
            .map_err(write_err)?;
        }

        tx.commit().await.map_err(write_err)?;
        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> ImportError {
    ImportError::Database(e.to_string())
}

/// Target writes surface as persistence errors so the orchestrator can
/// apply its batch retry policy; constraint violations are permanent.
fn write_err(e: sqlx::Error) -> ImportError {
    match &e {
        sqlx::Error::Database(db) if db.constraint().is_some() => {
            ImportError::persistence_permanent(e.to_string())
        },
        _ => ImportError::persistence(e.to_string()),
    }
}

fn id_strings(ids: &[RecordId]) -> Vec<String> {
    ids.iter().map(|id| id.as_str().to_string()).collect()
}

fn row_to_importer(row: &PgRow) -> Result<ImporterConfig> {
    let import_type: String = row.try_get("import_type").map_err(db_err)?;
    let input_format: String = row.try_get("input_format").map_err(db_err)?;
    let input_format: InputFormat = input_format
        .parse()
        .map_err(|e: anyhow::Error| ImportError::Configuration(e.to_string()))?;

    let attributes: Value = row.try_get("attributes").map_err(db_err)?;
    let mappings: Value = row.try_get("mappings").map_err(db_err)?;
    let key_fields: Value = row.try_get("key_fields").map_err(db_err)?;
    let alerts: Value = row.try_get("alerts").map_err(db_err)?;

    Ok(ImporterConfig {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        import_type: ImportType::from(import_type),
        input_format,
        reference_dataset: row.try_get("reference_dataset").map_err(db_err)?,
        admin_code_type: row.try_get("admin_code_type").map_err(db_err)?,
        schedule: row.try_get("schedule").map_err(db_err)?,
        run_on_create: row.try_get("run_on_create").map_err(db_err)?,
        attributes: serde_json::from_value(attributes)?,
        mappings: serde_json::from_value(mappings)?,
        key_fields: serde_json::from_value(key_fields)?,
        date_format: row.try_get("date_format").map_err(db_err)?,
        alerts: serde_json::from_value(alerts)?,
    })
}

fn row_to_run(row: &PgRow) -> Result<Run> {
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(Run {
        id: row.try_get("id").map_err(db_err)?,
        importer_id: row.try_get("importer_id").map_err(db_err)?,
        status: RunStatus::from(status),
        started_at: row.try_get("started_at").map_err(db_err)?,
        finished_at: row.try_get("finished_at").map_err(db_err)?,
        total_count: row.try_get("total_count").map_err(db_err)?,
        success_count: row.try_get("success_count").map_err(db_err)?,
    })
}

fn row_to_checkpoint(log_id: Uuid, row: &PgRow) -> Result<Checkpoint> {
    let target_ids: Vec<String> = row.try_get("target_ids").map_err(db_err)?;
    let saved_ids: Vec<String> = row.try_get("saved_ids").map_err(db_err)?;
    let note: Value = row.try_get("note").map_err(db_err)?;

    Ok(Checkpoint {
        log_id,
        target_ids: to_id_set(target_ids),
        saved_ids: to_id_set(saved_ids),
        note: parse_note(note),
        done: row.try_get("done").map_err(db_err)?,
    })
}

fn to_id_set(raw: Vec<String>) -> BTreeSet<RecordId> {
    raw.into_iter().map(RecordId::from_raw).collect()
}

fn parse_note(note: Value) -> BTreeMap<RecordId, String> {
    match note {
        Value::Object(map) => map
            .into_iter()
            .filter_map(|(key, value)| match value {
                Value::String(reason) => Some((RecordId::from_raw(key), reason)),
                _ => None,
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}
