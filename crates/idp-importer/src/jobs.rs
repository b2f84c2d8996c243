//! Job definitions for the import queue
//!
//! `ImportJob` is the work item external schedulers enqueue; one job is
//! one run attempt (or one resume, when `log_id` is set).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Import job payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJob {
    /// Importer to execute
    pub importer_id: Uuid,
    /// Resume this run's checkpoint instead of starting fresh
    pub log_id: Option<Uuid>,
    /// Who or what queued the job ("schedule", "manual", a user id)
    pub triggered_by: Option<String>,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
}

impl ImportJob {
    /// Create a fresh-run job
    pub fn new(importer_id: Uuid) -> Self {
        Self {
            importer_id,
            log_id: None,
            triggered_by: None,
            created_at: Utc::now(),
        }
    }

    /// Create a job that resumes an existing run
    pub fn resume_of(importer_id: Uuid, log_id: Uuid) -> Self {
        Self {
            importer_id,
            log_id: Some(log_id),
            triggered_by: None,
            created_at: Utc::now(),
        }
    }

    /// Record who triggered this job
    pub fn with_triggered_by(mut self, trigger: impl Into<String>) -> Self {
        self.triggered_by = Some(trigger.into());
        self
    }

    /// Whether this job resumes an earlier run
    pub fn is_resume(&self) -> bool {
        self.log_id.is_some()
    }
}
