//! Run and audit models
//!
//! A `Run` tracks one execution attempt of an importer through the
//! Start -> Running -> {Success, Failed} state machine. `RecordFailure`
//! rows hold the per-record detail behind a run's counts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Run lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Start,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Start => "start",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    /// Whether the run reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }
}

impl From<String> for RunStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => RunStatus::Running,
            "success" => RunStatus::Success,
            "failed" => RunStatus::Failed,
            _ => RunStatus::Start,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution attempt of an importer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub importer_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Records seen by the mapper (valid and invalid)
    pub total_count: i64,
    /// Records durably saved to the target store
    pub success_count: i64,
}

impl Run {
    pub fn new(importer_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            importer_id,
            status: RunStatus::Start,
            started_at: Utc::now(),
            finished_at: None,
            total_count: 0,
            success_count: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Outcome of a `run` or `resume` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub importer_id: Uuid,
    pub status: RunStatus,
    pub total_count: i64,
    pub success_count: i64,
}

impl RunResult {
    pub fn from_run(run: &Run) -> Self {
        Self {
            run_id: run.id,
            importer_id: run.importer_id,
            status: run.status,
            total_count: run.total_count,
            success_count: run.success_count,
        }
    }
}

/// Summary handed to alert notifiers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub importer_id: Uuid,
    pub importer_name: String,
    pub status: RunStatus,
    pub total_count: i64,
    pub success_count: i64,
    pub error: Option<String>,
}

/// Per-record failure detail, retrievable for any run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordFailure {
    pub run_id: Uuid,
    /// Source row reference (row number or source key)
    pub row: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl RecordFailure {
    pub fn new(run_id: Uuid, row: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            run_id,
            row: row.into(),
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }
}

/// Who gets notified about which run lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub recipient: String,
    #[serde(default)]
    pub on_start: bool,
    #[serde(default)]
    pub on_success: bool,
    #[serde(default)]
    pub on_failure: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_round_trip() {
        for status in [
            RunStatus::Start,
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::from(status.as_str().to_string()), status);
        }
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(!RunStatus::Start.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn test_new_run() {
        let importer_id = Uuid::new_v4();
        let run = Run::new(importer_id);
        assert_eq!(run.importer_id, importer_id);
        assert_eq!(run.status, RunStatus::Start);
        assert!(run.finished_at.is_none());
        assert!(!run.is_finished());
    }

    #[test]
    fn test_run_result_from_run() {
        let mut run = Run::new(Uuid::new_v4());
        run.status = RunStatus::Success;
        run.total_count = 10;
        run.success_count = 9;

        let result = RunResult::from_run(&run);
        assert_eq!(result.run_id, run.id);
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.total_count, 10);
        assert_eq!(result.success_count, 9);
    }
}
