use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Task id under which process start markers are written.
pub const SERVICE_TASK_ID: &str = "lifecycle-service";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunStatus {
    Started,
    Completed,
    Error,
    Recovered,
    ServiceStarted,
}

impl TaskRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Recovered => "recovered",
            Self::ServiceStarted => "service_started",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "started" => Some(Self::Started),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "recovered" => Some(Self::Recovered),
            "service_started" => Some(Self::ServiceStarted),
            _ => None,
        }
    }
}

/// Append-only audit entry for one step of one task run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionRecord {
    pub record_id: String,
    pub task_id: String,
    /// Shared by the `started` and terminal records of the same run.
    pub run_id: String,
    pub status: TaskRunStatus,
    pub at: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub details: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Schedule,
    Manual,
    Recovery,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Manual => "manual",
            Self::Recovery => "recovery",
        }
    }
}

/// Terminal result of one execution as seen by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed {
        run_id: String,
        duration_ms: i64,
        summary: Value,
    },
    Failed {
        run_id: String,
        duration_ms: i64,
        error: String,
    },
    /// A run for the same task id was already in flight.
    SkippedOverlap,
    /// Another instance holds the task lease.
    SkippedLeaseHeld,
    /// The lease could not be checked, so the handler was not run. An ERROR
    /// record carries `run_id`.
    LeaseUnavailable { run_id: String, error: String },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: String,
    pub description: String,
    pub cron: String,
    pub timezone: String,
    pub enabled: bool,
    pub running: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_record: Option<TaskExecutionRecord>,
    pub history: Vec<TaskExecutionRecord>,
}
