//! Persisted task model.
//!
//! [`QueuedTask`] is the durable record behind every dispatched task, with
//! append-only [`StatusAudit`] / [`RunsAudit`] history and captured
//! [`TaskExecutionLog`] lines. All instants are UTC; ids are time-ordered
//! v7 UUIDs so `(created_at_utc, id)` is a stable total order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

/// Lifecycle status of a queued task.
///
/// `WaitingQueue → Queued → InProgress → {Completed | Failed | Cancelled |
/// ServiceStopped | Pending}`. `Pending` is the between-runs state of a
/// recurring task waiting in the scheduler for its next occurrence.
/// `Completed`, `Failed` and `Cancelled` are terminal for non-recurring
/// tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    WaitingQueue,
    Queued,
    InProgress,
    Pending,
    Cancelled,
    Completed,
    Failed,
    ServiceStopped,
}

impl TaskStatus {
    /// Terminal states: no further transitions for non-recurring tasks.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// States the recovery service resumes after a restart.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            TaskStatus::Queued
                | TaskStatus::Pending
                | TaskStatus::InProgress
                | TaskStatus::ServiceStopped
        )
    }
}

/// How much audit history is written per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    /// Record every status transition and every run.
    #[default]
    Full,
    /// Record only failures and service stops for status audits, all runs.
    Minimal,
    /// Record only failures in both audit collections.
    ErrorsOnly,
    /// Suppress all audits.
    None,
}

impl AuditLevel {
    /// Whether a status transition to `status` should append a [`StatusAudit`].
    pub fn records_status(&self, status: TaskStatus) -> bool {
        match self {
            AuditLevel::Full => true,
            AuditLevel::Minimal => {
                matches!(status, TaskStatus::Failed | TaskStatus::ServiceStopped)
            }
            AuditLevel::ErrorsOnly => matches!(status, TaskStatus::Failed),
            AuditLevel::None => false,
        }
    }

    /// Whether a completed run with `status` should append a [`RunsAudit`].
    pub fn records_run(&self, status: TaskStatus) -> bool {
        match self {
            AuditLevel::Full | AuditLevel::Minimal => true,
            AuditLevel::ErrorsOnly => matches!(status, TaskStatus::Failed),
            AuditLevel::None => false,
        }
    }
}

/// Level of a captured handler log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Information,
    Warning,
    Error,
}

// ============================================================================
// Task record
// ============================================================================

/// The persisted record behind a dispatched task.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct QueuedTask {
    /// Time-ordered unique id; the handle returned from dispatch.
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,

    #[builder(default = Utc::now())]
    pub created_at_utc: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub last_execution_utc: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub scheduled_execution_utc: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub next_run_utc: Option<DateTime<Utc>>,

    /// Registered task type name.
    pub task_type: String,
    /// Serialized request payload (JSON).
    pub request: String,
    /// Handler type name, for diagnostics and monitoring.
    pub handler: String,

    #[builder(default)]
    pub status: TaskStatus,
    /// Last error in detailed textual form (message plus cause chain).
    #[builder(default, setter(strip_option))]
    pub exception: Option<String>,

    #[builder(default = false)]
    pub is_recurring: bool,
    /// Serialized recurrence spec (JSON), present when `is_recurring`.
    #[builder(default, setter(strip_option))]
    pub recurring_task: Option<String>,
    /// Human-readable summary of the recurrence spec.
    #[builder(default, setter(strip_option))]
    pub recurring_info: Option<String>,
    #[builder(default, setter(strip_option))]
    pub current_run_count: Option<u32>,
    #[builder(default, setter(strip_option))]
    pub max_runs: Option<u32>,
    #[builder(default, setter(strip_option))]
    pub run_until: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub queue_name: Option<String>,
    /// Optional idempotency key; identifies at most one task.
    #[builder(default, setter(strip_option))]
    pub task_key: Option<String>,

    #[builder(default)]
    pub status_audits: Vec<StatusAudit>,
    #[builder(default)]
    pub runs_audits: Vec<RunsAudit>,
}

impl QueuedTask {
    /// Whether the recurring series has runs remaining.
    pub fn has_runs_remaining(&self) -> bool {
        match self.max_runs {
            None => true,
            Some(max) => self.current_run_count.unwrap_or(0) < max,
        }
    }
}

// ============================================================================
// Audit rows
// ============================================================================

/// One status transition, appended subject to the effective audit level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusAudit {
    pub id: i64,
    pub queued_task_id: Uuid,
    pub updated_at_utc: DateTime<Utc>,
    pub new_status: TaskStatus,
    pub exception: Option<String>,
}

/// One recurring-run completion, or one summary of skipped occurrences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunsAudit {
    pub id: i64,
    pub queued_task_id: Uuid,
    pub executed_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub exception: Option<String>,
}

/// A log line emitted by the handler during one execution.
///
/// `sequence_number` is monotonic per task and defines display order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecutionLog {
    pub id: i64,
    pub task_id: Uuid,
    pub timestamp_utc: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub exception_details: Option<String>,
    pub sequence_number: i64,
}
