//! Persistence contract.
//!
//! The runtime owns *when* tasks are written; implementations own *how*.
//! Implementations must be safe for concurrent use and each operation must
//! be individually atomic — pooled connections or internal locking are the
//! implementation's concern. [`MemoryTaskStorage`] is the bundled
//! mutex-synchronised reference implementation.

mod memory;

pub use memory::MemoryTaskStorage;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{AuditLevel, QueuedTask, TaskExecutionLog, TaskStatus};

/// Storage operations the runtime consumes.
///
/// Status setters append a [`crate::model::StatusAudit`] subject to the
/// effective audit level; `update_current_run` appends a
/// [`crate::model::RunsAudit`] the same way.
#[async_trait::async_trait]
pub trait TaskStorage: Send + Sync {
    /// Insert a new task record.
    async fn persist(&self, task: QueuedTask) -> anyhow::Result<()>;

    /// Fetch a task by id.
    async fn get(&self, id: Uuid) -> anyhow::Result<Option<QueuedTask>>;

    /// Idempotency lookup: the task holding this key, if any.
    async fn get_by_task_key(&self, key: &str) -> anyhow::Result<Option<QueuedTask>>;

    /// Replace an existing record wholesale.
    async fn update_task(&self, task: QueuedTask) -> anyhow::Result<()>;

    /// Delete a task and (by cascade) its audits and logs.
    async fn remove(&self, id: Uuid) -> anyhow::Result<()>;

    /// Keyset-paginated scan of resumable tasks, ordered by
    /// `(created_at_utc, id)`, filtered to tasks whose `max_runs` and
    /// `run_until` still allow execution.
    async fn retrieve_pending(
        &self,
        last_created_at: Option<DateTime<Utc>>,
        last_id: Option<Uuid>,
        take: usize,
    ) -> anyhow::Result<Vec<QueuedTask>>;

    /// Transition a task's status, recording the exception if given.
    async fn set_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        exception: Option<String>,
        audit_level: AuditLevel,
    ) -> anyhow::Result<()>;

    async fn set_queued(&self, id: Uuid, audit_level: AuditLevel) -> anyhow::Result<()> {
        self.set_status(id, TaskStatus::Queued, None, audit_level)
            .await
    }

    async fn set_in_progress(&self, id: Uuid, audit_level: AuditLevel) -> anyhow::Result<()> {
        self.set_status(id, TaskStatus::InProgress, None, audit_level)
            .await
    }

    async fn set_completed(&self, id: Uuid, audit_level: AuditLevel) -> anyhow::Result<()> {
        self.set_status(id, TaskStatus::Completed, None, audit_level)
            .await
    }

    async fn set_cancelled_by_user(
        &self,
        id: Uuid,
        audit_level: AuditLevel,
    ) -> anyhow::Result<()> {
        self.set_status(id, TaskStatus::Cancelled, None, audit_level)
            .await
    }

    async fn set_cancelled_by_service(
        &self,
        id: Uuid,
        exception: Option<String>,
        audit_level: AuditLevel,
    ) -> anyhow::Result<()> {
        self.set_status(id, TaskStatus::ServiceStopped, exception, audit_level)
            .await
    }

    /// Completed-run count of a recurring task.
    async fn get_current_run_count(&self, id: Uuid) -> anyhow::Result<u32>;

    /// Record a completed recurring run: appends a `RunsAudit`, sets
    /// `next_run_utc`, increments `current_run_count`.
    async fn update_current_run(
        &self,
        id: Uuid,
        next_run: Option<DateTime<Utc>>,
        audit_level: AuditLevel,
    ) -> anyhow::Result<()>;

    /// Append one `RunsAudit` summarising occurrences missed during
    /// downtime. `total` is the exact count; `skipped` may be capped.
    async fn record_skipped_occurrences(
        &self,
        id: Uuid,
        skipped: &[DateTime<Utc>],
        total: u64,
    ) -> anyhow::Result<()>;

    /// Bulk-append the logs captured during one execution.
    async fn save_execution_logs(
        &self,
        id: Uuid,
        logs: Vec<TaskExecutionLog>,
    ) -> anyhow::Result<()>;

    /// Logs for a task ordered by sequence number.
    async fn get_execution_logs(
        &self,
        id: Uuid,
        skip: usize,
        take: usize,
    ) -> anyhow::Result<Vec<TaskExecutionLog>>;
}
