//! In-memory storage, synchronised with a single mutex.
//!
//! The reference [`TaskStorage`] implementation. State lives for the life of
//! the process; useful for tests and for hosts that only need recovery-free
//! best-effort execution.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::TaskStorage;
use crate::clock::{Clock, SystemClock};
use crate::model::{
    AuditLevel, QueuedTask, RunsAudit, StatusAudit, TaskExecutionLog, TaskStatus,
};

#[derive(Default)]
struct StoreInner {
    tasks: HashMap<Uuid, QueuedTask>,
    logs: HashMap<Uuid, Vec<TaskExecutionLog>>,
    next_audit_id: i64,
    next_log_id: i64,
}

/// Mutex-held in-memory task store.
pub struct MemoryTaskStorage {
    inner: Mutex<StoreInner>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryTaskStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTaskStorage {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            clock,
        }
    }

    /// Snapshot of every stored task, unordered. Test helper.
    pub async fn all_tasks(&self) -> Vec<QueuedTask> {
        let inner = self.inner.lock().await;
        inner.tasks.values().cloned().collect()
    }
}

#[async_trait::async_trait]
impl TaskStorage for MemoryTaskStorage {
    async fn persist(&self, task: QueuedTask) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.tasks.contains_key(&task.id) {
            bail!("task {} is already persisted", task.id);
        }
        if let Some(key) = &task.task_key {
            if inner.tasks.values().any(|t| t.task_key.as_deref() == Some(key)) {
                bail!("task key {key:?} is already in use");
            }
        }
        inner.tasks.insert(task.id, task);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<QueuedTask>> {
        let inner = self.inner.lock().await;
        Ok(inner.tasks.get(&id).cloned())
    }

    async fn get_by_task_key(&self, key: &str) -> anyhow::Result<Option<QueuedTask>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .values()
            .find(|t| t.task_key.as_deref() == Some(key))
            .cloned())
    }

    async fn update_task(&self, task: QueuedTask) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.tasks.contains_key(&task.id) {
            bail!("task {} does not exist", task.id);
        }
        inner.tasks.insert(task.id, task);
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.tasks.remove(&id);
        inner.logs.remove(&id);
        Ok(())
    }

    async fn retrieve_pending(
        &self,
        last_created_at: Option<DateTime<Utc>>,
        last_id: Option<Uuid>,
        take: usize,
    ) -> anyhow::Result<Vec<QueuedTask>> {
        let now = self.clock.now();
        let inner = self.inner.lock().await;

        let mut page: Vec<QueuedTask> = inner
            .tasks
            .values()
            .filter(|t| t.status.is_resumable())
            .filter(|t| t.has_runs_remaining())
            .filter(|t| t.run_until.map(|until| until > now).unwrap_or(true))
            .filter(|t| match (last_created_at, last_id) {
                (Some(created), Some(id)) => (t.created_at_utc, t.id) > (created, id),
                (Some(created), None) => t.created_at_utc > created,
                _ => true,
            })
            .cloned()
            .collect();

        page.sort_by_key(|t| (t.created_at_utc, t.id));
        page.truncate(take);
        Ok(page)
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        exception: Option<String>,
        audit_level: AuditLevel,
    ) -> anyhow::Result<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let audit_id = inner.next_audit_id;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| anyhow!("task {id} does not exist"))?;

        // Terminal states of non-recurring tasks are final.
        if task.status.is_terminal() && !task.is_recurring {
            return Ok(());
        }

        task.status = status;
        if exception.is_some() {
            task.exception = exception.clone();
        }
        if status == TaskStatus::InProgress {
            task.last_execution_utc = Some(now);
        }

        if audit_level.records_status(status) {
            task.status_audits.push(StatusAudit {
                id: audit_id,
                queued_task_id: id,
                updated_at_utc: now,
                new_status: status,
                exception,
            });
            inner.next_audit_id += 1;
        }
        Ok(())
    }

    async fn get_current_run_count(&self, id: Uuid) -> anyhow::Result<u32> {
        let inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get(&id)
            .ok_or_else(|| anyhow!("task {id} does not exist"))?;
        Ok(task.current_run_count.unwrap_or(0))
    }

    async fn update_current_run(
        &self,
        id: Uuid,
        next_run: Option<DateTime<Utc>>,
        audit_level: AuditLevel,
    ) -> anyhow::Result<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let audit_id = inner.next_audit_id;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| anyhow!("task {id} does not exist"))?;

        task.current_run_count = Some(task.current_run_count.unwrap_or(0) + 1);
        task.next_run_utc = next_run;

        if audit_level.records_run(task.status) {
            task.runs_audits.push(RunsAudit {
                id: audit_id,
                queued_task_id: id,
                executed_at: now,
                status: task.status,
                exception: task.exception.clone(),
            });
            inner.next_audit_id += 1;
        }
        Ok(())
    }

    async fn record_skipped_occurrences(
        &self,
        id: Uuid,
        skipped: &[DateTime<Utc>],
        total: u64,
    ) -> anyhow::Result<()> {
        if skipped.is_empty() {
            return Ok(());
        }
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let audit_id = inner.next_audit_id;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| anyhow!("task {id} does not exist"))?;

        let first = skipped.first().expect("non-empty");
        let last = skipped.last().expect("non-empty");
        task.runs_audits.push(RunsAudit {
            id: audit_id,
            queued_task_id: id,
            executed_at: now,
            status: task.status,
            exception: Some(format!(
                "skipped {total} missed occurrence(s) between {first} and {last}"
            )),
        });
        inner.next_audit_id += 1;
        Ok(())
    }

    async fn save_execution_logs(
        &self,
        id: Uuid,
        logs: Vec<TaskExecutionLog>,
    ) -> anyhow::Result<()> {
        if logs.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        let mut next_log_id = inner.next_log_id;
        let stored = inner.logs.entry(id).or_default();
        // Sequence numbers continue across executions of the same task.
        let mut next_sequence = stored.last().map(|l| l.sequence_number + 1).unwrap_or(0);

        for mut entry in logs {
            entry.id = next_log_id;
            entry.sequence_number = next_sequence;
            next_log_id += 1;
            next_sequence += 1;
            stored.push(entry);
        }
        inner.next_log_id = next_log_id;
        Ok(())
    }

    async fn get_execution_logs(
        &self,
        id: Uuid,
        skip: usize,
        take: usize,
    ) -> anyhow::Result<Vec<TaskExecutionLog>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .logs
            .get(&id)
            .map(|logs| logs.iter().skip(skip).take(take).cloned().collect())
            .unwrap_or_default())
    }
}
