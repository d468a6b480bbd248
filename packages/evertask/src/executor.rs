//! In-memory dispatch value.
//!
//! A [`TaskExecutor`] is what actually flows through the scheduler and the
//! run queues: the persisted record's identity plus everything the worker
//! needs without going back to storage.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::AuditLevel;
use crate::recurrence::RecurrenceSpec;
use crate::registry::ErasedTaskHandler;

#[derive(Clone)]
pub(crate) struct TaskExecutor {
    /// Same id as the persisted record.
    pub id: Uuid,
    pub task_type: String,
    /// Serialized request payload (JSON).
    pub payload: String,
    pub handler: Arc<dyn ErasedTaskHandler>,
    /// Absolute due time for one-shot delayed tasks.
    pub execution_time: Option<DateTime<Utc>>,
    pub recurrence: Option<RecurrenceSpec>,
    /// Due time of the next recurring occurrence; takes priority over
    /// `execution_time` in the scheduler.
    pub next_recurring_run: Option<DateTime<Utc>>,
    pub queue_name: Option<String>,
    /// Effective audit level, resolved handler > queue > global at dispatch.
    pub audit_level: AuditLevel,
    /// Completed runs so far (recurring only).
    pub run_count: u32,
}

impl TaskExecutor {
    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_some()
    }

    /// The instant the scheduler orders this executor by.
    pub fn due_time(&self) -> Option<DateTime<Utc>> {
        self.next_recurring_run.or(self.execution_time)
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("id", &self.id)
            .field("task_type", &self.task_type)
            .field("execution_time", &self.execution_time)
            .field("next_recurring_run", &self.next_recurring_run)
            .field("queue_name", &self.queue_name)
            .field("run_count", &self.run_count)
            .finish()
    }
}
