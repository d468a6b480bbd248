//! Public dispatch API.
//!
//! Validates submissions, resolves handlers, persists the task record,
//! attaches recurrence metadata, and routes: future work to the timer
//! scheduler, immediate work straight into a run queue. Also the home of
//! task-key idempotency, user cancellation and purge.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::blacklist::{Blacklist, CancellationRegistry};
use crate::clock::Clock;
use crate::config::EverTaskConfig;
use crate::error::TaskError;
use crate::executor::TaskExecutor;
use crate::model::{QueuedTask, TaskStatus};
use crate::queue::QueueManager;
use crate::recurrence::RecurrenceSpec;
use crate::registry::{ErasedTaskHandler, HandlerRegistry};
use crate::scheduler::TimerScheduler;
use crate::storage::TaskStorage;
use crate::task::TaskRequest;

enum Schedule {
    Immediate,
    At(DateTime<Utc>),
    Recurring(RecurrenceSpec),
}

pub(crate) struct DispatcherInner {
    pub registry: Arc<HandlerRegistry>,
    pub storage: Option<Arc<dyn TaskStorage>>,
    pub queues: Arc<QueueManager>,
    pub scheduler: Arc<TimerScheduler>,
    pub blacklist: Arc<Blacklist>,
    pub cancellations: Arc<CancellationRegistry>,
    pub clock: Arc<dyn Clock>,
    pub config: EverTaskConfig,
}

/// Submission front door. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub(crate) fn new(inner: DispatcherInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Dispatch for immediate execution. Returns the persisted task id.
    pub async fn dispatch<R: TaskRequest>(&self, task: R) -> Result<Uuid, TaskError> {
        self.submit(task, Schedule::Immediate).await
    }

    /// Dispatch for execution after `delay`.
    pub async fn dispatch_in<R: TaskRequest>(
        &self,
        task: R,
        delay: StdDuration,
    ) -> Result<Uuid, TaskError> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| TaskError::argument(format!("delay out of range: {e}")))?;
        let at = self.inner.clock.now() + delay;
        self.submit(task, Schedule::At(at)).await
    }

    /// Dispatch for execution at a specific instant.
    pub async fn dispatch_at<R: TaskRequest>(
        &self,
        task: R,
        at: DateTime<Utc>,
    ) -> Result<Uuid, TaskError> {
        self.submit(task, Schedule::At(at)).await
    }

    /// Dispatch a recurring series.
    pub async fn dispatch_recurring<R: TaskRequest>(
        &self,
        task: R,
        spec: RecurrenceSpec,
    ) -> Result<Uuid, TaskError> {
        self.submit(task, Schedule::Recurring(spec)).await
    }

    /// Cancel a task: mark it cancelled in storage, cancel its in-flight
    /// handle, and blacklist the id so any queued copy is discarded.
    pub async fn cancel(&self, id: Uuid) -> Result<(), TaskError> {
        if let Some(storage) = &self.inner.storage {
            // Cancellation audits at the same resolved level as every other
            // transition for this task: handler > queue > global.
            let audit_level = match storage.get(id).await {
                Ok(Some(task)) => self
                    .inner
                    .registry
                    .get(&task.task_type)
                    .and_then(|entry| entry.audit_level())
                    .unwrap_or_else(|| {
                        self.inner.queues.audit_level_for(task.queue_name.as_deref())
                    }),
                Ok(None) => self.inner.config.default_audit_level,
                Err(error) => {
                    warn!(task_id = %id, error = %error, "failed to load task for cancellation");
                    self.inner.config.default_audit_level
                }
            };
            if let Err(error) = storage.set_cancelled_by_user(id, audit_level).await {
                warn!(task_id = %id, error = %error, "failed to mark task cancelled");
            }
        }
        self.inner.cancellations.cancel(id);
        self.inner.blacklist.add(id);
        debug!(task_id = %id, "task cancelled by user");
        Ok(())
    }

    /// Remove a terminal task and its audit/log history.
    pub async fn purge(&self, id: Uuid) -> Result<(), TaskError> {
        let Some(storage) = &self.inner.storage else {
            return Err(TaskError::argument("purge requires configured storage"));
        };
        let task = storage
            .get(id)
            .await
            .map_err(|source| TaskError::Persistence { source })?
            .ok_or_else(|| TaskError::argument(format!("task {id} does not exist")))?;
        if !task.status.is_terminal() {
            return Err(TaskError::argument(format!(
                "task {id} is not in a terminal state"
            )));
        }
        storage
            .remove(id)
            .await
            .map_err(|source| TaskError::Persistence { source })
    }

    async fn submit<R: TaskRequest>(
        &self,
        task: R,
        schedule: Schedule,
    ) -> Result<Uuid, TaskError> {
        let entry =
            self.inner
                .registry
                .get(R::TASK_TYPE)
                .ok_or_else(|| TaskError::HandlerMissing {
                    task_type: R::TASK_TYPE.to_string(),
                })?;

        let payload = serde_json::to_string(&task)
            .map_err(|e| TaskError::argument(format!("request failed to serialize: {e}")))?;

        if let Schedule::Recurring(spec) = &schedule {
            spec.validate()?;
        }

        // Task-key idempotency: a second dispatch with the same key updates
        // the existing record in place instead of creating a new row.
        let task_key = task.task_key();
        if let Some(key) = &task_key {
            if key.trim().is_empty() {
                return Err(TaskError::argument("task key cannot be empty"));
            }
            if let Some(storage) = &self.inner.storage {
                match storage.get_by_task_key(key).await {
                    Ok(Some(existing)) => {
                        return self
                            .place(entry, payload, schedule, task_key, Some(existing))
                            .await;
                    }
                    Ok(None) => {}
                    Err(source) => {
                        if self.inner.config.throw_if_unable_to_persist {
                            return Err(TaskError::Persistence { source });
                        }
                        warn!(error = %source, "task key lookup failed, dispatching as new");
                    }
                }
            }
        }

        self.place(entry, payload, schedule, task_key, None).await
    }

    /// Build the record and executor, persist (unless re-dispatching an
    /// existing row), and route.
    async fn place(
        &self,
        entry: Arc<dyn ErasedTaskHandler>,
        payload: String,
        schedule: Schedule,
        task_key: Option<String>,
        existing: Option<QueuedTask>,
    ) -> Result<Uuid, TaskError> {
        let now = self.inner.clock.now();
        let run_index = existing
            .as_ref()
            .and_then(|t| t.current_run_count)
            .unwrap_or(0);

        let (execution_time, recurrence, next_recurring_run) = match &schedule {
            Schedule::Immediate => (None, None, None),
            Schedule::At(at) => (Some(*at), None, None),
            Schedule::Recurring(spec) => {
                let first = spec.next_run(now, run_index)?.ok_or_else(|| {
                    TaskError::invalid_spec("recurrence produces no future occurrence")
                })?;
                (None, Some(spec.clone()), Some(first))
            }
        };

        let queue_name = entry.queue().map(str::to_string);
        let audit_level = entry
            .audit_level()
            .unwrap_or_else(|| self.inner.queues.audit_level_for(queue_name.as_deref()));

        let record = match existing {
            Some(mut record) => {
                record.request = payload.clone();
                record.scheduled_execution_utc = execution_time;
                record.next_run_utc = next_recurring_run;
                record.is_recurring = recurrence.is_some();
                record.recurring_task = recurrence
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .map_err(|e| TaskError::argument(format!("spec failed to serialize: {e}")))?;
                record.recurring_info = recurrence.as_ref().map(|s| s.to_string());
                record.max_runs = recurrence.as_ref().and_then(|s| s.max_runs);
                record.run_until = recurrence.as_ref().and_then(|s| s.run_until);
                record.queue_name = queue_name.clone();
                record.status = TaskStatus::WaitingQueue;
                record.exception = None;

                if let Some(storage) = &self.inner.storage {
                    if let Err(source) = storage.update_task(record.clone()).await {
                        if self.inner.config.throw_if_unable_to_persist {
                            return Err(TaskError::Persistence { source });
                        }
                        warn!(task_id = %record.id, error = %source, "failed to update task, continuing in-memory");
                    }
                }
                debug!(task_id = %record.id, "re-dispatching task via task key");
                record
            }
            None => {
                let mut record = QueuedTask::builder()
                    .created_at_utc(now)
                    .task_type(entry.task_type().to_string())
                    .request(payload.clone())
                    .handler(entry.handler_type().to_string())
                    .build();
                record.scheduled_execution_utc = execution_time;
                record.next_run_utc = next_recurring_run;
                record.is_recurring = recurrence.is_some();
                record.recurring_task = recurrence
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .map_err(|e| TaskError::argument(format!("spec failed to serialize: {e}")))?;
                record.recurring_info = recurrence.as_ref().map(|s| s.to_string());
                record.max_runs = recurrence.as_ref().and_then(|s| s.max_runs);
                record.run_until = recurrence.as_ref().and_then(|s| s.run_until);
                record.queue_name = queue_name.clone();
                record.task_key = task_key;

                if let Some(storage) = &self.inner.storage {
                    if let Err(source) = storage.persist(record.clone()).await {
                        if self.inner.config.throw_if_unable_to_persist {
                            return Err(TaskError::Persistence { source });
                        }
                        warn!(task_id = %record.id, error = %source, "failed to persist task, continuing in-memory");
                    }
                }
                record
            }
        };

        let executor = TaskExecutor {
            id: record.id,
            task_type: record.task_type.clone(),
            payload,
            handler: entry,
            execution_time,
            recurrence,
            next_recurring_run,
            queue_name,
            audit_level,
            run_count: record.current_run_count.unwrap_or(0),
        };

        self.route(executor, now).await
    }

    /// Future work goes to the scheduler, immediate work into a queue.
    async fn route(&self, executor: TaskExecutor, now: DateTime<Utc>) -> Result<Uuid, TaskError> {
        let id = executor.id;
        let to_scheduler = executor.next_recurring_run.is_some()
            || executor.execution_time.map(|at| at > now).unwrap_or(false);

        if to_scheduler {
            if let Some(storage) = &self.inner.storage {
                if let Err(error) = storage.set_queued(id, executor.audit_level).await {
                    warn!(task_id = %id, error = %error, "failed to mark scheduled task queued");
                }
            }
            self.inner.scheduler.enqueue(executor)?;
        } else {
            self.inner.queues.enqueue(executor).await?;
        }
        Ok(id)
    }

    /// Re-dispatch a persisted task under its existing id. Used by startup
    /// recovery; never creates a new record.
    pub(crate) async fn dispatch_existing(&self, task: &QueuedTask) -> Result<Uuid, TaskError> {
        let entry =
            self.inner
                .registry
                .get(&task.task_type)
                .ok_or_else(|| TaskError::HandlerMissing {
                    task_type: task.task_type.clone(),
                })?;

        entry
            .check_payload(&task.request)
            .map_err(|e| TaskError::argument(e.to_string()))?;

        let audit_level = entry
            .audit_level()
            .unwrap_or_else(|| self.inner.queues.audit_level_for(task.queue_name.as_deref()));

        let now = self.inner.clock.now();
        let mut executor = TaskExecutor {
            id: task.id,
            task_type: task.task_type.clone(),
            payload: task.request.clone(),
            handler: entry,
            execution_time: task.scheduled_execution_utc,
            recurrence: None,
            next_recurring_run: None,
            queue_name: task.queue_name.clone(),
            audit_level,
            run_count: task.current_run_count.unwrap_or(0),
        };

        if task.is_recurring {
            let serialized = task.recurring_task.as_deref().ok_or_else(|| {
                TaskError::invalid_spec("recurring task has no stored recurrence spec")
            })?;
            let spec: RecurrenceSpec = serde_json::from_str(serialized).map_err(|e| {
                TaskError::invalid_spec(format!("stored recurrence spec is unreadable: {e}"))
            })?;

            // Reconcile the stored schedule against downtime.
            let anchor = task.last_execution_utc.unwrap_or(task.created_at_utc);
            let run_count = task.current_run_count.unwrap_or(0);
            let next_valid = spec.calculate_next_valid_run(anchor, run_count, now)?;

            if let Some(storage) = &self.inner.storage {
                if next_valid.skipped_count > 0 {
                    if let Err(e) = storage
                        .record_skipped_occurrences(
                            task.id,
                            &next_valid.skipped,
                            next_valid.skipped_count,
                        )
                        .await
                    {
                        warn!(task_id = %task.id, error = %e, "failed to record skipped occurrences");
                    }
                }
                let mut updated = task.clone();
                updated.next_run_utc = next_valid.next;
                if let Err(e) = storage.update_task(updated).await {
                    warn!(task_id = %task.id, error = %e, "failed to update recovered task");
                }
            }

            let Some(next) = next_valid.next else {
                // The series ran out while the host was down.
                if let Some(storage) = &self.inner.storage {
                    if let Err(e) = storage.set_completed(task.id, audit_level).await {
                        warn!(task_id = %task.id, error = %e, "failed to close exhausted series");
                    }
                }
                return Ok(task.id);
            };

            executor.recurrence = Some(spec);
            executor.next_recurring_run = Some(next);
            if let Some(storage) = &self.inner.storage {
                if let Err(e) = storage
                    .set_status(task.id, TaskStatus::Pending, None, audit_level)
                    .await
                {
                    warn!(task_id = %task.id, error = %e, "failed to mark recovered task pending");
                }
            }
            self.inner.scheduler.enqueue(executor)?;
            return Ok(task.id);
        }

        self.route(executor, now).await
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::clock::SystemClock;
    use crate::model::AuditLevel;
    use crate::queue::DEFAULT_QUEUE;
    use crate::storage::MemoryTaskStorage;
    use crate::task::{TaskContext, TaskHandler};

    #[derive(Debug, Serialize, Deserialize)]
    struct Report {
        name: String,
        #[serde(default)]
        key: Option<String>,
    }

    impl TaskRequest for Report {
        const TASK_TYPE: &'static str = "test::Report";

        fn task_key(&self) -> Option<String> {
            self.key.clone()
        }
    }

    struct ReportHandler;

    #[async_trait::async_trait]
    impl TaskHandler<Report> for ReportHandler {
        async fn handle(&self, _task: Report, _ctx: TaskContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Audited;

    impl TaskRequest for Audited {
        const TASK_TYPE: &'static str = "test::Audited";
    }

    struct AuditedHandler;

    #[async_trait::async_trait]
    impl TaskHandler<Audited> for AuditedHandler {
        async fn handle(&self, _task: Audited, _ctx: TaskContext) -> anyhow::Result<()> {
            Ok(())
        }

        fn audit_level(&self) -> Option<AuditLevel> {
            Some(AuditLevel::Full)
        }
    }

    fn dispatcher(storage: Option<Arc<dyn TaskStorage>>) -> Dispatcher {
        dispatcher_with(EverTaskConfig::default(), storage)
    }

    fn dispatcher_with(
        config: EverTaskConfig,
        storage: Option<Arc<dyn TaskStorage>>,
    ) -> Dispatcher {
        let mut registry = HandlerRegistry::new();
        registry.register::<Report, _>(ReportHandler);
        registry.register::<Audited, _>(AuditedHandler);
        let blacklist = Arc::new(Blacklist::new());
        let queues = Arc::new(QueueManager::new(
            config.clone(),
            blacklist.clone(),
            storage.clone(),
        ));
        let scheduler = Arc::new(TimerScheduler::new(
            queues.clone(),
            storage.clone(),
            Arc::new(SystemClock),
        ));
        Dispatcher::new(DispatcherInner {
            registry: Arc::new(registry),
            storage,
            queues,
            scheduler,
            blacklist,
            cancellations: Arc::new(CancellationRegistry::new()),
            clock: Arc::new(SystemClock),
            config,
        })
    }

    fn report(name: &str) -> Report {
        Report {
            name: name.to_string(),
            key: None,
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Unregistered;

    impl TaskRequest for Unregistered {
        const TASK_TYPE: &'static str = "test::Unregistered";
    }

    #[tokio::test]
    async fn missing_handler_is_rejected() {
        let dispatcher = dispatcher(None);
        let err = dispatcher.dispatch(Unregistered).await.unwrap_err();
        assert!(matches!(err, TaskError::HandlerMissing { .. }));
    }

    #[tokio::test]
    async fn immediate_dispatch_persists_and_queues() {
        let storage = Arc::new(MemoryTaskStorage::new());
        let dispatcher = dispatcher(Some(storage.clone()));

        let id = dispatcher.dispatch(report("weekly")).await.unwrap();

        let record = storage.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Queued);
        assert_eq!(record.task_type, "test::Report");
        assert!(!record.is_recurring);

        let queue = dispatcher.inner.queues.get(DEFAULT_QUEUE).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn delayed_dispatch_goes_to_the_scheduler() {
        let storage = Arc::new(MemoryTaskStorage::new());
        let dispatcher = dispatcher(Some(storage.clone()));

        let id = dispatcher
            .dispatch_in(report("later"), StdDuration::from_secs(60))
            .await
            .unwrap();

        let record = storage.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Queued);
        assert!(record.scheduled_execution_utc.is_some());
        assert_eq!(dispatcher.inner.scheduler.pending_count(), 1);
        assert_eq!(dispatcher.inner.queues.get(DEFAULT_QUEUE).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn recurring_dispatch_records_spec_and_next_run() {
        let storage = Arc::new(MemoryTaskStorage::new());
        let dispatcher = dispatcher(Some(storage.clone()));

        let id = dispatcher
            .dispatch_recurring(
                report("sync"),
                RecurrenceSpec::every_minutes(5).with_max_runs(10),
            )
            .await
            .unwrap();

        let record = storage.get(id).await.unwrap().unwrap();
        assert!(record.is_recurring);
        assert!(record.next_run_utc.is_some());
        assert_eq!(record.max_runs, Some(10));
        assert!(record.recurring_info.unwrap().contains("every 5 minute(s)"));

        let spec: RecurrenceSpec =
            serde_json::from_str(record.recurring_task.as_deref().unwrap()).unwrap();
        assert_eq!(spec.max_runs, Some(10));
    }

    #[tokio::test]
    async fn invalid_recurrence_is_rejected() {
        let dispatcher = dispatcher(None);
        let err = dispatcher
            .dispatch_recurring(report("bad"), RecurrenceSpec::every_seconds(0))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidSpec { .. }));
    }

    #[tokio::test]
    async fn task_key_updates_in_place() {
        let storage = Arc::new(MemoryTaskStorage::new());
        let dispatcher = dispatcher(Some(storage.clone()));

        let keyed = |name: &str| Report {
            name: name.to_string(),
            key: Some("the-report".to_string()),
        };

        let first = dispatcher.dispatch(keyed("v1")).await.unwrap();
        let second = dispatcher.dispatch(keyed("v2")).await.unwrap();
        assert_eq!(first, second);

        let tasks = storage.all_tasks().await;
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].request.contains("v2"));
    }

    #[tokio::test]
    async fn cancel_blacklists_and_marks_cancelled() {
        let storage = Arc::new(MemoryTaskStorage::new());
        let dispatcher = dispatcher(Some(storage.clone()));

        let id = dispatcher
            .dispatch_in(report("doomed"), StdDuration::from_secs(60))
            .await
            .unwrap();
        dispatcher.cancel(id).await.unwrap();

        let record = storage.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);
        assert!(dispatcher.inner.blacklist.is_blacklisted(id));
    }

    #[tokio::test]
    async fn cancel_audits_at_the_handler_override_level() {
        let storage = Arc::new(MemoryTaskStorage::new());
        let config = EverTaskConfig::default().with_default_audit_level(AuditLevel::None);
        let dispatcher = dispatcher_with(config, Some(storage.clone()));

        let id = dispatcher
            .dispatch_in(Audited, StdDuration::from_secs(60))
            .await
            .unwrap();
        dispatcher.cancel(id).await.unwrap();

        let record = storage.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);
        // The handler declares Full, so the cancellation transition is
        // audited even though the global default suppresses audits.
        assert!(record
            .status_audits
            .iter()
            .any(|a| a.new_status == TaskStatus::Cancelled));
    }

    #[tokio::test]
    async fn purge_removes_only_terminal_tasks() {
        let storage = Arc::new(MemoryTaskStorage::new());
        let dispatcher = dispatcher(Some(storage.clone()));

        let id = dispatcher.dispatch(report("done")).await.unwrap();
        // Still Queued: not purgeable.
        assert!(dispatcher.purge(id).await.is_err());

        storage.set_completed(id, AuditLevel::Full).await.unwrap();
        dispatcher.purge(id).await.unwrap();
        assert!(storage.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dispatch_existing_requeues_without_new_rows() {
        let storage = Arc::new(MemoryTaskStorage::new());
        let dispatcher = dispatcher(Some(storage.clone()));

        let id = dispatcher.dispatch(report("restartable")).await.unwrap();
        let record = storage.get(id).await.unwrap().unwrap();

        // Simulate a restart: re-dispatch the stored row.
        let again = dispatcher.dispatch_existing(&record).await.unwrap();
        assert_eq!(again, id);
        assert_eq!(storage.all_tasks().await.len(), 1);
    }
}
