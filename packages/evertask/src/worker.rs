//! Worker pools and the task execution workflow.
//!
//! One [`WorkerPool`] per queue pulls executors and runs each through the
//! full lifecycle: blacklist gate, status transitions, lifecycle callbacks,
//! retry/timeout composition, CPU-bound placement, recurring reschedule,
//! log flush, monitoring event, cancellation-handle cleanup.
//!
//! ```text
//! WorkerPool
//!     │
//!     ├─► queue.dequeue()
//!     ├─► acquire parallelism permit
//!     └─► run_task
//!             ├─► blacklist gate → Cancelled
//!             ├─► InProgress + on_started
//!             ├─► retry(timeout(handler)) with linked cancellation
//!             ├─► classify → Completed | Failed | Cancelled | ServiceStopped
//!             ├─► recurring: record skips, bump run count, rearm scheduler
//!             ├─► flush captured logs, publish monitoring event
//!             └─► drop cancellation handle
//! ```

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::blacklist::{Blacklist, CancellationRegistry};
use crate::clock::Clock;
use crate::config::EverTaskConfig;
use crate::error::{render_error_chain, TaskError};
use crate::executor::TaskExecutor;
use crate::logs::TaskLogger;
use crate::model::TaskStatus;
use crate::monitor::{MonitorHub, TaskEvent, TaskEventSeverity};
use crate::queue::{QueueSettings, WorkQueue};
use crate::registry::ErasedTaskHandler;
use crate::scheduler::TimerScheduler;
use crate::storage::TaskStorage;
use crate::task::TaskContext;

/// Shared dependencies of every worker pool.
pub(crate) struct WorkerContext {
    pub storage: Option<Arc<dyn TaskStorage>>,
    pub blacklist: Arc<Blacklist>,
    pub cancellations: Arc<CancellationRegistry>,
    pub scheduler: Arc<TimerScheduler>,
    pub monitors: Arc<MonitorHub>,
    pub clock: Arc<dyn Clock>,
    pub config: EverTaskConfig,
    /// Cancelled to stop pulling new work.
    pub intake: CancellationToken,
    /// Cancelled to stop in-flight handlers; drives `ServiceStopped`.
    pub shutdown: CancellationToken,
    /// Tracks in-flight executions for graceful drain.
    pub tracker: TaskTracker,
}

/// Supervisor pulling from one queue with bounded concurrency.
pub(crate) struct WorkerPool {
    queue: Arc<WorkQueue>,
    ctx: Arc<WorkerContext>,
}

impl WorkerPool {
    pub fn new(queue: Arc<WorkQueue>, ctx: Arc<WorkerContext>) -> Self {
        Self { queue, ctx }
    }

    pub async fn run(self) {
        let settings = self.queue.settings().clone();
        let semaphore = Arc::new(Semaphore::new(settings.max_parallelism));
        debug!(
            queue = %self.queue.name(),
            parallelism = settings.max_parallelism,
            "worker pool starting"
        );

        loop {
            let executor = tokio::select! {
                _ = self.ctx.intake.cancelled() => break,
                item = self.queue.dequeue() => match item {
                    Some(executor) => executor,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = self.ctx.intake.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let ctx = self.ctx.clone();
            let settings = settings.clone();
            self.ctx.tracker.spawn(async move {
                run_task(ctx, settings, executor).await;
                drop(permit);
            });
        }

        debug!(queue = %self.queue.name(), "worker pool stopped");
    }
}

/// Outcome of one full execution (after retries).
enum Outcome {
    Completed,
    Failed(anyhow::Error),
    UserCancelled,
    ServiceStopped(anyhow::Error),
}

pub(crate) async fn run_task(
    ctx: Arc<WorkerContext>,
    queue: QueueSettings,
    mut executor: TaskExecutor,
) {
    let id = executor.id;
    let entry = executor.handler.clone();
    let audit_level = executor.audit_level;

    // Blacklist gate: a user-cancelled copy is consumed, never executed.
    if ctx.blacklist.is_blacklisted(id) {
        ctx.blacklist.remove(id);
        debug!(task_id = %id, "discarding blacklisted task on dequeue");
        if let Some(storage) = &ctx.storage {
            if let Err(e) = storage.set_cancelled_by_user(id, audit_level).await {
                warn!(task_id = %id, error = %e, "failed to mark blacklisted task cancelled");
            }
        }
        return;
    }

    if let Some(storage) = &ctx.storage {
        if let Err(e) = storage.set_in_progress(id, audit_level).await {
            warn!(task_id = %id, error = %e, "failed to mark task in progress");
        }
    }
    if let Err(e) = entry.on_started(id).await {
        warn!(task_id = %id, error = %e, "on_started callback failed");
    }

    let task_token = ctx.cancellations.create_token(id, &ctx.shutdown);

    // Effective envelope: handler override > queue default > global default.
    let retry = entry
        .retry_policy()
        .unwrap_or_else(|| queue.retry_policy.clone());
    let timeout = entry.timeout().or(queue.timeout);
    let cpu_bound = entry.cpu_bound();

    let logger = TaskLogger::new(id, ctx.config.persistent_logger.clone(), ctx.clock.clone());

    let op = {
        let entry = entry.clone();
        let payload = executor.payload.clone();
        let task_token = task_token.clone();
        let logger = logger.clone();
        move |attempt: u32| -> BoxFuture<'static, anyhow::Result<()>> {
            let entry = entry.clone();
            let payload = payload.clone();
            let attempt_token = task_token.child_token();
            let logger = logger.clone();
            async move {
                if attempt > 1 {
                    logger.info(format!("starting attempt {attempt}"));
                }
                let exec_ctx = TaskContext {
                    task_id: id,
                    cancellation: attempt_token.clone(),
                    logger,
                };
                let invocation = run_handler(entry, payload, exec_ctx, cpu_bound);
                match timeout {
                    Some(limit) => match tokio::time::timeout(limit, invocation).await {
                        Ok(result) => result,
                        Err(_) => {
                            // Stop the attempt; this is a timeout, not a
                            // user cancellation.
                            attempt_token.cancel();
                            Err(TaskError::Timeout { duration: limit }.into())
                        }
                    },
                    None => invocation.await,
                }
            }
            .boxed()
        }
    };

    let result = retry.execute(&op, &logger, &task_token).await;

    if let Err(e) = entry.dispose().await {
        warn!(task_id = %id, error = %e, "handler dispose failed");
    }

    let outcome = match result {
        Ok(()) => Outcome::Completed,
        Err(error) => {
            if ctx.shutdown.is_cancelled() {
                Outcome::ServiceStopped(error)
            } else if task_token.is_cancelled() {
                Outcome::UserCancelled
            } else {
                Outcome::Failed(error)
            }
        }
    };

    let (final_status, severity, message, exception) = match &outcome {
        Outcome::Completed => {
            if let Some(storage) = &ctx.storage {
                if let Err(e) = storage.set_completed(id, audit_level).await {
                    warn!(task_id = %id, error = %e, "failed to mark task completed");
                }
            }
            if let Err(e) = entry.on_completed(id).await {
                warn!(task_id = %id, error = %e, "on_completed callback failed");
            }
            info!(task_id = %id, task_type = %executor.task_type, "task completed");
            (
                TaskStatus::Completed,
                TaskEventSeverity::Information,
                "task completed".to_string(),
                None,
            )
        }
        Outcome::ServiceStopped(error) => {
            let detail = render_error_chain(error);
            if let Some(storage) = &ctx.storage {
                if let Err(e) = storage
                    .set_cancelled_by_service(id, Some(detail.clone()), audit_level)
                    .await
                {
                    warn!(task_id = %id, error = %e, "failed to mark task service-stopped");
                }
            }
            let message = "task interrupted by service stop";
            if let Err(e) = entry.on_error(id, message, Some(error)).await {
                warn!(task_id = %id, error = %e, "on_error callback failed");
            }
            warn!(task_id = %id, task_type = %executor.task_type, "task stopped by shutdown");
            (
                TaskStatus::ServiceStopped,
                TaskEventSeverity::Warning,
                message.to_string(),
                Some(detail),
            )
        }
        Outcome::UserCancelled => {
            if let Some(storage) = &ctx.storage {
                if let Err(e) = storage.set_cancelled_by_user(id, audit_level).await {
                    warn!(task_id = %id, error = %e, "failed to mark task cancelled");
                }
            }
            let message = "task cancelled by user";
            if let Err(e) = entry.on_error(id, message, None).await {
                warn!(task_id = %id, error = %e, "on_error callback failed");
            }
            info!(task_id = %id, task_type = %executor.task_type, "task cancelled by user");
            (
                TaskStatus::Cancelled,
                TaskEventSeverity::Warning,
                message.to_string(),
                None,
            )
        }
        Outcome::Failed(error) => {
            let detail = render_error_chain(error);
            if let Some(storage) = &ctx.storage {
                if let Err(e) = storage
                    .set_status(id, TaskStatus::Failed, Some(detail.clone()), audit_level)
                    .await
                {
                    warn!(task_id = %id, error = %e, "failed to mark task failed");
                }
            }
            let message = format!("task failed: {error:#}");
            if let Err(e) = entry.on_error(id, &message, Some(error)).await {
                warn!(task_id = %id, error = %e, "on_error callback failed");
            }
            warn!(task_id = %id, task_type = %executor.task_type, error = %error, "task failed");
            (
                TaskStatus::Failed,
                TaskEventSeverity::Error,
                message,
                Some(detail),
            )
        }
    };

    // Recurring reschedule, unless cancellation or shutdown ended the series.
    if executor.is_recurring()
        && matches!(final_status, TaskStatus::Completed | TaskStatus::Failed)
    {
        reschedule_recurring(&ctx, &mut executor, audit_level).await;
    }

    let captured = logger.drain();
    if ctx.config.persistent_logger.enabled && !captured.is_empty() {
        if let Some(storage) = &ctx.storage {
            if let Err(e) = storage.save_execution_logs(id, captured.clone()).await {
                warn!(task_id = %id, error = %e, "failed to persist execution logs");
            }
        }
    }

    ctx.monitors.publish(TaskEvent {
        task_id: id,
        event_date_utc: ctx.clock.now(),
        severity,
        task_type: executor.task_type.clone(),
        task_handler_type: entry.handler_type().to_string(),
        task_parameters: executor.payload.clone(),
        message,
        exception,
        execution_logs: ctx
            .config
            .persistent_logger
            .enabled
            .then_some(captured)
            .filter(|logs| !logs.is_empty()),
    });

    ctx.cancellations.delete(id);
}

async fn reschedule_recurring(
    ctx: &Arc<WorkerContext>,
    executor: &mut TaskExecutor,
    audit_level: crate::model::AuditLevel,
) {
    let id = executor.id;
    let Some(spec) = executor.recurrence.clone() else {
        return;
    };

    let now = ctx.clock.now();
    let run_count = match &ctx.storage {
        Some(storage) => storage
            .get_current_run_count(id)
            .await
            .unwrap_or(executor.run_count),
        None => executor.run_count,
    };

    let next_valid = match spec.calculate_next_valid_run(now, run_count + 1, now) {
        Ok(next_valid) => next_valid,
        Err(error) => {
            error!(task_id = %id, error = %error, "recurrence evaluation failed");
            if let Some(storage) = &ctx.storage {
                let detail = render_error_chain(&anyhow::Error::new(error));
                let _ = storage
                    .set_status(id, TaskStatus::Failed, Some(detail), audit_level)
                    .await;
            }
            return;
        }
    };

    if let Some(storage) = &ctx.storage {
        if next_valid.skipped_count > 0 {
            if let Err(e) = storage
                .record_skipped_occurrences(id, &next_valid.skipped, next_valid.skipped_count)
                .await
            {
                warn!(task_id = %id, error = %e, "failed to record skipped occurrences");
            }
        }
        if let Err(e) = storage
            .update_current_run(id, next_valid.next, audit_level)
            .await
        {
            warn!(task_id = %id, error = %e, "failed to update current run");
        }
    }

    let Some(next) = next_valid.next else {
        debug!(task_id = %id, "recurring series finished");
        return;
    };

    if let Some(storage) = &ctx.storage {
        if let Err(e) = storage
            .set_status(id, TaskStatus::Pending, None, audit_level)
            .await
        {
            warn!(task_id = %id, error = %e, "failed to mark task pending");
        }
    }

    executor.next_recurring_run = Some(next);
    executor.run_count = run_count + 1;
    debug!(task_id = %id, next_run = %next, "rearming recurring task");
    if let Err(error) = ctx.scheduler.enqueue(executor.clone()) {
        error!(task_id = %id, error = %error, "failed to rearm recurring task");
        if let Some(storage) = &ctx.storage {
            let detail = render_error_chain(&anyhow::Error::new(error));
            let _ = storage
                .set_status(id, TaskStatus::Failed, Some(detail), audit_level)
                .await;
        }
    }
}

/// Invoke the handler, on the shared runtime or on a dedicated thread for
/// CPU-bound work.
async fn run_handler(
    entry: Arc<dyn ErasedTaskHandler>,
    payload: String,
    ctx: TaskContext,
    cpu_bound: bool,
) -> anyhow::Result<()> {
    if !cpu_bound {
        return entry.run(&payload, ctx).await;
    }

    let (tx, rx) = oneshot::channel();
    let thread_name = format!("evertask-cpu-{}", ctx.task_id);
    let spawned = std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let result = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime.block_on(entry.run(&payload, ctx)),
                Err(e) => Err(anyhow::Error::new(e).context("failed to build cpu-bound runtime")),
            };
            let _ = tx.send(result);
        });

    if let Err(e) = spawned {
        return Err(anyhow::Error::new(e).context("failed to spawn cpu-bound thread"));
    }
    match rx.await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("cpu-bound execution thread terminated early")),
    }
}
