//! Task and handler contracts.
//!
//! A [`TaskRequest`] is an application value carrying the work to do; a
//! [`TaskHandler`] executes requests of one type. Handlers optionally
//! override the retry policy, timeout, CPU-bound placement, audit level and
//! target queue, and may observe lifecycle transitions through the
//! `on_started` / `on_completed` / `on_error` callbacks. Callback and
//! dispose failures are logged and never change the task outcome.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::logs::TaskLogger;
use crate::model::AuditLevel;
use crate::retry::RetryPolicy;

/// A dispatchable request value.
///
/// The type name is the stable identifier used to persist the task and to
/// resolve its handler again on recovery, so it must be unique within the
/// registry and must not change across releases while tasks referencing it
/// may still be stored.
pub trait TaskRequest: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable, fully-qualified-style type name (e.g. `"reports::Nightly"`).
    const TASK_TYPE: &'static str;

    /// Optional idempotency key.
    ///
    /// When present, at most one persisted task exists for the key: a second
    /// dispatch updates the existing record's payload and schedule in place
    /// instead of creating a new one.
    fn task_key(&self) -> Option<String> {
        None
    }
}

/// Everything a handler receives besides the request itself.
#[derive(Clone)]
pub struct TaskContext {
    /// Id of the executing task.
    pub task_id: Uuid,
    /// Linked to host shutdown, user cancellation and the attempt timeout.
    /// Handlers must honour it; running work is never forcibly interrupted.
    pub cancellation: CancellationToken,
    /// Per-execution logger; captured lines are persisted after the run.
    pub logger: TaskLogger,
}

/// Executes tasks of one request type.
#[async_trait::async_trait]
pub trait TaskHandler<R: TaskRequest>: Send + Sync + 'static {
    /// Execute one request. Errors are subject to the effective retry policy.
    async fn handle(&self, task: R, ctx: TaskContext) -> anyhow::Result<()>;

    /// Called before execution starts.
    async fn on_started(&self, _id: Uuid) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after a successful execution.
    async fn on_completed(&self, _id: Uuid) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when the task fails, times out, is cancelled or is stopped by
    /// shutdown. `error` is absent for cancellations.
    async fn on_error(
        &self,
        _id: Uuid,
        _message: &str,
        _error: Option<&anyhow::Error>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Post-execution cleanup hook.
    async fn dispose(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Retry policy override; falls back to the queue default, then global.
    fn retry_policy(&self) -> Option<Arc<dyn RetryPolicy>> {
        None
    }

    /// Per-attempt timeout override; falls back to the queue default, then
    /// global.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Run the handler on a dedicated thread instead of the shared runtime.
    fn cpu_bound(&self) -> bool {
        false
    }

    /// Audit level override; falls back to the queue default, then global.
    fn audit_level(&self) -> Option<AuditLevel> {
        None
    }

    /// Target queue override; defaults to `default` (or `recurring` for
    /// scheduler-released recurring tasks).
    fn queue(&self) -> Option<&str> {
        None
    }
}
