//! # EverTask
//!
//! An embedded background task runtime for long-running server processes.
//! Application code submits typed requests paired with handlers; the runtime
//! persists each task, executes it with retries and timeouts under a
//! pluggable policy, supports delayed and recurring schedules, and resumes
//! unfinished work from storage after a restart.
//!
//! ## Architecture
//!
//! ```text
//! Dispatcher ──► persist (TaskStorage)
//!     │
//!     ├─ immediate ─────────────► WorkQueue ──► WorkerPool ──► handler
//!     │                               ▲              │
//!     └─ delayed / recurring ──► TimerScheduler      ├─► status + audits
//!                                     ▲              ├─► execution logs
//!                                     └── reschedule ┴─► monitor events
//!
//! on start: RecoveryService ──► retrieve_pending ──► Dispatcher (existing id)
//! ```
//!
//! ## Guarantees
//!
//! - **Persisted before executed**: a dispatched task survives a restart.
//! - **At-least-once after a crash**: a task interrupted mid-execution is
//!   replayed on the next start; terminal states are final for
//!   non-recurring tasks.
//! - **FIFO per queue**, due-order release from the scheduler, one worker
//!   per task id at any moment.
//! - **Cooperative cancellation**: handlers receive a token linked to host
//!   shutdown, user cancellation and the per-attempt timeout; running work
//!   is never forcibly interrupted.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use evertask::{
//!     EverTask, EverTaskConfig, MemoryTaskStorage, RecurrenceSpec,
//!     TaskContext, TaskHandler, TaskRequest,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct SendDigest { user_id: u64 }
//!
//! impl TaskRequest for SendDigest {
//!     const TASK_TYPE: &'static str = "mail::SendDigest";
//! }
//!
//! struct SendDigestHandler;
//!
//! #[async_trait::async_trait]
//! impl TaskHandler<SendDigest> for SendDigestHandler {
//!     async fn handle(&self, task: SendDigest, ctx: TaskContext) -> anyhow::Result<()> {
//!         ctx.logger.info(format!("sending digest to {}", task.user_id));
//!         Ok(())
//!     }
//! }
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let runtime = EverTask::builder(EverTaskConfig::default())
//!     .storage(Arc::new(MemoryTaskStorage::new()))
//!     .register::<SendDigest, _>(SendDigestHandler)
//!     .start()
//!     .await?;
//!
//! let dispatcher = runtime.dispatcher();
//! dispatcher.dispatch(SendDigest { user_id: 7 }).await?;
//! dispatcher
//!     .dispatch_recurring(
//!         SendDigest { user_id: 7 },
//!         RecurrenceSpec::cron("0 8 * * *").with_max_runs(30),
//!     )
//!     .await?;
//!
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod logs;
pub mod model;
pub mod monitor;
pub mod recurrence;
pub mod registry;
pub mod retry;
pub mod storage;
pub mod task;

mod blacklist;
mod dispatcher;
mod executor;
mod queue;
mod recovery;
mod runtime;
mod scheduler;
mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EverTaskConfig, FullMode, PersistentLoggerConfig, QueueConfig};
pub use dispatcher::Dispatcher;
pub use error::TaskError;
pub use logs::TaskLogger;
pub use model::{
    AuditLevel, LogLevel, QueuedTask, RunsAudit, StatusAudit, TaskExecutionLog, TaskStatus,
};
pub use monitor::{TaskEvent, TaskEventSeverity, TaskMonitor};
pub use recurrence::{
    Cadence, InitialTrigger, MonthDaySelector, NextValidRun, RecurrenceSpec,
};
pub use registry::HandlerRegistry;
pub use retry::{ExponentialRetryPolicy, LinearRetryPolicy, NoRetryPolicy, RetryPolicy};
pub use runtime::{EverTask, EverTaskBuilder};
pub use storage::{MemoryTaskStorage, TaskStorage};
pub use task::{TaskContext, TaskHandler, TaskRequest};
