//! Runtime assembly and lifecycle.
//!
//! [`EverTask`] wires the pieces together: queues, scheduler, worker pools,
//! dispatcher, monitors, and the startup recovery pass. Hosts build one with
//! [`EverTask::builder`], dispatch through [`EverTask::dispatcher`], and end
//! with [`EverTask::shutdown`], which drains in-flight work inside the
//! configured grace window.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::blacklist::{Blacklist, CancellationRegistry};
use crate::clock::{Clock, SystemClock};
use crate::config::EverTaskConfig;
use crate::dispatcher::{Dispatcher, DispatcherInner};
use crate::error::TaskError;
use crate::monitor::{MonitorHub, TaskMonitor};
use crate::queue::QueueManager;
use crate::recovery::RecoveryService;
use crate::registry::HandlerRegistry;
use crate::scheduler::TimerScheduler;
use crate::storage::TaskStorage;
use crate::task::{TaskHandler, TaskRequest};
use crate::worker::{WorkerContext, WorkerPool};

/// Grace period for handlers to observe cancellation after the shutdown
/// window has elapsed.
const FINAL_DRAIN: Duration = Duration::from_secs(5);

/// Builder for an [`EverTask`] runtime.
pub struct EverTaskBuilder {
    config: EverTaskConfig,
    storage: Option<Arc<dyn TaskStorage>>,
    registry: HandlerRegistry,
    monitors: Vec<Arc<dyn TaskMonitor>>,
    clock: Arc<dyn Clock>,
}

impl EverTaskBuilder {
    fn new(config: EverTaskConfig) -> Self {
        Self {
            config,
            storage: None,
            registry: HandlerRegistry::new(),
            monitors: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `storage` for persistence and startup recovery.
    pub fn storage(mut self, storage: Arc<dyn TaskStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Register `handler` for requests of type `R`.
    pub fn register<R, H>(mut self, handler: H) -> Self
    where
        R: TaskRequest,
        H: TaskHandler<R>,
    {
        self.registry.register::<R, H>(handler);
        self
    }

    /// Subscribe a monitoring sink.
    pub fn monitor(mut self, monitor: Arc<dyn TaskMonitor>) -> Self {
        self.monitors.push(monitor);
        self
    }

    /// Replace the time source (tests).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Start the runtime: spawn the scheduler and worker pools, then run
    /// startup recovery to resume persisted tasks.
    pub async fn start(self) -> Result<EverTask, TaskError> {
        let config = self.config;
        let storage = self.storage;
        let clock = self.clock;

        let blacklist = Arc::new(Blacklist::new());
        let cancellations = Arc::new(CancellationRegistry::new());
        let monitors = Arc::new(MonitorHub::new());
        for monitor in self.monitors {
            monitors.subscribe(monitor);
        }

        let queues = Arc::new(QueueManager::new(
            config.clone(),
            blacklist.clone(),
            storage.clone(),
        ));
        let scheduler = Arc::new(TimerScheduler::new(
            queues.clone(),
            storage.clone(),
            clock.clone(),
        ));

        let intake = CancellationToken::new();
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let worker_ctx = Arc::new(WorkerContext {
            storage: storage.clone(),
            blacklist: blacklist.clone(),
            cancellations: cancellations.clone(),
            scheduler: scheduler.clone(),
            monitors: monitors.clone(),
            clock: clock.clone(),
            config: config.clone(),
            intake: intake.clone(),
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
        });

        // Queues created later (e.g. `recurring` on first use) get their
        // worker pool through this hook.
        {
            let ctx = worker_ctx.clone();
            queues.set_pool_spawner(Box::new(move |queue| {
                tokio::spawn(WorkerPool::new(queue, ctx.clone()).run());
            }));
        }
        for queue in queues.all() {
            tokio::spawn(WorkerPool::new(queue, worker_ctx.clone()).run());
        }

        let scheduler_handle = tokio::spawn(scheduler.clone().run(intake.clone()));

        let dispatcher = Dispatcher::new(DispatcherInner {
            registry: Arc::new(self.registry),
            storage: storage.clone(),
            queues: queues.clone(),
            scheduler: scheduler.clone(),
            blacklist,
            cancellations,
            clock,
            config: config.clone(),
        });

        if let Some(storage) = &storage {
            RecoveryService::new(
                storage.clone(),
                dispatcher.clone(),
                config.default_audit_level,
            )
            .run()
            .await;
        }

        info!("evertask runtime started");
        Ok(EverTask {
            dispatcher,
            queues,
            scheduler_handle,
            intake,
            shutdown,
            tracker,
            shutdown_grace: config.shutdown_grace,
        })
    }
}

/// A running task runtime.
pub struct EverTask {
    dispatcher: Dispatcher,
    queues: Arc<QueueManager>,
    scheduler_handle: JoinHandle<()>,
    intake: CancellationToken,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    shutdown_grace: Duration,
}

impl EverTask {
    /// Start building a runtime with the given configuration.
    pub fn builder(config: EverTaskConfig) -> EverTaskBuilder {
        EverTaskBuilder::new(config)
    }

    /// The submission front door. Clones share the runtime.
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// Stop gracefully.
    ///
    /// Intake stops first; in-flight tasks get the grace window to finish
    /// normally. Whatever is still running is then cancelled and classified
    /// `ServiceStopped`, to be replayed by recovery on the next start. Tasks
    /// still sitting in queues stay `Queued` in storage for the same reason.
    pub async fn shutdown(self) {
        info!("evertask runtime stopping");
        self.intake.cancel();
        self.queues.close_all();
        let _ = self.scheduler_handle.await;

        self.tracker.close();
        if tokio::time::timeout(self.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("shutdown grace elapsed, cancelling in-flight tasks");
            self.shutdown.cancel();
            if tokio::time::timeout(FINAL_DRAIN, self.tracker.wait())
                .await
                .is_err()
            {
                warn!("tasks ignored cancellation, detaching them");
            }
        }
        info!("evertask runtime stopped");
    }
}
