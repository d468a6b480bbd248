//! Bounded run queues.
//!
//! A [`WorkQueue`] is a bounded multi-producer / multi-consumer channel with
//! a configurable full-queue policy. The [`QueueManager`] owns the named
//! queues: `default` always exists, `recurring` is created on first use, and
//! every enqueue passes the blacklist gate and marks the task `Queued`.
//!
//! Implemented on a mutex-held deque with a capacity semaphore and a wakeup
//! [`Notify`] rather than an mpsc channel: `DropOldest` needs to remove the
//! head from the producer side.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{Notify, Semaphore, TryAcquireError};

use crate::blacklist::Blacklist;
use crate::config::{EverTaskConfig, FullMode};
use crate::error::TaskError;
use crate::executor::TaskExecutor;
use crate::model::AuditLevel;
use crate::retry::RetryPolicy;
use crate::storage::TaskStorage;

pub(crate) const DEFAULT_QUEUE: &str = "default";
pub(crate) const RECURRING_QUEUE: &str = "recurring";

/// Per-queue execution defaults, resolved against the global configuration
/// at queue creation. Handler overrides still win at execution time.
#[derive(Clone)]
pub(crate) struct QueueSettings {
    pub capacity: usize,
    pub full_mode: FullMode,
    pub max_parallelism: usize,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub timeout: Option<std::time::Duration>,
    pub audit_level: AuditLevel,
}

struct QueueShared {
    items: Mutex<VecDeque<TaskExecutor>>,
    slots: Semaphore,
    ready: Notify,
    closed: AtomicBool,
}

/// One bounded named queue.
pub(crate) struct WorkQueue {
    name: String,
    settings: QueueSettings,
    shared: QueueShared,
}

impl WorkQueue {
    fn new(name: String, settings: QueueSettings) -> Self {
        let capacity = settings.capacity;
        Self {
            name,
            settings,
            shared: QueueShared {
                items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                slots: Semaphore::new(capacity),
                ready: Notify::new(),
                closed: AtomicBool::new(false),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.shared.items.lock().expect("queue poisoned").len()
    }

    fn push_unchecked(&self, executor: TaskExecutor) {
        self.shared
            .items
            .lock()
            .expect("queue poisoned")
            .push_back(executor);
        self.shared.ready.notify_one();
    }

    fn pop(&self) -> Option<TaskExecutor> {
        let item = self.shared.items.lock().expect("queue poisoned").pop_front();
        if item.is_some() {
            self.shared.slots.add_permits(1);
        }
        item
    }

    /// Block until a slot frees up, then enqueue.
    pub async fn push_wait(&self, executor: TaskExecutor) -> Result<(), TaskError> {
        let permit = self.shared.slots.acquire().await.map_err(|_| {
            TaskError::QueueClosed {
                name: self.name.clone(),
            }
        })?;
        permit.forget();
        self.push_unchecked(executor);
        Ok(())
    }

    /// Enqueue if a slot is free; hand the executor back when the queue is
    /// full.
    pub fn push_or_full(
        &self,
        executor: TaskExecutor,
    ) -> Result<Option<TaskExecutor>, TaskError> {
        match self.shared.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.push_unchecked(executor);
                Ok(None)
            }
            Err(TryAcquireError::NoPermits) => Ok(Some(executor)),
            Err(TryAcquireError::Closed) => Err(TaskError::QueueClosed {
                name: self.name.clone(),
            }),
        }
    }

    /// Enqueue, evicting the oldest queued item when full.
    pub fn push_drop_oldest(&self, executor: TaskExecutor) -> Result<(), TaskError> {
        match self.shared.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.push_unchecked(executor);
                Ok(())
            }
            Err(TryAcquireError::NoPermits) => {
                let evicted = self
                    .shared
                    .items
                    .lock()
                    .expect("queue poisoned")
                    .pop_front();
                if let Some(evicted) = evicted {
                    tracing::warn!(
                        task_id = %evicted.id,
                        queue = %self.name,
                        "queue full, evicting oldest item"
                    );
                }
                self.push_unchecked(executor);
                Ok(())
            }
            Err(TryAcquireError::Closed) => Err(TaskError::QueueClosed {
                name: self.name.clone(),
            }),
        }
    }

    /// Await the next item. Returns `None` once the queue is closed and
    /// drained.
    pub async fn dequeue(&self) -> Option<TaskExecutor> {
        loop {
            let notified = self.shared.ready.notified();
            if let Some(item) = self.pop() {
                return Some(item);
            }
            if self.shared.closed.load(Ordering::SeqCst) {
                return self.pop();
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.slots.close();
        self.shared.ready.notify_waiters();
    }
}

type PoolSpawner = Box<dyn Fn(Arc<WorkQueue>) + Send + Sync>;

/// Owner of the named queues.
pub(crate) struct QueueManager {
    queues: DashMap<String, Arc<WorkQueue>>,
    blacklist: Arc<Blacklist>,
    storage: Option<Arc<dyn TaskStorage>>,
    config: EverTaskConfig,
    /// Installed by the runtime so lazily created queues get a worker pool.
    pool_spawner: Mutex<Option<PoolSpawner>>,
}

impl QueueManager {
    pub fn new(
        config: EverTaskConfig,
        blacklist: Arc<Blacklist>,
        storage: Option<Arc<dyn TaskStorage>>,
    ) -> Self {
        let manager = Self {
            queues: DashMap::new(),
            blacklist,
            storage,
            config,
            pool_spawner: Mutex::new(None),
        };
        manager.insert_queue(DEFAULT_QUEUE);
        let names: Vec<String> = manager.config.queues.keys().cloned().collect();
        for name in names {
            manager.insert_queue(&name);
        }
        manager
    }

    fn build_settings(&self, name: &str) -> QueueSettings {
        let overrides = self.config.queues.get(name);
        QueueSettings {
            capacity: overrides
                .and_then(|q| q.capacity)
                .unwrap_or(self.config.channel_capacity)
                .max(1),
            full_mode: overrides
                .and_then(|q| q.full_mode)
                .unwrap_or(self.config.channel_full_mode),
            max_parallelism: overrides
                .and_then(|q| q.max_degree_of_parallelism)
                .unwrap_or(self.config.max_degree_of_parallelism)
                .max(1),
            retry_policy: overrides
                .and_then(|q| q.retry_policy.clone())
                .unwrap_or_else(|| self.config.default_retry_policy.clone()),
            timeout: overrides
                .and_then(|q| q.timeout)
                .or(self.config.default_timeout),
            audit_level: overrides
                .and_then(|q| q.audit_level)
                .unwrap_or(self.config.default_audit_level),
        }
    }

    fn insert_queue(&self, name: &str) -> Arc<WorkQueue> {
        let queue = Arc::new(WorkQueue::new(name.to_string(), self.build_settings(name)));
        self.queues.insert(name.to_string(), queue.clone());
        queue
    }

    /// Install the callback that gives lazily created queues a worker pool.
    pub fn set_pool_spawner(&self, spawner: PoolSpawner) {
        *self.pool_spawner.lock().expect("spawner poisoned") = Some(spawner);
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkQueue>> {
        self.queues.get(name).map(|q| q.clone())
    }

    pub fn all(&self) -> Vec<Arc<WorkQueue>> {
        self.queues.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Effective audit level for a queue name, before handler overrides.
    pub fn audit_level_for(&self, name: Option<&str>) -> AuditLevel {
        let name = name.unwrap_or(DEFAULT_QUEUE);
        self.config
            .queues
            .get(name)
            .and_then(|q| q.audit_level)
            .unwrap_or(self.config.default_audit_level)
    }

    fn resolve(&self, executor: &TaskExecutor) -> Result<Arc<WorkQueue>, TaskError> {
        let name = executor.queue_name.clone().unwrap_or_else(|| {
            if executor.is_recurring() {
                RECURRING_QUEUE.to_string()
            } else {
                DEFAULT_QUEUE.to_string()
            }
        });

        if let Some(queue) = self.get(&name) {
            return Ok(queue);
        }
        if name == RECURRING_QUEUE {
            // Created on first use, with a worker pool if the runtime is up.
            let queue = self.insert_queue(RECURRING_QUEUE);
            if let Some(spawner) = &*self.pool_spawner.lock().expect("spawner poisoned") {
                spawner(queue.clone());
            }
            return Ok(queue);
        }
        Err(TaskError::QueueNotFound { name })
    }

    /// Route an executor into its queue.
    ///
    /// Blacklisted ids are consumed and discarded; everything else is marked
    /// `Queued` and written according to the queue's full-mode policy.
    pub async fn enqueue(&self, executor: TaskExecutor) -> Result<(), TaskError> {
        if self.blacklist.is_blacklisted(executor.id) {
            self.blacklist.remove(executor.id);
            tracing::debug!(task_id = %executor.id, "discarding blacklisted task on enqueue");
            return Ok(());
        }

        let queue = self.resolve(&executor)?;

        if let Some(storage) = &self.storage {
            if let Err(error) = storage.set_queued(executor.id, executor.audit_level).await {
                tracing::warn!(task_id = %executor.id, error = %error, "failed to mark task queued");
            }
        }

        match queue.settings().full_mode {
            FullMode::Wait => queue.push_wait(executor).await,
            FullMode::DropWrite => {
                if let Some(dropped) = queue.push_or_full(executor)? {
                    tracing::warn!(
                        task_id = %dropped.id,
                        queue = %queue.name(),
                        "queue full, dropping write"
                    );
                }
                Ok(())
            }
            FullMode::DropOldest => queue.push_drop_oldest(executor),
            FullMode::FallbackToDefault => match queue.push_or_full(executor)? {
                None => Ok(()),
                Some(executor) => {
                    tracing::warn!(
                        task_id = %executor.id,
                        queue = %queue.name(),
                        "queue full, spilling to default queue"
                    );
                    let default = self.get(DEFAULT_QUEUE).ok_or(TaskError::QueueNotFound {
                        name: DEFAULT_QUEUE.to_string(),
                    })?;
                    default.push_wait(executor).await
                }
            },
        }
    }

    pub fn close_all(&self) {
        for entry in self.queues.iter() {
            entry.value().close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::QueueConfig;
    use crate::registry::{tests_support, HandlerRegistry};

    fn manager(config: EverTaskConfig) -> QueueManager {
        QueueManager::new(config, Arc::new(Blacklist::new()), None)
    }

    fn executor() -> TaskExecutor {
        let mut registry = HandlerRegistry::new();
        tests_support::register_noop(&mut registry);
        TaskExecutor {
            id: uuid::Uuid::now_v7(),
            task_type: tests_support::NOOP_TYPE.to_string(),
            payload: "{}".to_string(),
            handler: registry.get(tests_support::NOOP_TYPE).unwrap(),
            execution_time: None,
            recurrence: None,
            next_recurring_run: None,
            queue_name: None,
            audit_level: AuditLevel::Full,
            run_count: 0,
        }
    }

    #[tokio::test]
    async fn fifo_roundtrip() {
        let manager = manager(EverTaskConfig::default());
        let first = executor();
        let second = executor();
        manager.enqueue(first.clone()).await.unwrap();
        manager.enqueue(second.clone()).await.unwrap();

        let queue = manager.get(DEFAULT_QUEUE).unwrap();
        assert_eq!(queue.dequeue().await.unwrap().id, first.id);
        assert_eq!(queue.dequeue().await.unwrap().id, second.id);
    }

    #[tokio::test]
    async fn unknown_queue_is_rejected() {
        let manager = manager(EverTaskConfig::default());
        let mut item = executor();
        item.queue_name = Some("nope".to_string());
        let err = manager.enqueue(item).await.unwrap_err();
        assert!(matches!(err, TaskError::QueueNotFound { .. }));
    }

    #[tokio::test]
    async fn recurring_queue_is_created_on_first_use() {
        let manager = manager(EverTaskConfig::default());
        assert!(manager.get(RECURRING_QUEUE).is_none());

        let mut item = executor();
        item.recurrence = Some(crate::recurrence::RecurrenceSpec::every_minutes(1));
        manager.enqueue(item).await.unwrap();

        let queue = manager.get(RECURRING_QUEUE).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn blacklisted_id_is_discarded_and_unlisted() {
        let blacklist = Arc::new(Blacklist::new());
        let manager =
            QueueManager::new(EverTaskConfig::default(), blacklist.clone(), None);
        let item = executor();
        blacklist.add(item.id);

        manager.enqueue(item.clone()).await.unwrap();
        assert_eq!(manager.get(DEFAULT_QUEUE).unwrap().len(), 0);
        assert!(!blacklist.is_blacklisted(item.id));
    }

    #[tokio::test]
    async fn blacklisted_id_is_discarded_even_for_unknown_queues() {
        let blacklist = Arc::new(Blacklist::new());
        let manager =
            QueueManager::new(EverTaskConfig::default(), blacklist.clone(), None);
        let mut item = executor();
        item.queue_name = Some("nope".to_string());
        blacklist.add(item.id);

        // The blacklist gate comes first: no QueueNotFound surfaces.
        manager.enqueue(item.clone()).await.unwrap();
        assert!(!blacklist.is_blacklisted(item.id));
    }

    #[tokio::test]
    async fn wait_mode_blocks_until_a_slot_frees() {
        let config = EverTaskConfig::default()
            .with_channel_capacity(1)
            .with_channel_full_mode(FullMode::Wait);
        let manager = Arc::new(manager(config));
        manager.enqueue(executor()).await.unwrap();

        let blocked = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.enqueue(executor()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        // Free a slot; the producer unblocks.
        manager.get(DEFAULT_QUEUE).unwrap().dequeue().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("producer stayed blocked")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn drop_write_discards_when_full() {
        let config = EverTaskConfig::default()
            .with_channel_capacity(1)
            .with_channel_full_mode(FullMode::DropWrite);
        let manager = manager(config);
        let kept = executor();
        manager.enqueue(kept.clone()).await.unwrap();
        manager.enqueue(executor()).await.unwrap();

        let queue = manager.get(DEFAULT_QUEUE).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue().await.unwrap().id, kept.id);
    }

    #[tokio::test]
    async fn drop_oldest_evicts_the_head() {
        let config = EverTaskConfig::default()
            .with_channel_capacity(1)
            .with_channel_full_mode(FullMode::DropOldest);
        let manager = manager(config);
        manager.enqueue(executor()).await.unwrap();
        let newest = executor();
        manager.enqueue(newest.clone()).await.unwrap();

        let queue = manager.get(DEFAULT_QUEUE).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue().await.unwrap().id, newest.id);
    }

    #[tokio::test]
    async fn fallback_spills_to_the_default_queue() {
        let config = EverTaskConfig::default().with_queue(
            "narrow",
            QueueConfig::default()
                .with_capacity(1)
                .with_full_mode(FullMode::FallbackToDefault),
        );
        let manager = manager(config);

        let mut first = executor();
        first.queue_name = Some("narrow".to_string());
        let mut second = executor();
        second.queue_name = Some("narrow".to_string());
        manager.enqueue(first).await.unwrap();
        manager.enqueue(second.clone()).await.unwrap();

        assert_eq!(manager.get("narrow").unwrap().len(), 1);
        let default = manager.get(DEFAULT_QUEUE).unwrap();
        assert_eq!(default.dequeue().await.unwrap().id, second.id);
    }

    #[tokio::test]
    async fn closed_queue_drains_then_ends() {
        let manager = manager(EverTaskConfig::default());
        manager.enqueue(executor()).await.unwrap();

        let queue = manager.get(DEFAULT_QUEUE).unwrap();
        queue.close();
        assert!(queue.dequeue().await.is_some());
        assert!(queue.dequeue().await.is_none());
    }

    #[test]
    fn per_queue_settings_inherit_global_defaults() {
        let config = EverTaskConfig::default()
            .with_max_degree_of_parallelism(7)
            .with_queue("emails", QueueConfig::default().with_capacity(5));
        let manager = manager(config);

        let settings = manager.get("emails").unwrap().settings().clone();
        assert_eq!(settings.capacity, 5);
        assert_eq!(settings.max_parallelism, 7);
    }
}
