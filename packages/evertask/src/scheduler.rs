//! Timer scheduler for delayed and recurring tasks.
//!
//! A single coordinator over a mutex-guarded min-heap keyed by due instant.
//! The loop sleeps exactly until the next item and is woken by producers
//! through a [`Notify`], so an item enqueued earlier than the current sleep
//! target fires on time. Sleeps are capped at 1.5 h so stored long delays
//! are periodically re-evaluated.
//!
//! Due items are handed to the queue manager; a dispatch failure marks the
//! task `Failed` in storage and the loop keeps going.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::{render_error_chain, TaskError};
use crate::executor::TaskExecutor;
use crate::model::TaskStatus;
use crate::queue::QueueManager;
use crate::storage::TaskStorage;

/// Upper bound on one scheduler sleep.
const MAX_SLEEP: StdDuration = StdDuration::from_secs(90 * 60);

struct ScheduledEntry {
    due: DateTime<Utc>,
    /// Insertion order tie-breaker so the heap ordering is total.
    seq: u64,
    executor: TaskExecutor,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for ScheduledEntry {}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

/// Coordinator releasing tasks to the queue manager at their due time.
pub(crate) struct TimerScheduler {
    heap: Mutex<BinaryHeap<Reverse<ScheduledEntry>>>,
    wakeup: Notify,
    seq: AtomicU64,
    queues: Arc<QueueManager>,
    storage: Option<Arc<dyn TaskStorage>>,
    clock: Arc<dyn Clock>,
}

impl TimerScheduler {
    pub fn new(
        queues: Arc<QueueManager>,
        storage: Option<Arc<dyn TaskStorage>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            wakeup: Notify::new(),
            seq: AtomicU64::new(0),
            queues,
            storage,
            clock,
        }
    }

    /// Add an executor, keyed by its next recurring run or execution time.
    pub fn enqueue(&self, executor: TaskExecutor) -> Result<(), TaskError> {
        let due = executor.due_time().ok_or_else(|| {
            TaskError::argument("scheduled task has neither a recurring run nor an execution time")
        })?;

        let entry = ScheduledEntry {
            due,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            executor,
        };
        self.heap.lock().expect("scheduler poisoned").push(Reverse(entry));
        // An item earlier than the current sleep target must wake the loop.
        self.wakeup.notify_one();
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.heap.lock().expect("scheduler poisoned").len()
    }

    fn pop_due(&self, now: DateTime<Utc>) -> Vec<TaskExecutor> {
        let mut heap = self.heap.lock().expect("scheduler poisoned");
        let mut due = Vec::new();
        while heap
            .peek()
            .map(|Reverse(entry)| entry.due <= now)
            .unwrap_or(false)
        {
            let Reverse(entry) = heap.pop().expect("peeked");
            due.push(entry.executor);
        }
        due
    }

    fn next_wait(&self) -> StdDuration {
        let heap = self.heap.lock().expect("scheduler poisoned");
        heap.peek()
            .map(|Reverse(entry)| {
                (entry.due - self.clock.now())
                    .to_std()
                    .unwrap_or(StdDuration::ZERO)
            })
            .unwrap_or(MAX_SLEEP)
            .min(MAX_SLEEP)
    }

    async fn dispatch(&self, executor: TaskExecutor) {
        let id = executor.id;
        let audit_level = executor.audit_level;
        if let Err(error) = self.queues.enqueue(executor).await {
            tracing::error!(task_id = %id, error = %error, "failed to dispatch scheduled task");
            if let Some(storage) = &self.storage {
                let detail = render_error_chain(&anyhow::Error::new(error));
                if let Err(storage_error) = storage
                    .set_status(id, TaskStatus::Failed, Some(detail), audit_level)
                    .await
                {
                    tracing::error!(
                        task_id = %id,
                        error = %storage_error,
                        "failed to mark undispatchable task failed"
                    );
                }
            }
        }
    }

    /// Run until `intake` is cancelled.
    pub async fn run(self: Arc<Self>, intake: CancellationToken) {
        tracing::debug!("timer scheduler starting");
        loop {
            let now = self.clock.now();
            for executor in self.pop_due(now) {
                self.dispatch(executor).await;
            }

            let wait = self.next_wait();
            let notified = self.wakeup.notified();
            tokio::select! {
                _ = intake.cancelled() => break,
                _ = notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        tracing::debug!("timer scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::blacklist::Blacklist;
    use crate::clock::SystemClock;
    use crate::config::EverTaskConfig;
    use crate::model::AuditLevel;
    use crate::queue::DEFAULT_QUEUE;
    use crate::registry::{tests_support, HandlerRegistry};

    fn executor_due_in(ms: i64) -> TaskExecutor {
        let mut registry = HandlerRegistry::new();
        tests_support::register_noop(&mut registry);
        TaskExecutor {
            id: uuid::Uuid::now_v7(),
            task_type: tests_support::NOOP_TYPE.to_string(),
            payload: "{}".to_string(),
            handler: registry.get(tests_support::NOOP_TYPE).unwrap(),
            execution_time: Some(Utc::now() + chrono::Duration::milliseconds(ms)),
            recurrence: None,
            next_recurring_run: None,
            queue_name: None,
            audit_level: AuditLevel::Full,
            run_count: 0,
        }
    }

    fn scheduler() -> (Arc<TimerScheduler>, Arc<QueueManager>) {
        let queues = Arc::new(QueueManager::new(
            EverTaskConfig::default(),
            Arc::new(Blacklist::new()),
            None,
        ));
        let scheduler = Arc::new(TimerScheduler::new(
            queues.clone(),
            None,
            Arc::new(SystemClock),
        ));
        (scheduler, queues)
    }

    #[tokio::test]
    async fn due_item_is_released_to_the_queue() {
        let (scheduler, queues) = scheduler();
        let intake = CancellationToken::new();
        let handle = tokio::spawn(scheduler.clone().run(intake.clone()));

        let item = executor_due_in(100);
        scheduler.enqueue(item.clone()).unwrap();

        let queue = queues.get(DEFAULT_QUEUE).unwrap();
        let released = tokio::time::timeout(Duration::from_secs(2), queue.dequeue())
            .await
            .expect("item was not released")
            .unwrap();
        assert_eq!(released.id, item.id);
        assert_eq!(scheduler.pending_count(), 0);

        intake.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn earlier_item_preempts_the_current_sleep() {
        let (scheduler, queues) = scheduler();
        let intake = CancellationToken::new();
        let handle = tokio::spawn(scheduler.clone().run(intake.clone()));

        // A far-future item sets a long sleep target.
        scheduler.enqueue(executor_due_in(60_000)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A near item must still fire on time.
        let near = executor_due_in(80);
        scheduler.enqueue(near.clone()).unwrap();

        let queue = queues.get(DEFAULT_QUEUE).unwrap();
        let released = tokio::time::timeout(Duration::from_millis(1500), queue.dequeue())
            .await
            .expect("near item was not released")
            .unwrap();
        assert_eq!(released.id, near.id);
        assert_eq!(scheduler.pending_count(), 1);

        intake.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn items_fire_in_due_order() {
        let (scheduler, queues) = scheduler();
        let intake = CancellationToken::new();
        let handle = tokio::spawn(scheduler.clone().run(intake.clone()));

        let late = executor_due_in(200);
        let early = executor_due_in(60);
        scheduler.enqueue(late.clone()).unwrap();
        scheduler.enqueue(early.clone()).unwrap();

        let queue = queues.get(DEFAULT_QUEUE).unwrap();
        let first = queue.dequeue().await.unwrap();
        let second = queue.dequeue().await.unwrap();
        assert_eq!(first.id, early.id);
        assert_eq!(second.id, late.id);

        intake.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn executor_without_due_time_is_rejected() {
        let (scheduler, _queues) = scheduler();
        let mut item = executor_due_in(0);
        item.execution_time = None;
        let err = scheduler.enqueue(item).unwrap_err();
        assert!(matches!(err, TaskError::ArgumentInvalid { .. }));
    }

    #[test]
    fn wait_is_capped() {
        let (scheduler, _queues) = scheduler();
        scheduler.enqueue(executor_due_in(1000 * 60 * 60 * 24)).unwrap();
        assert!(scheduler.next_wait() <= MAX_SLEEP);
    }
}
