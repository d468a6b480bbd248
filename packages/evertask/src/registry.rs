//! Handler registry.
//!
//! Maps task type names to type-erased entries able to deserialize a
//! persisted payload and drive the typed handler. Populated once at startup,
//! the registry is the static replacement for runtime type lookup: it is
//! what lets recovery resolve stored rows back to concrete request types.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::model::AuditLevel;
use crate::retry::RetryPolicy;
use crate::task::{TaskContext, TaskHandler, TaskRequest};

/// Type-erased handler entry stored in the registry.
#[async_trait::async_trait]
pub(crate) trait ErasedTaskHandler: Send + Sync {
    fn task_type(&self) -> &'static str;
    fn handler_type(&self) -> &'static str;

    /// Deserialize the payload without running anything. Used by recovery to
    /// reject rows whose stored request no longer matches the type.
    fn check_payload(&self, payload: &str) -> anyhow::Result<()>;

    /// Deserialize the payload and execute the handler.
    async fn run(&self, payload: &str, ctx: TaskContext) -> anyhow::Result<()>;

    async fn on_started(&self, id: Uuid) -> anyhow::Result<()>;
    async fn on_completed(&self, id: Uuid) -> anyhow::Result<()>;
    async fn on_error(
        &self,
        id: Uuid,
        message: &str,
        error: Option<&anyhow::Error>,
    ) -> anyhow::Result<()>;
    async fn dispose(&self) -> anyhow::Result<()>;

    fn retry_policy(&self) -> Option<Arc<dyn RetryPolicy>>;
    fn timeout(&self) -> Option<Duration>;
    fn cpu_bound(&self) -> bool;
    fn audit_level(&self) -> Option<AuditLevel>;
    fn queue(&self) -> Option<&str>;
}

struct HandlerEntry<R, H> {
    handler: Arc<H>,
    _request: PhantomData<fn() -> R>,
}

#[async_trait::async_trait]
impl<R, H> ErasedTaskHandler for HandlerEntry<R, H>
where
    R: TaskRequest,
    H: TaskHandler<R>,
{
    fn task_type(&self) -> &'static str {
        R::TASK_TYPE
    }

    fn handler_type(&self) -> &'static str {
        std::any::type_name::<H>()
    }

    fn check_payload(&self, payload: &str) -> anyhow::Result<()> {
        serde_json::from_str::<R>(payload)
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("payload does not deserialize as {}: {e}", R::TASK_TYPE))
    }

    async fn run(&self, payload: &str, ctx: TaskContext) -> anyhow::Result<()> {
        let request: R = serde_json::from_str(payload)
            .map_err(|e| anyhow::anyhow!("payload does not deserialize as {}: {e}", R::TASK_TYPE))?;
        self.handler.handle(request, ctx).await
    }

    async fn on_started(&self, id: Uuid) -> anyhow::Result<()> {
        self.handler.on_started(id).await
    }

    async fn on_completed(&self, id: Uuid) -> anyhow::Result<()> {
        self.handler.on_completed(id).await
    }

    async fn on_error(
        &self,
        id: Uuid,
        message: &str,
        error: Option<&anyhow::Error>,
    ) -> anyhow::Result<()> {
        self.handler.on_error(id, message, error).await
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        self.handler.dispose().await
    }

    fn retry_policy(&self) -> Option<Arc<dyn RetryPolicy>> {
        self.handler.retry_policy()
    }

    fn timeout(&self) -> Option<Duration> {
        self.handler.timeout()
    }

    fn cpu_bound(&self) -> bool {
        self.handler.cpu_bound()
    }

    fn audit_level(&self) -> Option<AuditLevel> {
        self.handler.audit_level()
    }

    fn queue(&self) -> Option<&str> {
        self.handler.queue()
    }
}

/// Registry mapping task type names to handlers.
///
/// # Panics
///
/// `register` panics on a duplicate task type: two handlers for one type is
/// a wiring bug that should fail at startup, not at dispatch.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: HashMap<&'static str, Arc<dyn ErasedTaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for requests of type `R`.
    pub fn register<R, H>(&mut self, handler: H)
    where
        R: TaskRequest,
        H: TaskHandler<R>,
    {
        if self.entries.contains_key(R::TASK_TYPE) {
            panic!("handler already registered for task type: {}", R::TASK_TYPE);
        }
        self.entries.insert(
            R::TASK_TYPE,
            Arc::new(HandlerEntry {
                handler: Arc::new(handler),
                _request: PhantomData::<fn() -> R>,
            }),
        );
    }

    pub(crate) fn get(&self, task_type: &str) -> Option<Arc<dyn ErasedTaskHandler>> {
        self.entries.get(task_type).cloned()
    }

    pub fn is_registered(&self, task_type: &str) -> bool {
        self.entries.contains_key(task_type)
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registered_types", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::clock::SystemClock;
    use crate::config::PersistentLoggerConfig;
    use crate::logs::TaskLogger;

    #[derive(Debug, Serialize, Deserialize)]
    struct Greet {
        name: String,
    }

    impl TaskRequest for Greet {
        const TASK_TYPE: &'static str = "test::Greet";
    }

    struct GreetHandler;

    #[async_trait::async_trait]
    impl TaskHandler<Greet> for GreetHandler {
        async fn handle(&self, task: Greet, _ctx: TaskContext) -> anyhow::Result<()> {
            anyhow::ensure!(!task.name.is_empty(), "name required");
            Ok(())
        }
    }

    fn ctx() -> TaskContext {
        let id = Uuid::now_v7();
        TaskContext {
            task_id: id,
            cancellation: CancellationToken::new(),
            logger: TaskLogger::new(
                id,
                PersistentLoggerConfig::default(),
                Arc::new(SystemClock),
            ),
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register::<Greet, _>(GreetHandler);

        assert!(registry.is_registered("test::Greet"));
        assert!(!registry.is_registered("test::Other"));
        assert_eq!(registry.len(), 1);
        assert!(registry.registered_types().contains(&"test::Greet"));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_registration_panics() {
        let mut registry = HandlerRegistry::new();
        registry.register::<Greet, _>(GreetHandler);
        registry.register::<Greet, _>(GreetHandler);
    }

    #[test]
    fn check_payload_rejects_mismatched_json() {
        let mut registry = HandlerRegistry::new();
        registry.register::<Greet, _>(GreetHandler);
        let entry = registry.get("test::Greet").unwrap();

        assert!(entry.check_payload(r#"{"name":"ada"}"#).is_ok());
        assert!(entry.check_payload(r#"{"wrong":1}"#).is_err());
    }

    #[tokio::test]
    async fn run_deserializes_and_executes() {
        let mut registry = HandlerRegistry::new();
        registry.register::<Greet, _>(GreetHandler);
        let entry = registry.get("test::Greet").unwrap();

        assert!(entry.run(r#"{"name":"ada"}"#, ctx()).await.is_ok());
        assert!(entry.run(r#"{"name":""}"#, ctx()).await.is_err());
    }

    #[test]
    fn handler_type_is_the_concrete_type_name() {
        let mut registry = HandlerRegistry::new();
        registry.register::<Greet, _>(GreetHandler);
        let entry = registry.get("test::Greet").unwrap();
        assert!(entry.handler_type().contains("GreetHandler"));
    }
}
