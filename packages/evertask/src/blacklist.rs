//! Process-local cancellation state.
//!
//! The [`Blacklist`] holds ids cancelled by the user so that copies already
//! sitting in a queue are discarded on dequeue. The [`CancellationRegistry`]
//! maps running task ids to their cancellation handles. Both are in-memory
//! only and vanish at process exit.

use dashmap::{DashMap, DashSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Set of task ids cancelled by the user.
#[derive(Debug, Default)]
pub(crate) struct Blacklist {
    ids: DashSet<Uuid>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: Uuid) {
        self.ids.insert(id);
    }

    pub fn is_blacklisted(&self, id: Uuid) -> bool {
        self.ids.contains(&id)
    }

    pub fn remove(&self, id: Uuid) {
        self.ids.remove(&id);
    }
}

/// Per-task cancellation handles for in-flight executions.
#[derive(Debug, Default)]
pub(crate) struct CancellationRegistry {
    tokens: DashMap<Uuid, CancellationToken>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the token passed to the handler, linked to `parent`.
    ///
    /// Replaces any prior handle for the same id (retry and recurring
    /// re-executions re-register).
    pub fn create_token(&self, id: Uuid, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        self.tokens.insert(id, token.clone());
        token
    }

    pub fn try_get(&self, id: Uuid) -> Option<CancellationToken> {
        self.tokens.get(&id).map(|entry| entry.clone())
    }

    /// Cancel the handle for `id`, if one is registered.
    pub fn cancel(&self, id: Uuid) {
        if let Some(token) = self.tokens.get(&id) {
            token.cancel();
        }
    }

    pub fn delete(&self, id: Uuid) {
        self.tokens.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklist_add_check_remove() {
        let blacklist = Blacklist::new();
        let id = Uuid::now_v7();

        assert!(!blacklist.is_blacklisted(id));
        blacklist.add(id);
        assert!(blacklist.is_blacklisted(id));
        blacklist.remove(id);
        assert!(!blacklist.is_blacklisted(id));
    }

    #[test]
    fn registry_cancel_reaches_the_issued_token() {
        let registry = CancellationRegistry::new();
        let parent = CancellationToken::new();
        let id = Uuid::now_v7();

        let token = registry.create_token(id, &parent);
        assert!(!token.is_cancelled());

        registry.cancel(id);
        assert!(token.is_cancelled());
    }

    #[test]
    fn parent_cancellation_propagates() {
        let registry = CancellationRegistry::new();
        let parent = CancellationToken::new();
        let token = registry.create_token(Uuid::now_v7(), &parent);

        parent.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn create_token_replaces_prior_handle() {
        let registry = CancellationRegistry::new();
        let parent = CancellationToken::new();
        let id = Uuid::now_v7();

        let first = registry.create_token(id, &parent);
        let second = registry.create_token(id, &parent);

        registry.cancel(id);
        assert!(!first.is_cancelled());
        assert!(second.is_cancelled());
    }

    #[test]
    fn delete_removes_the_handle() {
        let registry = CancellationRegistry::new();
        let parent = CancellationToken::new();
        let id = Uuid::now_v7();

        registry.create_token(id, &parent);
        registry.delete(id);
        assert!(registry.try_get(id).is_none());
    }
}
