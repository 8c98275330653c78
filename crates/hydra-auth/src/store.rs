//! In-memory credential store.
//!
//! Readers get `Arc<Auth>` snapshots and never block writers: every mutation
//! clones the record, edits the clone, and swaps the pointer in. All runtime
//! state is rebuilt from registered credentials on restart; nothing persists.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::auth::Auth;

#[derive(Default)]
pub struct AuthStore {
    auths: DashMap<String, Arc<Auth>>,
}

impl AuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a credential.
    pub fn register(&self, auth: Auth) {
        info!(auth_id = %auth.id, provider = %auth.provider, "credential registered");
        self.auths.insert(auth.id.clone(), Arc::new(auth));
    }

    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.auths.remove(id).is_some();
        if removed {
            info!(auth_id = %id, "credential unregistered");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<Auth>> {
        self.auths.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of all credentials for one provider, enabled or not; the
    /// selector applies its own filters.
    pub fn for_provider(&self, provider: &str) -> Vec<Arc<Auth>> {
        self.auths
            .iter()
            .filter(|entry| entry.value().provider == provider)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.auths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.auths.is_empty()
    }

    /// Copy-on-write update: clone, mutate the clone, swap. Readers holding
    /// the old `Arc` keep a consistent snapshot.
    pub fn update<F>(&self, id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut Auth),
    {
        let Some(mut entry) = self.auths.get_mut(id) else {
            return false;
        };
        let mut next = entry.value().as_ref().clone();
        mutate(&mut next);
        *entry.value_mut() = Arc::new(next);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::meta;

    #[test]
    fn register_and_filter_by_provider() {
        let store = AuthStore::new();
        store.register(Auth::new("a1", "claude"));
        store.register(Auth::new("a2", "claude"));
        store.register(Auth::new("b1", "gemini"));
        assert_eq!(store.for_provider("claude").len(), 2);
        assert_eq!(store.for_provider("gemini").len(), 1);
        assert!(store.for_provider("openai").is_empty());
    }

    #[test]
    fn update_swaps_snapshot_without_touching_old_readers() {
        let store = AuthStore::new();
        store.register(Auth::new("a1", "qwen").with_meta(meta::ACCESS_TOKEN, "old"));

        let before = store.get("a1").unwrap();
        assert!(store.update("a1", |a| {
            a.metadata
                .insert(meta::ACCESS_TOKEN.into(), "new".into());
        }));

        assert_eq!(before.access_token(), Some("old"));
        assert_eq!(store.get("a1").unwrap().access_token(), Some("new"));
    }

    #[test]
    fn unregister_is_idempotent() {
        let store = AuthStore::new();
        store.register(Auth::new("a1", "claude"));
        assert!(store.unregister("a1"));
        assert!(!store.unregister("a1"));
        assert!(store.get("a1").is_none());
    }
}
