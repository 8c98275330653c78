//! Sticky routing: `(provider:model)` → last-selected auth id.
//!
//! Keeping a conversation on the same upstream account preserves that
//! account's prompt cache. Entries expire on their own TTL so a dead account
//! doesn't stay sticky forever.

use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;

/// How long a sticky binding survives without being refreshed.
const STICKY_TTL: Duration = Duration::from_secs(600);

struct Entry {
    auth_id: String,
    /// Unix seconds of the last refresh.
    updated_at: i64,
}

#[derive(Default)]
pub struct StickyStore {
    entries: DashMap<String, Entry>,
}

impl StickyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(provider: &str, model: &str) -> String {
        format!("{provider}:{model}")
    }

    /// Current binding, if it hasn't expired.
    pub fn get(&self, provider: &str, model: &str) -> Option<String> {
        let key = Self::key(provider, model);
        let entry = self.entries.get(&key)?;
        let age = Utc::now().timestamp() - entry.updated_at;
        if age >= STICKY_TTL.as_secs() as i64 {
            drop(entry);
            self.entries.remove(&key);
            return None;
        }
        Some(entry.auth_id.clone())
    }

    pub fn set(&self, provider: &str, model: &str, auth_id: &str) {
        self.entries.insert(
            Self::key(provider, model),
            Entry {
                auth_id: auth_id.to_string(),
                updated_at: Utc::now().timestamp(),
            },
        );
    }

    /// Drop bindings to a credential that just failed or was unregistered.
    pub fn evict_auth(&self, auth_id: &str) {
        self.entries.retain(|_, entry| entry.auth_id != auth_id);
    }

    /// TTL sweep, called from the selector's maintenance loop.
    pub fn sweep(&self) -> usize {
        let now = Utc::now().timestamp();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now - entry.updated_at < STICKY_TTL.as_secs() as i64);
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let sticky = StickyStore::new();
        sticky.set("claude", "claude-sonnet-4-5", "auth-1");
        assert_eq!(
            sticky.get("claude", "claude-sonnet-4-5").as_deref(),
            Some("auth-1")
        );
        assert_eq!(sticky.get("claude", "other-model"), None);
    }

    #[test]
    fn evict_auth_clears_all_its_bindings() {
        let sticky = StickyStore::new();
        sticky.set("claude", "m1", "auth-1");
        sticky.set("claude", "m2", "auth-1");
        sticky.set("claude", "m3", "auth-2");
        sticky.evict_auth("auth-1");
        assert_eq!(sticky.get("claude", "m1"), None);
        assert_eq!(sticky.get("claude", "m3").as_deref(), Some("auth-2"));
    }

    #[test]
    fn sweep_keeps_fresh_entries() {
        let sticky = StickyStore::new();
        sticky.set("p", "m", "auth-1");
        assert_eq!(sticky.sweep(), 0);
        assert!(sticky.get("p", "m").is_some());
    }
}
