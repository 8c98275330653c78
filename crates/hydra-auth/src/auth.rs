//! A single authenticated account with an upstream provider.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known metadata keys. Everything else is provider-specific and passes
/// through untouched.
pub mod meta {
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const REFRESH_TOKEN: &str = "refresh_token";
    /// Unix seconds.
    pub const EXPIRES_AT: &str = "expires_at";
    pub const EMAIL: &str = "email";
    pub const PROXY_URL: &str = "proxy_url";
    pub const BASE_URL: &str = "base_url";
    pub const PROJECT_ID: &str = "project_id";
    /// Long-lived GitHub token exchanged for short-lived Copilot keys.
    pub const GITHUB_TOKEN: &str = "github_token";
}

/// One credential. `Clone` is a deep copy (owned strings and maps all the way
/// down), safe to hand to background work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    pub id: String,
    pub provider: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Token material plus provider-specific attributes.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Per-model blocks: model name → unix seconds the block lifts.
    #[serde(default)]
    pub model_blocks: HashMap<String, i64>,
}

fn default_enabled() -> bool {
    true
}

impl Auth {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            enabled: true,
            metadata: HashMap::new(),
            model_blocks: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn access_token(&self) -> Option<&str> {
        self.meta_str(meta::ACCESS_TOKEN)
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.meta_str(meta::REFRESH_TOKEN)
    }

    /// Token expiry in unix seconds. Absent means "does not expire"
    /// (plain API keys).
    pub fn expires_at(&self) -> Option<i64> {
        self.metadata.get(meta::EXPIRES_AT).and_then(Value::as_i64)
    }

    pub fn proxy_url(&self) -> Option<&str> {
        self.meta_str(meta::PROXY_URL)
    }

    pub fn base_url(&self) -> Option<&str> {
        self.meta_str(meta::BASE_URL)
    }

    pub fn email(&self) -> Option<&str> {
        self.meta_str(meta::EMAIL)
    }

    /// Does the token need a refresh within `margin_secs`?
    pub fn token_expiring(&self, margin_secs: i64) -> bool {
        match self.expires_at() {
            Some(expires_at) => Utc::now().timestamp() + margin_secs >= expires_at,
            None => false,
        }
    }

    /// Is this model currently blocked on this credential?
    pub fn model_blocked(&self, model: &str) -> bool {
        self.model_blocks
            .get(model)
            .is_some_and(|until| Utc::now().timestamp() < *until)
    }

    /// Block `model` for `secs` from now.
    pub fn block_model(&mut self, model: &str, secs: i64) {
        self.model_blocks
            .insert(model.to_string(), Utc::now().timestamp() + secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_expiring_respects_margin() {
        let auth = Auth::new("a", "claude")
            .with_meta(meta::EXPIRES_AT, Utc::now().timestamp() + 60);
        assert!(auth.token_expiring(120));
        assert!(!auth.token_expiring(10));
    }

    #[test]
    fn api_keys_never_expire() {
        let auth = Auth::new("a", "openai").with_meta(meta::ACCESS_TOKEN, "sk-test");
        assert!(!auth.token_expiring(i64::MAX / 2));
    }

    #[test]
    fn model_blocks_lift_after_deadline() {
        let mut auth = Auth::new("a", "gemini");
        auth.block_model("gemini-2.5-pro", 3600);
        assert!(auth.model_blocked("gemini-2.5-pro"));
        assert!(!auth.model_blocked("gemini-2.5-flash"));

        auth.model_blocks
            .insert("gemini-2.5-pro".into(), Utc::now().timestamp() - 1);
        assert!(!auth.model_blocked("gemini-2.5-pro"));
    }

    #[test]
    fn clone_is_deep() {
        let mut original = Auth::new("a", "qwen").with_meta(meta::ACCESS_TOKEN, "t1");
        let copy = original.clone();
        original
            .metadata
            .insert(meta::ACCESS_TOKEN.into(), "t2".into());
        assert_eq!(copy.access_token(), Some("t1"));
    }
}
