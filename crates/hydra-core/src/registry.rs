//! Model registry — maps public model names to per-provider wire ids and the
//! limits executors clamp against (thinking budget, max output tokens).
//!
//! The hot path reads an immutable snapshot out of an `ArcSwap`; updates
//! clone the table under the writer lock, mutate the clone, and publish it
//! with a pointer swap. Readers never lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;

/// Static facts about one model on one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    /// Public name clients send (e.g. "claude-sonnet-4-5").
    pub name: &'static str,
    /// Provider that serves it.
    pub provider: &'static str,
    /// Wire id the provider expects, when it differs from `name`.
    pub upstream_id: Option<&'static str>,
    /// Hard cap on output tokens.
    pub max_output_tokens: u32,
    /// Thinking budget bounds; `None` = no extended thinking.
    pub thinking_budget: Option<(u32, u32)>,
}

impl ModelInfo {
    /// The id to put on the wire for this provider.
    pub fn wire_id(&self) -> &str {
        self.upstream_id.unwrap_or(self.name)
    }

    /// Clamp a requested thinking budget into this model's supported range.
    pub fn clamp_thinking_budget(&self, requested: u32) -> Option<u32> {
        let (min, max) = self.thinking_budget?;
        Some(requested.clamp(min, max))
    }

    /// Clamp a requested max-token count to the model's output cap.
    pub fn clamp_max_tokens(&self, requested: u32) -> u32 {
        requested.min(self.max_output_tokens)
    }
}

/// Built-in table. Hosts may extend it at runtime through `ModelRegistry`.
const BUILTIN_MODELS: &[ModelInfo] = &[
    ModelInfo {
        name: "claude-sonnet-4-5",
        provider: "claude",
        upstream_id: None,
        max_output_tokens: 64_000,
        thinking_budget: Some((1024, 60_000)),
    },
    ModelInfo {
        name: "claude-opus-4-1",
        provider: "claude",
        upstream_id: None,
        max_output_tokens: 32_000,
        thinking_budget: Some((1024, 30_000)),
    },
    ModelInfo {
        name: "claude-haiku-4-5",
        provider: "claude",
        upstream_id: None,
        max_output_tokens: 64_000,
        thinking_budget: Some((1024, 60_000)),
    },
    ModelInfo {
        name: "gemini-2.5-pro",
        provider: "gemini",
        upstream_id: None,
        max_output_tokens: 65_536,
        thinking_budget: Some((128, 32_768)),
    },
    ModelInfo {
        name: "gemini-2.5-flash",
        provider: "gemini",
        upstream_id: None,
        max_output_tokens: 65_536,
        thinking_budget: Some((0, 24_576)),
    },
    ModelInfo {
        name: "gpt-5",
        provider: "openai",
        upstream_id: None,
        max_output_tokens: 128_000,
        thinking_budget: None,
    },
    ModelInfo {
        name: "gpt-5-codex",
        provider: "codex",
        upstream_id: None,
        max_output_tokens: 128_000,
        thinking_budget: None,
    },
    ModelInfo {
        name: "qwen3-coder-plus",
        provider: "qwen",
        upstream_id: None,
        max_output_tokens: 65_536,
        thinking_budget: None,
    },
];

#[derive(Debug, Default)]
struct Table {
    /// `(provider, model-name)` → info. A model may be served by several
    /// providers under the same public name.
    by_key: HashMap<(String, String), ModelInfo>,
}

/// Copy-on-write model registry.
pub struct ModelRegistry {
    snapshot: ArcSwap<Table>,
    /// Serializes updates; readers never take it.
    writer: Mutex<()>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        let mut table = Table::default();
        for info in BUILTIN_MODELS {
            table.by_key.insert(
                (info.provider.to_string(), info.name.to_string()),
                info.clone(),
            );
        }
        Self {
            snapshot: ArcSwap::from_pointee(table),
            writer: Mutex::new(()),
        }
    }

    /// Look up a model as served by `provider`.
    pub fn lookup(&self, provider: &str, model: &str) -> Option<ModelInfo> {
        self.snapshot
            .load()
            .by_key
            .get(&(provider.to_string(), model.to_string()))
            .cloned()
    }

    /// Resolve the wire id for `model` on `provider`; unknown models pass
    /// through unchanged so new upstream models work before the table learns
    /// about them.
    pub fn resolve_wire_id(&self, provider: &str, model: &str) -> String {
        self.lookup(provider, model)
            .map(|m| m.wire_id().to_string())
            .unwrap_or_else(|| model.to_string())
    }

    /// Register or replace an entry. Clones the table, mutates the clone,
    /// publishes it with a swap.
    pub fn upsert(&self, info: ModelInfo) {
        let _guard = self.writer.lock().expect("registry writer poisoned");
        let current = self.snapshot.load_full();
        let mut next = Table {
            by_key: current.by_key.clone(),
        };
        next.by_key.insert(
            (info.provider.to_string(), info.name.to_string()),
            info,
        );
        self.snapshot.store(Arc::new(next));
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_lookup_resolves() {
        let reg = ModelRegistry::new();
        let info = reg.lookup("claude", "claude-sonnet-4-5").unwrap();
        assert_eq!(info.wire_id(), "claude-sonnet-4-5");
        assert_eq!(info.clamp_thinking_budget(1), Some(1024));
        assert_eq!(info.clamp_thinking_budget(100_000), Some(60_000));
    }

    #[test]
    fn unknown_model_passes_through() {
        let reg = ModelRegistry::new();
        assert_eq!(reg.resolve_wire_id("claude", "brand-new"), "brand-new");
    }

    #[test]
    fn upsert_is_visible_to_readers() {
        let reg = ModelRegistry::new();
        reg.upsert(ModelInfo {
            name: "claude-sonnet-4-5",
            provider: "antigravity",
            upstream_id: Some("claude-sonnet-4-5-ag"),
            max_output_tokens: 8192,
            thinking_budget: None,
        });
        assert_eq!(
            reg.resolve_wire_id("antigravity", "claude-sonnet-4-5"),
            "claude-sonnet-4-5-ag"
        );
        // Original provider entry untouched.
        assert_eq!(
            reg.resolve_wire_id("claude", "claude-sonnet-4-5"),
            "claude-sonnet-4-5"
        );
    }

    #[test]
    fn readers_keep_their_snapshot_across_updates() {
        let reg = ModelRegistry::new();
        let before = reg.lookup("claude", "claude-opus-4-1").unwrap();
        reg.upsert(ModelInfo {
            name: "claude-opus-4-1",
            provider: "claude",
            upstream_id: Some("claude-opus-4-1-v2"),
            max_output_tokens: 32_000,
            thinking_budget: None,
        });
        // The value read before the swap is unchanged; new reads see the update.
        assert_eq!(before.wire_id(), "claude-opus-4-1");
        assert_eq!(
            reg.resolve_wire_id("claude", "claude-opus-4-1"),
            "claude-opus-4-1-v2"
        );
    }

    #[test]
    fn max_tokens_clamps_to_cap() {
        let reg = ModelRegistry::new();
        let info = reg.lookup("claude", "claude-opus-4-1").unwrap();
        assert_eq!(info.clamp_max_tokens(1_000_000), 32_000);
        assert_eq!(info.clamp_max_tokens(512), 512);
    }
}
