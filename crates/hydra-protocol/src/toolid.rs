//! Tool-call id normalization.
//!
//! Internally every id is `call_<body>`. Claude speaks `toolu_<body>`, one
//! legacy Claude dialect `tooluse_<body>`. Parsers fold any recognized prefix
//! to the canonical form; emitters re-prefix for the target dialect, so a
//! round-trip returns the exact original id.

use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

/// Canonical internal prefix.
pub const CANONICAL_PREFIX: &str = "call_";

const CLAUDE_PREFIX: &str = "toolu_";
const CLAUDE_LEGACY_PREFIX: &str = "tooluse_";

/// Id dialect used by a wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolIdStyle {
    /// `call_` (OpenAI family, Gemini function calls carry no id at all).
    Call,
    /// `toolu_` (Claude Messages).
    Claude,
}

/// Fold a wire id into the canonical `call_` form.
///
/// Unprefixed ids get the canonical prefix attached so a bare `abc123` from a
/// lenient client still pairs with its result.
pub fn normalize_tool_id(raw: &str) -> String {
    // Order matters: `tooluse_` must be tested before `toolu_`.
    for prefix in [CLAUDE_LEGACY_PREFIX, CLAUDE_PREFIX, CANONICAL_PREFIX] {
        if let Some(body) = raw.strip_prefix(prefix) {
            return format!("{CANONICAL_PREFIX}{body}");
        }
    }
    format!("{CANONICAL_PREFIX}{raw}")
}

/// Re-prefix a canonical id for the target dialect.
pub fn to_wire_tool_id(canonical: &str, style: ToolIdStyle) -> String {
    let body = canonical
        .strip_prefix(CANONICAL_PREFIX)
        .unwrap_or(canonical);
    match style {
        ToolIdStyle::Call => format!("{CANONICAL_PREFIX}{body}"),
        ToolIdStyle::Claude => format!("{CLAUDE_PREFIX}{body}"),
    }
}

/// Assigns ids when the client format carries none (Gemini function calls).
///
/// Calls are queued FIFO per function name; the matching `functionResponse`
/// pops the oldest pending id for that name, so parallel calls to the same
/// tool pair up in order.
#[derive(Debug, Default)]
pub struct ToolIdAllocator {
    pending: HashMap<String, VecDeque<String>>,
}

impl ToolIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh canonical id for a call to `name` and remember it.
    pub fn assign(&mut self, name: &str) -> String {
        let id = format!("{CANONICAL_PREFIX}{}", Uuid::new_v4().simple());
        self.pending
            .entry(name.to_string())
            .or_default()
            .push_back(id.clone());
        id
    }

    /// Pop the oldest outstanding id for `name`; mints one when a result
    /// arrives for a call we never saw (out-of-order history edit).
    pub fn resolve(&mut self, name: &str) -> String {
        match self.pending.get_mut(name).and_then(VecDeque::pop_front) {
            Some(id) => id,
            None => format!("{CANONICAL_PREFIX}{}", Uuid::new_v4().simple()),
        }
    }
}
