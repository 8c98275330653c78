//! Intermediate representation of a chat request.
//!
//! Every inbound payload is parsed into a `UnifiedRequest` and every outbound
//! payload is built from one. Field names follow the neutral vocabulary, not
//! any one provider's wire format.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// Where the bytes of an image live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    /// Base64 payload carried inline.
    Base64(String),
    /// Remote URL the upstream fetches itself.
    Url(String),
}

/// One block of message content.
///
/// Reasoning blocks carry the provider-supplied thought signature verbatim;
/// it must survive the full round-trip (request → model → response → next
/// request) or multi-turn thinking breaks on the upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    /// Opaque encrypted thinking the client must echo back unchanged.
    RedactedThinking {
        data: String,
    },
    Image {
        mime: String,
        source: ImageSource,
    },
    File {
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        mime: String,
        data: String,
    },
    ToolResult {
        /// Normalized id (`call_` prefix) of the call this result answers.
        call_id: String,
        text: String,
        #[serde(default)]
        is_error: bool,
    },
    ExecutableCode {
        language: String,
        code: String,
    },
    CodeResult {
        outcome: String,
        output: String,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    /// Visible text length, used by the input-token estimate.
    pub fn char_len(&self) -> usize {
        match self {
            ContentPart::Text { text } => text.len(),
            ContentPart::Reasoning { text, .. } => text.len(),
            ContentPart::ToolResult { text, .. } => text.len(),
            ContentPart::ExecutableCode { code, .. } => code.len(),
            ContentPart::CodeResult { output, .. } => output.len(),
            _ => 0,
        }
    }
}

/// A tool invocation requested by the model.
///
/// `id` is always in the internal canonical form (`call_<body>`); emitters
/// re-prefix it for the target dialect. `arguments` stays a raw JSON string
/// because it may be partial while a stream is still accumulating deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

/// One message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Cache breakpoint tag (Claude `cache_control`), when the client set one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
}

impl Message {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            parts: Vec::new(),
            tool_calls: Vec::new(),
            cache_control: None,
        }
    }

    pub fn text(role: Role, text: impl Into<String>) -> Self {
        let mut m = Self::new(role);
        m.parts.push(ContentPart::text(text));
        m
    }

    /// Concatenation of all plain-text parts.
    pub fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Tool definition offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON-schema for the arguments object.
    pub parameters: Value,
}

/// How the model may use the offered tools.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    #[default]
    Auto,
    /// Must call at least one tool.
    Any,
    /// Must call this specific tool.
    Tool(String),
    /// Tools are disabled for this call.
    None,
}

/// Sampling knobs, all optional; unset fields are omitted on the wire.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Sampling {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub logprobs: Option<bool>,
    pub top_logprobs: Option<u32>,
    pub candidate_count: Option<u32>,
}

/// Reasoning effort level for providers that take a label instead of a budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingEffort {
    Minimal,
    Low,
    Medium,
    High,
}

impl ThinkingEffort {
    pub fn as_str(self) -> &'static str {
        match self {
            ThinkingEffort::Minimal => "minimal",
            ThinkingEffort::Low => "low",
            ThinkingEffort::Medium => "medium",
            ThinkingEffort::High => "high",
        }
    }
}

/// Extended-thinking configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ThinkingConfig {
    pub include_thoughts: bool,
    pub budget_tokens: Option<u32>,
    pub effort: Option<ThinkingEffort>,
    /// Summary mode for providers that stream reasoning summaries ("auto", "detailed").
    pub summary: Option<String>,
}

/// Token accounting, normalized across providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub thoughts_tokens: u64,
    pub cached_tokens: u64,
}

impl Usage {
    pub fn is_empty(&self) -> bool {
        *self == Usage::default()
    }

    /// Fill `total_tokens` when the provider only reported the split.
    pub fn with_total(mut self) -> Self {
        if self.total_tokens == 0 {
            self.total_tokens = self.prompt_tokens + self.completion_tokens + self.thoughts_tokens;
        }
        self
    }

    /// Merge a later report into this one, keeping the larger counts.
    pub fn merge(&mut self, other: &Usage) {
        self.prompt_tokens = self.prompt_tokens.max(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.max(other.completion_tokens);
        self.total_tokens = self.total_tokens.max(other.total_tokens);
        self.thoughts_tokens = self.thoughts_tokens.max(other.thoughts_tokens);
        self.cached_tokens = self.cached_tokens.max(other.cached_tokens);
    }
}

/// The canonical request every parser produces and every emitter consumes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UnifiedRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub sampling: Sampling,
    pub thinking: Option<ThinkingConfig>,
    pub tool_choice: Option<ToolChoice>,
    /// Structured-output schema requested by the client, passed through as-is.
    pub response_schema: Option<Value>,
    /// Provider safety settings, passed through as-is.
    pub safety_settings: Option<Value>,
    pub cache_key: Option<String>,
    pub stream: bool,
    /// Unrecognized fields, keyed `"<format>.<field>"` so nothing is lost.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl UnifiedRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Cheap input-token estimate (~4 chars per token over visible text).
    /// Seeds `stream-meta` before the upstream reports real usage.
    pub fn estimate_input_tokens(&self) -> u64 {
        let chars: usize = self
            .messages
            .iter()
            .flat_map(|m| m.parts.iter())
            .map(ContentPart::char_len)
            .sum();
        (chars as u64).div_ceil(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_with_total_fills_missing_sum() {
        let u = Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            thoughts_tokens: 2,
            ..Default::default()
        }
        .with_total();
        assert_eq!(u.total_tokens, 17);
    }

    #[test]
    fn usage_with_total_keeps_provider_total() {
        let u = Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 20,
            ..Default::default()
        }
        .with_total();
        assert_eq!(u.total_tokens, 20);
    }

    #[test]
    fn usage_merge_keeps_max() {
        let mut a = Usage {
            prompt_tokens: 10,
            completion_tokens: 1,
            ..Default::default()
        };
        a.merge(&Usage {
            prompt_tokens: 4,
            completion_tokens: 9,
            ..Default::default()
        });
        assert_eq!(a.prompt_tokens, 10);
        assert_eq!(a.completion_tokens, 9);
    }

    #[test]
    fn estimate_counts_text_and_tool_results() {
        let mut req = UnifiedRequest::new("m");
        req.messages.push(Message::text(Role::User, "a".repeat(40)));
        let mut tool = Message::new(Role::Tool);
        tool.parts.push(ContentPart::ToolResult {
            call_id: "call_1".into(),
            text: "b".repeat(40),
            is_error: false,
        });
        req.messages.push(tool);
        assert_eq!(req.estimate_input_tokens(), 20);
    }

    #[test]
    fn joined_text_skips_non_text_parts() {
        let mut m = Message::text(Role::Assistant, "hi");
        m.parts.push(ContentPart::Reasoning {
            text: "secret".into(),
            signature: None,
        });
        m.parts.push(ContentPart::text(" there"));
        assert_eq!(m.joined_text(), "hi there");
    }
}
