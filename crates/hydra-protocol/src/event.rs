//! Stream events in the neutral model.
//!
//! Upstream chunk parsers turn wire chunks into `UnifiedEvent`s; emitters turn
//! them back into the client's dialect. Events are ordered; `Finish` is
//! terminal and appears at most once per stream.

use serde::{Deserialize, Serialize};

use crate::ir::{ToolCall, Usage};

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
    Unknown,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Error => "error",
            FinishReason::Unknown => "unknown",
        }
    }
}

/// One translated stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnifiedEvent {
    /// Synthetic head event: emitted once before any content.
    StreamMeta {
        message_id: String,
        model: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        estimated_input_tokens: Option<u64>,
    },
    /// Visible text delta.
    Token { text: String },
    /// Reasoning/thinking delta, with the provider signature when one arrived.
    Reasoning {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    /// Reasoning summary delta (OpenAI Responses surface).
    ReasoningSummary { text: String },
    /// A complete tool call (id + name + full arguments).
    ToolCall { call: ToolCall },
    /// Partial tool call: `id`/`name` arrive on the first delta only.
    ToolCallDelta {
        index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        arguments_delta: String,
    },
    /// Inline image produced by the model.
    Image { mime: String, data: String },
    /// Code-execution block (Gemini executable code surface).
    CodeExecution {
        language: String,
        code: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    /// Upstream error surfaced mid-stream.
    Error { message: String },
    /// Terminal event. At most one per stream.
    Finish {
        reason: FinishReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
}

impl UnifiedEvent {
    pub fn is_finish(&self) -> bool {
        matches!(self, UnifiedEvent::Finish { .. })
    }

    /// True for events that render as client-visible content (used by the
    /// delay-one buffer to decide what can carry merged finish metadata).
    pub fn is_content(&self) -> bool {
        matches!(
            self,
            UnifiedEvent::Token { .. }
                | UnifiedEvent::Reasoning { .. }
                | UnifiedEvent::ReasoningSummary { .. }
                | UnifiedEvent::ToolCall { .. }
                | UnifiedEvent::ToolCallDelta { .. }
                | UnifiedEvent::Image { .. }
                | UnifiedEvent::CodeExecution { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_is_terminal_marker() {
        let ev = UnifiedEvent::Finish {
            reason: FinishReason::Stop,
            usage: None,
        };
        assert!(ev.is_finish());
        assert!(!ev.is_content());
    }

    #[test]
    fn meta_is_not_content() {
        let ev = UnifiedEvent::StreamMeta {
            message_id: "msg_1".into(),
            model: "m".into(),
            estimated_input_tokens: Some(12),
        };
        assert!(!ev.is_content());
    }
}
