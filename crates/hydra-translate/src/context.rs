//! Per-request stream translation state.
//!
//! One `StreamContext` lives for the duration of a single translated stream.
//! It carries the cross-format bookkeeping (finish dedup, tool-call counter,
//! reasoning length) plus each format's private parse/emit state. Formats
//! only touch their own slot.

use hydra_protocol::{FinishReason, Usage};

use crate::formats::claude::{ClaudeEmitState, ClaudeParseState};
use crate::formats::gemini::{GeminiEmitState, GeminiParseState};
use crate::formats::ollama::OllamaEmitState;
use crate::formats::openai::{OpenAiEmitState, OpenAiParseState};
use crate::formats::responses::{ResponsesEmitState, ResponsesParseState};
use crate::schema::ToolMaps;

#[derive(Debug, Default)]
pub struct StreamContext {
    /// Model name reported to the client.
    pub model: String,
    /// Message id for synthetic head chunks (`chatcmpl-…`/`msg_…` bodies are
    /// derived from this by each emitter).
    pub message_id: String,
    /// Request-time estimate, reported in `stream-meta` until real usage lands.
    pub estimated_input_tokens: Option<u64>,
    /// Tool schemas + id→name pairing from the original request.
    pub tool_maps: ToolMaps,

    // ── cross-format accounting ──────────────────────────────────────────
    /// Monotone counter assigning indices to streamed tool calls.
    pub tool_call_index: usize,
    /// Set once any tool call (complete or delta) passes through.
    pub has_tool_calls: bool,
    /// Set once a finish event has been emitted; later finishes are dropped.
    pub finish_sent: bool,
    /// Accumulated reasoning characters, for the thoughts-token fallback.
    pub reasoning_chars: usize,
    /// Best usage seen so far (merged across chunks).
    pub usage: Usage,
    /// Finish reason captured before the terminal signal arrives.
    pub pending_finish: Option<FinishReason>,

    // ── per-format private state ─────────────────────────────────────────
    pub claude_parse: ClaudeParseState,
    pub claude_emit: ClaudeEmitState,
    pub gemini_parse: GeminiParseState,
    pub gemini_emit: GeminiEmitState,
    pub openai_parse: OpenAiParseState,
    pub openai_emit: OpenAiEmitState,
    pub responses_parse: ResponsesParseState,
    pub responses_emit: ResponsesEmitState,
    pub ollama_emit: OllamaEmitState,
}

impl StreamContext {
    pub fn new(model: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            message_id: message_id.into(),
            ..Default::default()
        }
    }

    /// Next tool-call slot.
    pub fn next_tool_index(&mut self) -> usize {
        let idx = self.tool_call_index;
        self.tool_call_index += 1;
        idx
    }
}
