//! Cline dialect — OpenAI Chat Completions with a bare `reasoning` field.
//!
//! Differences from stock OpenAI, per the Cline client's expectations:
//! inbound payloads may spell reasoning as `reasoning`; outbound chunks spell
//! it `reasoning_content`, and `role: "assistant"` appears on the first chunk
//! only (the shared OpenAI emitter already guarantees the latter).

use serde_json::Value;

use hydra_core::{GatewayError, Result};
use hydra_protocol::{Message, UnifiedEvent, UnifiedRequest, Usage};

use crate::context::StreamContext;
use crate::formats::openai;
use crate::registry::{Format, FormatEmitter, FormatParser};
use crate::sse;

pub struct ClineFormat;

impl FormatParser for ClineFormat {
    fn format(&self) -> Format {
        Format::Cline
    }

    fn parse_request(&self, raw: &[u8]) -> Result<UnifiedRequest> {
        let root: Value = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::Parse(format!("bad request JSON: {e}")))?;
        openai::parse_request_value(&root, Format::Cline)
    }

    fn parse_response(&self, raw: &[u8]) -> Result<(Vec<Message>, Usage)> {
        let root: Value = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::Parse(format!("bad response JSON: {e}")))?;
        openai::parse_response_value(&root)
    }

    fn parse_chunk(&self, data: &str, ctx: &mut StreamContext) -> Result<Vec<UnifiedEvent>> {
        // Accept both spellings; some Cline-compatible upstreams use either.
        openai::parse_chunk_value(data, ctx, &["reasoning", "reasoning_content"])
    }

    fn finalize(&self, ctx: &mut StreamContext) -> Vec<UnifiedEvent> {
        match ctx.pending_finish.take() {
            Some(reason) if !ctx.finish_sent => vec![UnifiedEvent::Finish {
                reason,
                usage: (!ctx.usage.is_empty()).then_some(ctx.usage),
            }],
            _ => Vec::new(),
        }
    }
}

impl FormatEmitter for ClineFormat {
    fn format(&self) -> Format {
        Format::Cline
    }

    fn emit_request(&self, ir: &UnifiedRequest) -> Result<Value> {
        openai::emit_request_value(ir, "reasoning")
    }

    fn emit_response(&self, messages: &[Message], usage: &Usage, model: &str) -> Result<Value> {
        openai::emit_response_value(messages, usage, model, "reasoning_content")
    }

    fn emit_chunk(&self, event: &UnifiedEvent, ctx: &mut StreamContext) -> Result<Vec<String>> {
        openai::emit_chunk_value(event, ctx, "reasoning_content")
    }

    fn flush(&self, _ctx: &mut StreamContext) -> Result<Vec<String>> {
        Ok(vec![sse::done_frame()])
    }
}
