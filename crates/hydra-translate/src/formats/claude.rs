//! Claude Messages dialect.
//!
//! Streaming Claude is block-oriented: content arrives inside indexed
//! `content_block_start`/`content_block_delta`/`content_block_stop` envelopes.
//! The parser tracks which kind each index carries; the emitter runs the same
//! machine in reverse, opening and closing blocks as the event kind changes.

use std::collections::HashMap;

use serde_json::{json, Value};

use hydra_core::{GatewayError, Result};
use hydra_protocol::{
    normalize_tool_id, to_wire_tool_id, ContentPart, FinishReason, ImageSource, Message, Role,
    Sampling, ThinkingConfig, ToolCall, ToolChoice, ToolIdStyle, ToolSpec, UnifiedEvent,
    UnifiedRequest, Usage,
};

use crate::context::StreamContext;
use crate::registry::{Format, FormatEmitter, FormatParser};
use crate::schema::schema_for_claude;
use crate::sse;

pub struct ClaudeFormat;

/// Kind of an upstream content block, keyed by its wire index.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaudeBlock {
    Text,
    Thinking,
    /// Carries the unified tool-call index assigned at block start.
    ToolUse(usize),
}

#[derive(Debug, Default)]
pub struct ClaudeParseState {
    pub blocks: HashMap<u64, ClaudeBlock>,
}

/// Block the emitter currently has open on the client side.
#[derive(Debug, Clone, PartialEq)]
pub enum EmitBlock {
    Text,
    Thinking,
    ToolUse(usize),
}

#[derive(Debug, Default)]
pub struct ClaudeEmitState {
    pub message_start_sent: bool,
    pub next_block_index: u64,
    pub open_block: Option<EmitBlock>,
}

fn finish_from_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" | "pause_turn" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        _ => FinishReason::Unknown,
    }
}

fn stop_reason_from_finish(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Stop | FinishReason::Unknown => "end_turn",
        FinishReason::Length => "max_tokens",
        FinishReason::ToolCalls => "tool_use",
        FinishReason::ContentFilter => "refusal",
        FinishReason::Error => "end_turn",
    }
}

fn parse_claude_usage(usage: Option<&Value>) -> Usage {
    let Some(u) = usage else {
        return Usage::default();
    };
    Usage {
        prompt_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
        completion_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
        total_tokens: 0,
        thoughts_tokens: 0,
        cached_tokens: u
            .get("cache_read_input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    }
    .with_total()
}

fn emit_claude_usage(usage: &Usage) -> Value {
    json!({
        "input_tokens": usage.prompt_tokens,
        "output_tokens": usage.completion_tokens,
        "cache_read_input_tokens": usage.cached_tokens,
        "cache_creation_input_tokens": 0,
    })
}

// ── request parsing ──────────────────────────────────────────────────────────

fn parse_request_value(root: &Value) -> Result<UnifiedRequest> {
    let obj = root
        .as_object()
        .ok_or_else(|| GatewayError::Parse("request body is not a JSON object".into()))?;

    let model = obj
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::Parse("missing model".into()))?;
    let mut req = UnifiedRequest::new(model);

    // System prompt: plain string or text blocks.
    match obj.get("system") {
        Some(Value::String(text)) => req.messages.push(Message::text(Role::System, text)),
        Some(Value::Array(blocks)) => {
            let mut sys = Message::new(Role::System);
            for block in blocks {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    sys.parts.push(ContentPart::text(text));
                }
                if block.get("cache_control").is_some() {
                    sys.cache_control = Some("ephemeral".into());
                }
            }
            req.messages.push(sys);
        }
        _ => {}
    }

    for raw in obj
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::Parse("missing messages".into()))?
    {
        parse_message(raw, &mut req.messages)?;
    }

    if let Some(tools) = obj.get("tools").and_then(Value::as_array) {
        for tool in tools {
            req.tools.push(ToolSpec {
                name: tool
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                description: tool
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                parameters: tool.get("input_schema").cloned().unwrap_or(json!({})),
            });
        }
    }

    if let Some(choice) = obj.get("tool_choice") {
        req.tool_choice = Some(match choice.get("type").and_then(Value::as_str) {
            Some("any") => ToolChoice::Any,
            Some("tool") => ToolChoice::Tool(
                choice
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            ),
            Some("none") => ToolChoice::None,
            _ => ToolChoice::Auto,
        });
    }

    if let Some(thinking) = obj.get("thinking") {
        let enabled = thinking.get("type").and_then(Value::as_str) == Some("enabled");
        if enabled {
            req.thinking = Some(ThinkingConfig {
                include_thoughts: true,
                budget_tokens: thinking
                    .get("budget_tokens")
                    .and_then(Value::as_u64)
                    .map(|v| v as u32),
                effort: None,
                summary: None,
            });
        }
    }

    req.sampling = Sampling {
        temperature: obj.get("temperature").and_then(Value::as_f64),
        top_p: obj.get("top_p").and_then(Value::as_f64),
        top_k: obj.get("top_k").and_then(Value::as_u64).map(|v| v as u32),
        max_tokens: obj
            .get("max_tokens")
            .and_then(Value::as_u64)
            .map(|v| v as u32),
        stop: obj
            .get("stop_sequences")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        ..Default::default()
    };
    req.stream = obj.get("stream").and_then(Value::as_bool).unwrap_or(false);

    const KNOWN: &[&str] = &[
        "model",
        "messages",
        "system",
        "tools",
        "tool_choice",
        "thinking",
        "temperature",
        "top_p",
        "top_k",
        "max_tokens",
        "stop_sequences",
        "stream",
    ];
    for (key, value) in obj {
        if !KNOWN.contains(&key.as_str()) {
            req.metadata.insert(format!("claude.{key}"), value.clone());
        }
    }
    Ok(req)
}

/// Claude packs tool results into user messages; the IR keeps them on a
/// separate `tool` role message so every format can address them uniformly.
fn parse_message(raw: &Value, out: &mut Vec<Message>) -> Result<()> {
    let role = match raw.get("role").and_then(Value::as_str) {
        Some("user") => Role::User,
        Some("assistant") => Role::Assistant,
        other => {
            return Err(GatewayError::Parse(format!(
                "unknown message role: {other:?}"
            )))
        }
    };

    let mut msg = Message::new(role);
    let mut tool_msg = Message::new(Role::Tool);

    match raw.get("content") {
        Some(Value::String(text)) => msg.parts.push(ContentPart::text(text)),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                if block.get("cache_control").is_some() {
                    msg.cache_control = Some("ephemeral".into());
                }
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            msg.parts.push(ContentPart::text(text));
                        }
                    }
                    Some("thinking") => {
                        msg.parts.push(ContentPart::Reasoning {
                            text: block
                                .get("thinking")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            signature: block
                                .get("signature")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                        });
                    }
                    Some("redacted_thinking") => {
                        msg.parts.push(ContentPart::RedactedThinking {
                            data: block
                                .get("data")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                        });
                    }
                    Some("image") => {
                        let source = block.get("source").cloned().unwrap_or_default();
                        let mime = source
                            .get("media_type")
                            .and_then(Value::as_str)
                            .unwrap_or("image/png")
                            .to_string();
                        let src = match source.get("type").and_then(Value::as_str) {
                            Some("url") => ImageSource::Url(
                                source
                                    .get("url")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string(),
                            ),
                            _ => ImageSource::Base64(
                                source
                                    .get("data")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string(),
                            ),
                        };
                        msg.parts.push(ContentPart::Image { mime, source: src });
                    }
                    Some("tool_use") => {
                        msg.tool_calls.push(ToolCall {
                            id: normalize_tool_id(
                                block.get("id").and_then(Value::as_str).unwrap_or_default(),
                            ),
                            name: block
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            arguments: block
                                .get("input")
                                .map(|v| v.to_string())
                                .unwrap_or_else(|| "{}".into()),
                            thought_signature: None,
                        });
                    }
                    Some("tool_result") => {
                        tool_msg.parts.push(ContentPart::ToolResult {
                            call_id: normalize_tool_id(
                                block
                                    .get("tool_use_id")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default(),
                            ),
                            text: tool_result_text(block.get("content")),
                            is_error: block
                                .get("is_error")
                                .and_then(Value::as_bool)
                                .unwrap_or(false),
                        });
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    if !tool_msg.parts.is_empty() {
        out.push(tool_msg);
    }
    if !msg.parts.is_empty() || !msg.tool_calls.is_empty() {
        out.push(msg);
    }
    Ok(())
}

fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

// ── request emission ─────────────────────────────────────────────────────────

fn emit_request_value(ir: &UnifiedRequest) -> Result<Value> {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for msg in &ir.messages {
        match msg.role {
            Role::System => {
                for part in &msg.parts {
                    if let ContentPart::Text { text } = part {
                        system_parts.push(text);
                    }
                }
            }
            _ => {
                let (wire_role, content) = emit_message_content(msg);
                if content.is_empty() {
                    continue;
                }
                // Claude requires strict user/assistant alternation; merge
                // into the previous message when roles repeat.
                match messages.last_mut() {
                    Some(prev) if prev["role"] == wire_role => {
                        if let Some(arr) = prev["content"].as_array_mut() {
                            arr.extend(content);
                        }
                    }
                    _ => messages.push(json!({"role": wire_role, "content": content})),
                }
            }
        }
    }

    let max_tokens = ir.sampling.max_tokens.unwrap_or(4096);
    let mut body = json!({
        "model": ir.model,
        "max_tokens": max_tokens,
        "messages": messages,
    });
    let obj = body.as_object_mut().expect("body is an object");

    if !system_parts.is_empty() {
        obj.insert("system".into(), json!(system_parts.join("\n\n")));
    }
    if !ir.tools.is_empty() {
        let tools: Vec<Value> = ir
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": schema_for_claude(&t.parameters),
                })
            })
            .collect();
        obj.insert("tools".into(), json!(tools));
    }
    if let Some(choice) = &ir.tool_choice {
        let wire = match choice {
            ToolChoice::Auto => json!({"type": "auto"}),
            ToolChoice::Any => json!({"type": "any"}),
            ToolChoice::Tool(name) => json!({"type": "tool", "name": name}),
            ToolChoice::None => json!({"type": "none"}),
        };
        obj.insert("tool_choice".into(), wire);
    }
    if let Some(thinking) = &ir.thinking {
        if thinking.include_thoughts {
            obj.insert(
                "thinking".into(),
                json!({
                    "type": "enabled",
                    "budget_tokens": thinking.budget_tokens.unwrap_or(1024),
                }),
            );
        }
    }

    let s = &ir.sampling;
    if let Some(t) = s.temperature {
        obj.insert("temperature".into(), json!(t));
    }
    if let Some(p) = s.top_p {
        obj.insert("top_p".into(), json!(p));
    }
    if let Some(k) = s.top_k {
        obj.insert("top_k".into(), json!(k));
    }
    if !s.stop.is_empty() {
        obj.insert("stop_sequences".into(), json!(s.stop));
    }
    if ir.stream {
        obj.insert("stream".into(), json!(true));
    }
    Ok(body)
}

/// Wire role plus content blocks for one IR message.
fn emit_message_content(msg: &Message) -> (&'static str, Vec<Value>) {
    if msg.role == Role::Tool {
        let blocks = msg
            .parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolResult {
                    call_id,
                    text,
                    is_error,
                } => {
                    let mut block = json!({
                        "type": "tool_result",
                        "tool_use_id": to_wire_tool_id(call_id, ToolIdStyle::Claude),
                        "content": text,
                    });
                    if *is_error {
                        block["is_error"] = json!(true);
                    }
                    Some(block)
                }
                _ => None,
            })
            .collect();
        return ("user", blocks);
    }

    let mut blocks = Vec::new();
    let mut has_thinking = false;
    for part in &msg.parts {
        match part {
            ContentPart::Text { text } => blocks.push(json!({"type": "text", "text": text})),
            ContentPart::Reasoning { text, signature } => {
                has_thinking = true;
                let mut block = json!({"type": "thinking", "thinking": text});
                if let Some(sig) = signature {
                    block["signature"] = json!(sig);
                }
                blocks.push(block);
            }
            ContentPart::RedactedThinking { data } => {
                has_thinking = true;
                blocks.push(json!({"type": "redacted_thinking", "data": data}));
            }
            ContentPart::Image { mime, source } => {
                let src = match source {
                    ImageSource::Base64(data) => {
                        json!({"type": "base64", "media_type": mime, "data": data})
                    }
                    ImageSource::Url(url) => json!({"type": "url", "url": url}),
                };
                blocks.push(json!({"type": "image", "source": src}));
            }
            _ => {}
        }
    }
    for call in &msg.tool_calls {
        let input: Value = serde_json::from_str(&call.arguments).unwrap_or(json!({}));
        blocks.push(json!({
            "type": "tool_use",
            "id": to_wire_tool_id(&call.id, ToolIdStyle::Claude),
            "name": call.name,
            "input": input,
        }));
    }

    // Cache breakpoints go on the last block, but never on thinking blocks:
    // the upstream rejects cache_control there.
    if msg.cache_control.is_some() && !has_thinking {
        if let Some(last) = blocks.last_mut() {
            last["cache_control"] = json!({"type": "ephemeral"});
        }
    }

    let role = if msg.role == Role::Assistant {
        "assistant"
    } else {
        "user"
    };
    (role, blocks)
}

// ── response parsing / emission ──────────────────────────────────────────────

fn parse_response_value(root: &Value) -> Result<(Vec<Message>, Usage)> {
    let content = root
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::Parse("response has no content".into()))?;

    let mut msg = Message::new(Role::Assistant);
    for block in content {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                msg.parts.push(ContentPart::text(
                    block.get("text").and_then(Value::as_str).unwrap_or_default(),
                ));
            }
            Some("thinking") => msg.parts.push(ContentPart::Reasoning {
                text: block
                    .get("thinking")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                signature: block
                    .get("signature")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            Some("redacted_thinking") => msg.parts.push(ContentPart::RedactedThinking {
                data: block
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            Some("tool_use") => msg.tool_calls.push(ToolCall {
                id: normalize_tool_id(block.get("id").and_then(Value::as_str).unwrap_or_default()),
                name: block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                arguments: block
                    .get("input")
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "{}".into()),
                thought_signature: None,
            }),
            _ => {}
        }
    }
    Ok((vec![msg], parse_claude_usage(root.get("usage"))))
}

fn emit_response_value(messages: &[Message], usage: &Usage, model: &str) -> Result<Value> {
    let assistant = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .ok_or_else(|| GatewayError::Parse("no assistant message to emit".into()))?;

    let (_, content) = emit_message_content(assistant);
    let stop_reason = if assistant.tool_calls.is_empty() {
        "end_turn"
    } else {
        "tool_use"
    };

    Ok(json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": emit_claude_usage(usage),
    }))
}

// ── chunk parsing ────────────────────────────────────────────────────────────

fn parse_chunk_value(data: &str, ctx: &mut StreamContext) -> Result<Vec<UnifiedEvent>> {
    let root: Value = serde_json::from_str(data)
        .map_err(|e| GatewayError::Parse(format!("bad stream chunk: {e}")))?;
    let kind = root.get("type").and_then(Value::as_str).unwrap_or_default();
    let mut events = Vec::new();

    match kind {
        "message_start" => {
            let msg = root.get("message").cloned().unwrap_or_default();
            let usage = parse_claude_usage(msg.get("usage"));
            ctx.usage.merge(&usage);
            events.push(UnifiedEvent::StreamMeta {
                message_id: msg
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or(&ctx.message_id)
                    .to_string(),
                model: msg
                    .get("model")
                    .and_then(Value::as_str)
                    .unwrap_or(&ctx.model)
                    .to_string(),
                estimated_input_tokens: (usage.prompt_tokens > 0)
                    .then_some(usage.prompt_tokens)
                    .or(ctx.estimated_input_tokens),
            });
        }
        "content_block_start" => {
            let index = root.get("index").and_then(Value::as_u64).unwrap_or(0);
            let block = root.get("content_block").cloned().unwrap_or_default();
            match block.get("type").and_then(Value::as_str) {
                Some("tool_use") => {
                    let unified = ctx.next_tool_index();
                    ctx.claude_parse
                        .blocks
                        .insert(index, ClaudeBlock::ToolUse(unified));
                    events.push(UnifiedEvent::ToolCallDelta {
                        index: unified,
                        id: Some(normalize_tool_id(
                            block.get("id").and_then(Value::as_str).unwrap_or_default(),
                        )),
                        name: Some(
                            block
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                        ),
                        arguments_delta: String::new(),
                    });
                }
                Some("thinking") => {
                    ctx.claude_parse.blocks.insert(index, ClaudeBlock::Thinking);
                }
                _ => {
                    ctx.claude_parse.blocks.insert(index, ClaudeBlock::Text);
                }
            }
        }
        "content_block_delta" => {
            let index = root.get("index").and_then(Value::as_u64).unwrap_or(0);
            let delta = root.get("delta").cloned().unwrap_or_default();
            match delta.get("type").and_then(Value::as_str) {
                Some("text_delta") => {
                    if let Some(text) = delta.get("text").and_then(Value::as_str) {
                        events.push(UnifiedEvent::Token {
                            text: text.to_string(),
                        });
                    }
                }
                Some("thinking_delta") => {
                    if let Some(text) = delta.get("thinking").and_then(Value::as_str) {
                        events.push(UnifiedEvent::Reasoning {
                            text: text.to_string(),
                            signature: None,
                        });
                    }
                }
                Some("signature_delta") => {
                    if let Some(sig) = delta.get("signature").and_then(Value::as_str) {
                        events.push(UnifiedEvent::Reasoning {
                            text: String::new(),
                            signature: Some(sig.to_string()),
                        });
                    }
                }
                Some("input_json_delta") => {
                    if let Some(ClaudeBlock::ToolUse(unified)) =
                        ctx.claude_parse.blocks.get(&index)
                    {
                        let partial = delta
                            .get("partial_json")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        events.push(UnifiedEvent::ToolCallDelta {
                            index: *unified,
                            id: None,
                            name: None,
                            arguments_delta: partial.to_string(),
                        });
                    }
                }
                _ => {}
            }
        }
        "content_block_stop" => {
            let index = root.get("index").and_then(Value::as_u64).unwrap_or(0);
            ctx.claude_parse.blocks.remove(&index);
        }
        "message_delta" => {
            ctx.usage.merge(&parse_claude_usage(root.get("usage")));
            if let Some(reason) = root.pointer("/delta/stop_reason").and_then(Value::as_str) {
                ctx.pending_finish = Some(finish_from_stop_reason(reason));
            }
        }
        "message_stop" => {
            events.push(UnifiedEvent::Finish {
                reason: ctx.pending_finish.take().unwrap_or(FinishReason::Stop),
                usage: (!ctx.usage.is_empty()).then_some(ctx.usage),
            });
        }
        "error" => {
            let message = root
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("upstream error")
                .to_string();
            events.push(UnifiedEvent::Error { message });
        }
        // ping and future event types carry nothing we translate
        _ => {}
    }
    Ok(events)
}

// ── chunk emission ───────────────────────────────────────────────────────────

fn frame(event_type: &str, payload: Value) -> String {
    sse::event_frame(event_type, &payload.to_string())
}

fn ensure_message_start(ctx: &mut StreamContext, frames: &mut Vec<String>) {
    if ctx.claude_emit.message_start_sent {
        return;
    }
    ctx.claude_emit.message_start_sent = true;
    frames.push(frame(
        "message_start",
        json!({
            "type": "message_start",
            "message": {
                "id": format!("msg_{}", ctx.message_id),
                "type": "message",
                "role": "assistant",
                "model": ctx.model,
                "content": [],
                "stop_reason": null,
                "stop_sequence": null,
                "usage": {
                    "input_tokens": ctx.estimated_input_tokens.unwrap_or(0),
                    "output_tokens": 0,
                },
            },
        }),
    ));
}

fn close_open_block(ctx: &mut StreamContext, frames: &mut Vec<String>) {
    if ctx.claude_emit.open_block.take().is_some() {
        let index = ctx.claude_emit.next_block_index - 1;
        frames.push(frame(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": index}),
        ));
    }
}

/// Open a block of `kind` unless one of the same kind is already open.
/// Returns the wire index of the current block.
fn ensure_block(
    ctx: &mut StreamContext,
    kind: EmitBlock,
    start_block: Value,
    frames: &mut Vec<String>,
) -> u64 {
    if ctx.claude_emit.open_block.as_ref() == Some(&kind) {
        return ctx.claude_emit.next_block_index - 1;
    }
    close_open_block(ctx, frames);
    let index = ctx.claude_emit.next_block_index;
    ctx.claude_emit.next_block_index += 1;
    ctx.claude_emit.open_block = Some(kind);
    frames.push(frame(
        "content_block_start",
        json!({
            "type": "content_block_start",
            "index": index,
            "content_block": start_block,
        }),
    ));
    index
}

fn emit_chunk_value(event: &UnifiedEvent, ctx: &mut StreamContext) -> Result<Vec<String>> {
    let mut frames = Vec::new();

    match event {
        UnifiedEvent::StreamMeta { .. } => {
            ensure_message_start(ctx, &mut frames);
        }
        UnifiedEvent::Token { text } => {
            ensure_message_start(ctx, &mut frames);
            let index = ensure_block(
                ctx,
                EmitBlock::Text,
                json!({"type": "text", "text": ""}),
                &mut frames,
            );
            frames.push(frame(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {"type": "text_delta", "text": text},
                }),
            ));
        }
        UnifiedEvent::Reasoning { text, signature } => {
            ensure_message_start(ctx, &mut frames);
            let index = ensure_block(
                ctx,
                EmitBlock::Thinking,
                json!({"type": "thinking", "thinking": ""}),
                &mut frames,
            );
            if !text.is_empty() {
                frames.push(frame(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "thinking_delta", "thinking": text},
                    }),
                ));
            }
            if let Some(sig) = signature {
                frames.push(frame(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "signature_delta", "signature": sig},
                    }),
                ));
            }
        }
        UnifiedEvent::ReasoningSummary { text } => {
            ensure_message_start(ctx, &mut frames);
            let index = ensure_block(
                ctx,
                EmitBlock::Thinking,
                json!({"type": "thinking", "thinking": ""}),
                &mut frames,
            );
            frames.push(frame(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {"type": "thinking_delta", "thinking": text},
                }),
            ));
        }
        UnifiedEvent::ToolCall { call } => {
            ensure_message_start(ctx, &mut frames);
            close_open_block(ctx, &mut frames);
            let index = ctx.claude_emit.next_block_index;
            ctx.claude_emit.next_block_index += 1;
            frames.push(frame(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": {
                        "type": "tool_use",
                        "id": to_wire_tool_id(&call.id, ToolIdStyle::Claude),
                        "name": call.name,
                        "input": {},
                    },
                }),
            ));
            if !call.arguments.is_empty() {
                frames.push(frame(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "input_json_delta", "partial_json": call.arguments},
                    }),
                ));
            }
            frames.push(frame(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": index}),
            ));
        }
        UnifiedEvent::ToolCallDelta {
            index: unified,
            id,
            name,
            arguments_delta,
        } => {
            ensure_message_start(ctx, &mut frames);
            let kind = EmitBlock::ToolUse(*unified);
            let start = json!({
                "type": "tool_use",
                "id": id
                    .as_deref()
                    .map(|i| to_wire_tool_id(i, ToolIdStyle::Claude))
                    .unwrap_or_else(|| format!("toolu_{unified}")),
                "name": name.clone().unwrap_or_default(),
                "input": {},
            });
            let index = ensure_block(ctx, kind, start, &mut frames);
            if !arguments_delta.is_empty() {
                frames.push(frame(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "input_json_delta", "partial_json": arguments_delta},
                    }),
                ));
            }
        }
        UnifiedEvent::Image { .. } | UnifiedEvent::CodeExecution { .. } => {}
        UnifiedEvent::Error { message } => {
            frames.push(frame(
                "error",
                json!({"type": "error", "error": {"type": "api_error", "message": message}}),
            ));
        }
        UnifiedEvent::Finish { reason, usage } => {
            ensure_message_start(ctx, &mut frames);
            close_open_block(ctx, &mut frames);
            let usage = usage.unwrap_or(ctx.usage);
            frames.push(frame(
                "message_delta",
                json!({
                    "type": "message_delta",
                    "delta": {
                        "stop_reason": stop_reason_from_finish(*reason),
                        "stop_sequence": null,
                    },
                    "usage": emit_claude_usage(&usage),
                }),
            ));
            frames.push(frame(
                "message_stop",
                json!({"type": "message_stop"}),
            ));
        }
    }
    Ok(frames)
}

// ── trait wiring ─────────────────────────────────────────────────────────────

impl FormatParser for ClaudeFormat {
    fn format(&self) -> Format {
        Format::Claude
    }

    fn parse_request(&self, raw: &[u8]) -> Result<UnifiedRequest> {
        let root: Value = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::Parse(format!("bad request JSON: {e}")))?;
        parse_request_value(&root)
    }

    fn parse_response(&self, raw: &[u8]) -> Result<(Vec<Message>, Usage)> {
        let root: Value = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::Parse(format!("bad response JSON: {e}")))?;
        parse_response_value(&root)
    }

    fn parse_chunk(&self, data: &str, ctx: &mut StreamContext) -> Result<Vec<UnifiedEvent>> {
        parse_chunk_value(data, ctx)
    }

    fn finalize(&self, ctx: &mut StreamContext) -> Vec<UnifiedEvent> {
        // Upstream went away without message_stop; surface what we learned.
        match ctx.pending_finish.take() {
            Some(reason) if !ctx.finish_sent => vec![UnifiedEvent::Finish {
                reason,
                usage: (!ctx.usage.is_empty()).then_some(ctx.usage),
            }],
            _ => Vec::new(),
        }
    }
}

impl FormatEmitter for ClaudeFormat {
    fn format(&self) -> Format {
        Format::Claude
    }

    fn emit_request(&self, ir: &UnifiedRequest) -> Result<Value> {
        emit_request_value(ir)
    }

    fn emit_response(&self, messages: &[Message], usage: &Usage, model: &str) -> Result<Value> {
        emit_response_value(messages, usage, model)
    }

    fn emit_chunk(&self, event: &UnifiedEvent, ctx: &mut StreamContext) -> Result<Vec<String>> {
        emit_chunk_value(event, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_with_thinking_and_tools_parses() {
        let raw = json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 1000,
            "system": "be brief",
            "thinking": {"type": "enabled", "budget_tokens": 2048},
            "tools": [{"name": "search", "description": "d", "input_schema": {"type": "object"}}],
            "messages": [{"role": "user", "content": "hi"}],
        });
        let req = parse_request_value(&raw).unwrap();
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.thinking.as_ref().unwrap().budget_tokens, Some(2048));
        assert_eq!(req.tools[0].name, "search");
        assert_eq!(req.sampling.max_tokens, Some(1000));
    }

    #[test]
    fn tool_use_ids_are_normalized_and_restored() {
        let raw = json!({
            "model": "m",
            "max_tokens": 10,
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_abc", "name": "f", "input": {"a": 1}},
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_abc", "content": "ok"},
                ]},
            ],
        });
        let req = parse_request_value(&raw).unwrap();
        assert_eq!(req.messages[0].tool_calls[0].id, "call_abc");
        assert_eq!(
            req.messages[1].parts[0],
            ContentPart::ToolResult {
                call_id: "call_abc".into(),
                text: "ok".into(),
                is_error: false,
            }
        );

        let wire = emit_request_value(&req).unwrap();
        assert_eq!(wire["messages"][0]["content"][0]["id"], "toolu_abc");
        assert_eq!(
            wire["messages"][1]["content"][0]["tool_use_id"],
            "toolu_abc"
        );
    }

    #[test]
    fn thought_signature_survives_round_trip() {
        let raw = json!({
            "model": "m",
            "max_tokens": 10,
            "messages": [{"role": "assistant", "content": [
                {"type": "thinking", "thinking": "hmm", "signature": "sig-1"},
                {"type": "text", "text": "answer"},
            ]}],
        });
        let req = parse_request_value(&raw).unwrap();
        let wire = emit_request_value(&req).unwrap();
        assert_eq!(wire["messages"][0]["content"][0]["signature"], "sig-1");
        assert_eq!(wire["messages"][0]["content"][0]["thinking"], "hmm");
    }

    #[test]
    fn cache_control_not_attached_to_thinking_blocks() {
        let mut msg = Message::new(Role::Assistant);
        msg.parts.push(ContentPart::Reasoning {
            text: "t".into(),
            signature: None,
        });
        msg.cache_control = Some("ephemeral".into());
        let (_, blocks) = emit_message_content(&msg);
        assert!(blocks[0].get("cache_control").is_none());
    }

    #[test]
    fn stream_text_deltas_translate() {
        let fmt = ClaudeFormat;
        let mut ctx = StreamContext::new("m", "abc");
        let ev = fmt
            .parse_chunk(
                r#"{"type":"message_start","message":{"id":"msg_1","model":"m","usage":{"input_tokens":9}}}"#,
                &mut ctx,
            )
            .unwrap();
        assert!(matches!(ev[0], UnifiedEvent::StreamMeta { .. }));

        fmt.parse_chunk(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            &mut ctx,
        )
        .unwrap();
        let ev = fmt
            .parse_chunk(
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"he"}}"#,
                &mut ctx,
            )
            .unwrap();
        assert_eq!(ev, vec![UnifiedEvent::Token { text: "he".into() }]);

        fmt.parse_chunk(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}}"#,
            &mut ctx,
        )
        .unwrap();
        let ev = fmt
            .parse_chunk(r#"{"type":"message_stop"}"#, &mut ctx)
            .unwrap();
        match &ev[0] {
            UnifiedEvent::Finish { reason, usage } => {
                assert_eq!(*reason, FinishReason::Stop);
                assert_eq!(usage.unwrap().prompt_tokens, 9);
                assert_eq!(usage.unwrap().completion_tokens, 2);
            }
            other => panic!("expected finish, got {other:?}"),
        }
    }

    #[test]
    fn tool_use_stream_maps_to_deltas() {
        let fmt = ClaudeFormat;
        let mut ctx = StreamContext::new("m", "abc");
        let ev = fmt
            .parse_chunk(
                r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_7","name":"f"}}"#,
                &mut ctx,
            )
            .unwrap();
        assert_eq!(
            ev[0],
            UnifiedEvent::ToolCallDelta {
                index: 0,
                id: Some("call_7".into()),
                name: Some("f".into()),
                arguments_delta: String::new(),
            }
        );
        let ev = fmt
            .parse_chunk(
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"a\""}}"#,
                &mut ctx,
            )
            .unwrap();
        assert_eq!(
            ev[0],
            UnifiedEvent::ToolCallDelta {
                index: 0,
                id: None,
                name: None,
                arguments_delta: "{\"a\"".into(),
            }
        );
    }

    #[test]
    fn emitter_opens_and_closes_blocks() {
        let mut ctx = StreamContext::new("m", "abc");
        ctx.estimated_input_tokens = Some(5);
        let mut frames = Vec::new();
        frames.extend(
            emit_chunk_value(
                &UnifiedEvent::StreamMeta {
                    message_id: "x".into(),
                    model: "m".into(),
                    estimated_input_tokens: Some(5),
                },
                &mut ctx,
            )
            .unwrap(),
        );
        frames.extend(
            emit_chunk_value(&UnifiedEvent::Token { text: "hi".into() }, &mut ctx).unwrap(),
        );
        frames.extend(
            emit_chunk_value(
                &UnifiedEvent::Finish {
                    reason: FinishReason::Stop,
                    usage: None,
                },
                &mut ctx,
            )
            .unwrap(),
        );
        let joined = frames.join("");
        let order = [
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ];
        let mut pos = 0;
        for marker in order {
            let found = joined[pos..]
                .find(marker)
                .unwrap_or_else(|| panic!("missing {marker}"));
            pos += found;
        }
    }

    #[test]
    fn response_round_trip() {
        let raw = json!({
            "id": "msg_1",
            "type": "message",
            "content": [
                {"type": "thinking", "thinking": "…", "signature": "s"},
                {"type": "text", "text": "hello"},
                {"type": "tool_use", "id": "toolu_2", "name": "f", "input": {}},
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 4, "output_tokens": 6},
        });
        let (messages, usage) = parse_response_value(&raw).unwrap();
        assert_eq!(usage.prompt_tokens, 4);
        let wire = emit_response_value(&messages, &usage, "m").unwrap();
        assert_eq!(wire["stop_reason"], "tool_use");
        assert_eq!(wire["content"][0]["signature"], "s");
        assert_eq!(wire["content"][2]["id"], "toolu_2");
    }
}
