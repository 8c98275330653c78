//! OpenAI Chat Completions dialect.
//!
//! Also the backbone for the Cline dialect, which differs only in how
//! reasoning deltas are spelled; the shared request/response plumbing is
//! `pub(crate)` for that reason.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::{json, Map, Value};

use hydra_core::{GatewayError, Result};
use hydra_protocol::{
    normalize_tool_id, ContentPart, FinishReason, ImageSource, Message, Role, Sampling,
    ThinkingConfig, ThinkingEffort, ToolCall, ToolChoice, ToolSpec, UnifiedEvent, UnifiedRequest,
    Usage,
};

use crate::context::StreamContext;
use crate::registry::{Format, FormatEmitter, FormatParser};
use crate::sse;

pub struct OpenAiFormat;

/// Streamed tool calls: OpenAI identifies them by array index; later deltas
/// omit id and name, so the first sighting is remembered here.
#[derive(Debug, Default)]
pub struct OpenAiParseState {
    pub seen_tool_indices: HashMap<u64, usize>,
}

#[derive(Debug, Default)]
pub struct OpenAiEmitState {
    /// `role: "assistant"` goes out with the first delta only.
    pub role_sent: bool,
    /// Stable `created` for every chunk of the stream.
    pub created: Option<i64>,
    /// Index assigned to the next streamed tool call on the way out.
    pub next_tool_index: u64,
}

impl OpenAiEmitState {
    fn created_at(&mut self) -> i64 {
        *self.created.get_or_insert_with(|| Utc::now().timestamp())
    }
}

// ── request parsing ──────────────────────────────────────────────────────────

/// Fields every OpenAI-shaped request carries; `extra` preserves the rest.
pub(crate) fn parse_request_value(root: &Value, format: Format) -> Result<UnifiedRequest> {
    let obj = root
        .as_object()
        .ok_or_else(|| GatewayError::Parse("request body is not a JSON object".into()))?;

    let model = obj
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::Parse("missing model".into()))?;
    let mut req = UnifiedRequest::new(model);

    for raw in obj
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::Parse("missing messages".into()))?
    {
        req.messages.push(parse_message(raw)?);
    }

    if let Some(tools) = obj.get("tools").and_then(Value::as_array) {
        for tool in tools {
            let func = tool.get("function").unwrap_or(tool);
            req.tools.push(ToolSpec {
                name: func
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                description: func
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                parameters: func.get("parameters").cloned().unwrap_or(json!({})),
            });
        }
    }
    req.tool_choice = obj.get("tool_choice").map(parse_tool_choice);

    req.sampling = Sampling {
        temperature: obj.get("temperature").and_then(Value::as_f64),
        top_p: obj.get("top_p").and_then(Value::as_f64),
        top_k: None,
        max_tokens: obj
            .get("max_completion_tokens")
            .or_else(|| obj.get("max_tokens"))
            .and_then(Value::as_u64)
            .map(|v| v as u32),
        stop: parse_stop(obj.get("stop")),
        frequency_penalty: obj.get("frequency_penalty").and_then(Value::as_f64),
        presence_penalty: obj.get("presence_penalty").and_then(Value::as_f64),
        logprobs: obj.get("logprobs").and_then(Value::as_bool),
        top_logprobs: obj
            .get("top_logprobs")
            .and_then(Value::as_u64)
            .map(|v| v as u32),
        candidate_count: obj.get("n").and_then(Value::as_u64).map(|v| v as u32),
    };

    if let Some(effort) = obj.get("reasoning_effort").and_then(Value::as_str) {
        req.thinking = Some(ThinkingConfig {
            include_thoughts: true,
            budget_tokens: None,
            effort: parse_effort(effort),
            summary: None,
        });
    }

    if let Some(rf) = obj.get("response_format") {
        req.response_schema = Some(rf.clone());
    }
    req.stream = obj.get("stream").and_then(Value::as_bool).unwrap_or(false);

    const KNOWN: &[&str] = &[
        "model",
        "messages",
        "tools",
        "tool_choice",
        "temperature",
        "top_p",
        "max_tokens",
        "max_completion_tokens",
        "stop",
        "frequency_penalty",
        "presence_penalty",
        "logprobs",
        "top_logprobs",
        "n",
        "reasoning_effort",
        "response_format",
        "stream",
        "stream_options",
    ];
    for (key, value) in obj {
        if !KNOWN.contains(&key.as_str()) {
            req.metadata
                .insert(format!("{}.{}", format.name(), key), value.clone());
        }
    }
    Ok(req)
}

fn parse_message(raw: &Value) -> Result<Message> {
    let role = match raw.get("role").and_then(Value::as_str) {
        Some("user") => Role::User,
        Some("assistant") => Role::Assistant,
        Some("system") | Some("developer") => Role::System,
        Some("tool") => Role::Tool,
        other => {
            return Err(GatewayError::Parse(format!(
                "unknown message role: {other:?}"
            )))
        }
    };
    let mut msg = Message::new(role);

    if role == Role::Tool {
        let call_id = raw
            .get("tool_call_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        msg.parts.push(ContentPart::ToolResult {
            call_id: normalize_tool_id(call_id),
            text: content_as_text(raw.get("content")),
            is_error: false,
        });
        return Ok(msg);
    }

    match raw.get("content") {
        Some(Value::String(text)) => {
            if !text.is_empty() {
                msg.parts.push(ContentPart::text(text));
            }
        }
        Some(Value::Array(blocks)) => {
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            msg.parts.push(ContentPart::text(text));
                        }
                    }
                    Some("image_url") => {
                        let url = block
                            .pointer("/image_url/url")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        msg.parts.push(parse_image_url(url));
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    // Reasoning echoed back by the client on assistant turns.
    for key in ["reasoning_content", "reasoning"] {
        if let Some(text) = raw.get(key).and_then(Value::as_str) {
            msg.parts.insert(
                0,
                ContentPart::Reasoning {
                    text: text.to_string(),
                    signature: None,
                },
            );
            break;
        }
    }

    if let Some(calls) = raw.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let func = call.get("function").cloned().unwrap_or_default();
            msg.tool_calls.push(ToolCall {
                id: normalize_tool_id(call.get("id").and_then(Value::as_str).unwrap_or_default()),
                name: func
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                arguments: func
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or("{}")
                    .to_string(),
                thought_signature: None,
            });
        }
    }
    Ok(msg)
}

/// `data:<mime>;base64,<payload>` urls become inline images; anything else
/// stays a URL reference.
fn parse_image_url(url: &str) -> ContentPart {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((mime, payload)) = rest.split_once(";base64,") {
            return ContentPart::Image {
                mime: mime.to_string(),
                source: ImageSource::Base64(payload.to_string()),
            };
        }
    }
    ContentPart::Image {
        mime: "image/png".to_string(),
        source: ImageSource::Url(url.to_string()),
    }
}

fn content_as_text(content: Option<&Value>) -> String {
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

fn parse_stop(stop: Option<&Value>) -> Vec<String> {
    match stop {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_tool_choice(raw: &Value) -> ToolChoice {
    match raw {
        Value::String(s) => match s.as_str() {
            "required" => ToolChoice::Any,
            "none" => ToolChoice::None,
            _ => ToolChoice::Auto,
        },
        Value::Object(_) => raw
            .pointer("/function/name")
            .and_then(Value::as_str)
            .map(|n| ToolChoice::Tool(n.to_string()))
            .unwrap_or_default(),
        _ => ToolChoice::Auto,
    }
}

fn parse_effort(effort: &str) -> Option<ThinkingEffort> {
    match effort {
        "minimal" => Some(ThinkingEffort::Minimal),
        "low" => Some(ThinkingEffort::Low),
        "medium" => Some(ThinkingEffort::Medium),
        "high" => Some(ThinkingEffort::High),
        _ => None,
    }
}

pub(crate) fn finish_reason_from_wire(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Unknown,
    }
}

// ── request emission ─────────────────────────────────────────────────────────

pub(crate) fn emit_request_value(ir: &UnifiedRequest, reasoning_key: &str) -> Result<Value> {
    let mut messages = Vec::new();
    for msg in &ir.messages {
        emit_messages(msg, reasoning_key, &mut messages);
    }

    let mut body = json!({
        "model": ir.model,
        "messages": messages,
    });
    let obj = body.as_object_mut().expect("body is an object");

    if !ir.tools.is_empty() {
        let tools: Vec<Value> = ir
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        obj.insert("tools".into(), json!(tools));
    }
    if let Some(choice) = &ir.tool_choice {
        obj.insert("tool_choice".into(), emit_tool_choice(choice));
    }

    let s = &ir.sampling;
    maybe(obj, "temperature", s.temperature.map(Value::from));
    maybe(obj, "top_p", s.top_p.map(Value::from));
    maybe(obj, "max_tokens", s.max_tokens.map(Value::from));
    if !s.stop.is_empty() {
        obj.insert("stop".into(), json!(s.stop));
    }
    maybe(
        obj,
        "frequency_penalty",
        s.frequency_penalty.map(Value::from),
    );
    maybe(obj, "presence_penalty", s.presence_penalty.map(Value::from));
    maybe(obj, "logprobs", s.logprobs.map(Value::from));
    maybe(obj, "top_logprobs", s.top_logprobs.map(Value::from));
    maybe(obj, "n", s.candidate_count.map(Value::from));

    if let Some(thinking) = &ir.thinking {
        if let Some(effort) = thinking.effort {
            obj.insert("reasoning_effort".into(), json!(effort.as_str()));
        }
    }
    if ir.stream {
        obj.insert("stream".into(), json!(true));
        obj.insert("stream_options".into(), json!({"include_usage": true}));
    }
    Ok(body)
}

/// One IR message can expand to several wire messages (tool results split
/// into one `tool` role message per result).
fn emit_messages(msg: &Message, reasoning_key: &str, out: &mut Vec<Value>) {
    if msg.role == Role::Tool {
        for part in &msg.parts {
            if let ContentPart::ToolResult { call_id, text, .. } = part {
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": text,
                }));
            }
        }
        return;
    }

    let role = match msg.role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
        Role::Tool => unreachable!(),
    };

    let mut wire = Map::new();
    wire.insert("role".into(), json!(role));
    wire.insert("content".into(), emit_content(&msg.parts));

    let reasoning: String = msg
        .parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::Reasoning { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    if !reasoning.is_empty() {
        wire.insert(reasoning_key.into(), json!(reasoning));
    }

    if !msg.tool_calls.is_empty() {
        let calls: Vec<Value> = msg
            .tool_calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "type": "function",
                    "function": { "name": c.name, "arguments": c.arguments },
                })
            })
            .collect();
        wire.insert("tool_calls".into(), json!(calls));
        if msg.parts.iter().all(|p| p.char_len() == 0) {
            wire.insert("content".into(), Value::Null);
        }
    }
    out.push(Value::Object(wire));
}

/// Text-only content collapses to a string; mixed content becomes a block
/// array with data-url images.
fn emit_content(parts: &[ContentPart]) -> Value {
    let has_media = parts
        .iter()
        .any(|p| matches!(p, ContentPart::Image { .. } | ContentPart::File { .. }));
    if !has_media {
        return json!(parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(""));
    }

    let mut blocks = Vec::new();
    for part in parts {
        match part {
            ContentPart::Text { text } => blocks.push(json!({"type": "text", "text": text})),
            ContentPart::Image { mime, source } => {
                let url = match source {
                    ImageSource::Url(url) => url.clone(),
                    ImageSource::Base64(data) => format!("data:{mime};base64,{data}"),
                };
                blocks.push(json!({"type": "image_url", "image_url": {"url": url}}));
            }
            _ => {}
        }
    }
    json!(blocks)
}

fn emit_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::Any => json!("required"),
        ToolChoice::None => json!("none"),
        ToolChoice::Tool(name) => json!({"type": "function", "function": {"name": name}}),
    }
}

fn maybe(obj: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(v) = value {
        obj.insert(key.into(), v);
    }
}

// ── response parsing / emission ──────────────────────────────────────────────

pub(crate) fn parse_response_value(root: &Value) -> Result<(Vec<Message>, Usage)> {
    let choice = root
        .pointer("/choices/0")
        .ok_or_else(|| GatewayError::Parse("response has no choices".into()))?;
    let wire_msg = choice
        .get("message")
        .ok_or_else(|| GatewayError::Parse("choice has no message".into()))?;

    let mut msg = parse_message(wire_msg)?;
    msg.role = Role::Assistant;
    Ok((vec![msg], parse_usage(root.get("usage"))))
}

pub(crate) fn parse_usage(usage: Option<&Value>) -> Usage {
    let Some(u) = usage else {
        return Usage::default();
    };
    Usage {
        prompt_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
        completion_tokens: u
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        total_tokens: u.get("total_tokens").and_then(Value::as_u64).unwrap_or(0),
        thoughts_tokens: u
            .pointer("/completion_tokens_details/reasoning_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        cached_tokens: u
            .pointer("/prompt_tokens_details/cached_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    }
    .with_total()
}

pub(crate) fn emit_usage(usage: &Usage) -> Value {
    json!({
        "prompt_tokens": usage.prompt_tokens,
        "completion_tokens": usage.completion_tokens,
        "total_tokens": usage.with_total().total_tokens,
        "completion_tokens_details": { "reasoning_tokens": usage.thoughts_tokens },
        "prompt_tokens_details": { "cached_tokens": usage.cached_tokens },
    })
}

pub(crate) fn emit_response_value(
    messages: &[Message],
    usage: &Usage,
    model: &str,
    reasoning_key: &str,
) -> Result<Value> {
    let assistant = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .ok_or_else(|| GatewayError::Parse("no assistant message to emit".into()))?;

    let mut wire_msgs = Vec::new();
    emit_messages(assistant, reasoning_key, &mut wire_msgs);
    let message = wire_msgs
        .pop()
        .unwrap_or_else(|| json!({"role": "assistant", "content": ""}));

    let finish = if assistant.tool_calls.is_empty() {
        "stop"
    } else {
        "tool_calls"
    };

    Ok(json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish,
        }],
        "usage": emit_usage(usage),
    }))
}

// ── chunk parsing / emission ─────────────────────────────────────────────────

pub(crate) fn parse_chunk_value(
    data: &str,
    ctx: &mut StreamContext,
    reasoning_keys: &[&str],
) -> Result<Vec<UnifiedEvent>> {
    let root: Value = serde_json::from_str(data)
        .map_err(|e| GatewayError::Parse(format!("bad stream chunk: {e}")))?;
    let mut events = Vec::new();

    if let Some(u) = root.get("usage").filter(|u| !u.is_null()) {
        ctx.usage.merge(&parse_usage(Some(u)));
    }

    for choice in root
        .get("choices")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let delta = choice.get("delta").cloned().unwrap_or_default();

        for key in reasoning_keys {
            if let Some(text) = delta.get(*key).and_then(Value::as_str) {
                if !text.is_empty() {
                    events.push(UnifiedEvent::Reasoning {
                        text: text.to_string(),
                        signature: None,
                    });
                }
            }
        }

        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                events.push(UnifiedEvent::Token {
                    text: text.to_string(),
                });
            }
        }

        for call in delta
            .get("tool_calls")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let wire_index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
            let id = call.get("id").and_then(Value::as_str);
            let name = call.pointer("/function/name").and_then(Value::as_str);
            let args = call
                .pointer("/function/arguments")
                .and_then(Value::as_str)
                .unwrap_or("");

            let index = match ctx.openai_parse.seen_tool_indices.get(&wire_index) {
                Some(idx) => *idx,
                None => {
                    let idx = ctx.next_tool_index();
                    ctx.openai_parse.seen_tool_indices.insert(wire_index, idx);
                    idx
                }
            };
            events.push(UnifiedEvent::ToolCallDelta {
                index,
                id: id.map(normalize_tool_id),
                name: name.map(str::to_string),
                arguments_delta: args.to_string(),
            });
        }

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            if !reason.is_empty() {
                // Held until the [DONE]/EOF terminal so a trailing usage-only
                // chunk still makes it into the finish event.
                ctx.pending_finish = Some(finish_reason_from_wire(reason));
            }
        }
    }
    Ok(events)
}

fn chunk_envelope(ctx: &StreamContext, created: i64, delta: Value, finish: Option<&str>) -> Value {
    json!({
        "id": format!("chatcmpl-{}", ctx.message_id),
        "object": "chat.completion.chunk",
        "created": created,
        "model": ctx.model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish,
        }],
    })
}

pub(crate) fn emit_chunk_value(
    event: &UnifiedEvent,
    ctx: &mut StreamContext,
    reasoning_key: &str,
) -> Result<Vec<String>> {
    let created = ctx.openai_emit.created_at();

    let mut delta = Map::new();
    let mut finish: Option<String> = None;
    let mut usage: Option<Value> = None;

    match event {
        UnifiedEvent::StreamMeta { .. } => return Ok(Vec::new()),
        UnifiedEvent::Token { text } => {
            delta.insert("content".into(), json!(text));
        }
        UnifiedEvent::Reasoning { text, .. } | UnifiedEvent::ReasoningSummary { text } => {
            if text.is_empty() {
                return Ok(Vec::new());
            }
            delta.insert(reasoning_key.into(), json!(text));
        }
        UnifiedEvent::ToolCall { call } => {
            let index = ctx.openai_emit.next_tool_index;
            ctx.openai_emit.next_tool_index += 1;
            delta.insert(
                "tool_calls".into(),
                json!([{
                    "index": index,
                    "id": call.id,
                    "type": "function",
                    "function": { "name": call.name, "arguments": call.arguments },
                }]),
            );
        }
        UnifiedEvent::ToolCallDelta {
            index,
            id,
            name,
            arguments_delta,
        } => {
            let mut call = Map::new();
            call.insert("index".into(), json!(index));
            if let Some(id) = id {
                call.insert("id".into(), json!(id));
                call.insert("type".into(), json!("function"));
                ctx.openai_emit.next_tool_index = (*index as u64) + 1;
            }
            let mut func = Map::new();
            if let Some(name) = name {
                func.insert("name".into(), json!(name));
            }
            func.insert("arguments".into(), json!(arguments_delta));
            call.insert("function".into(), Value::Object(func));
            delta.insert("tool_calls".into(), json!([Value::Object(call)]));
        }
        UnifiedEvent::Image { .. } | UnifiedEvent::CodeExecution { .. } => {
            return Ok(Vec::new());
        }
        UnifiedEvent::Error { message } => {
            let frame = json!({"error": {"message": message, "type": "upstream_error"}});
            return Ok(vec![sse::data_frame(&frame.to_string())]);
        }
        UnifiedEvent::Finish {
            reason,
            usage: fin_usage,
        } => {
            finish = Some(reason.as_str().to_string());
            if let Some(u) = fin_usage {
                usage = Some(emit_usage(u));
            }
        }
    }

    if !ctx.openai_emit.role_sent {
        delta.insert("role".into(), json!("assistant"));
        ctx.openai_emit.role_sent = true;
    }

    let mut chunk = chunk_envelope(ctx, created, Value::Object(delta), finish.as_deref());
    if let Some(u) = usage {
        chunk["usage"] = u;
    }
    Ok(vec![sse::data_frame(&chunk.to_string())])
}

// ── trait wiring ─────────────────────────────────────────────────────────────

impl FormatParser for OpenAiFormat {
    fn format(&self) -> Format {
        Format::OpenAi
    }

    fn parse_request(&self, raw: &[u8]) -> Result<UnifiedRequest> {
        let root: Value = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::Parse(format!("bad request JSON: {e}")))?;
        parse_request_value(&root, Format::OpenAi)
    }

    fn parse_response(&self, raw: &[u8]) -> Result<(Vec<Message>, Usage)> {
        let root: Value = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::Parse(format!("bad response JSON: {e}")))?;
        parse_response_value(&root)
    }

    fn parse_chunk(&self, data: &str, ctx: &mut StreamContext) -> Result<Vec<UnifiedEvent>> {
        parse_chunk_value(data, ctx, &["reasoning_content"])
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

impl FormatEmitter for OpenAiFormat {
    fn format(&self) -> Format {
        Format::OpenAi
    }

    fn emit_request(&self, ir: &UnifiedRequest) -> Result<Value> {
        emit_request_value(ir, "reasoning_content")
    }

    fn emit_response(&self, messages: &[Message], usage: &Usage, model: &str) -> Result<Value> {
        emit_response_value(messages, usage, model, "reasoning_content")
    }

    fn emit_chunk(&self, event: &UnifiedEvent, ctx: &mut StreamContext) -> Result<Vec<String>> {
        emit_chunk_value(event, ctx, "reasoning_content")
    }

    fn flush(&self, _ctx: &mut StreamContext) -> Result<Vec<String>> {
        Ok(vec![sse::done_frame()])
    }
}
