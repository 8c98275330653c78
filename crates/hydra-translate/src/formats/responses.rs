//! OpenAI Responses API dialect (codex clients).
//!
//! Streaming is event-typed: every frame carries a `type`, a monotone
//! `sequence_number`, and item/output indices. The emitter tracks which output
//! item is open so deltas land inside the right envelope and `*.done` events
//! carry the accumulated payloads.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use hydra_core::{GatewayError, Result};
use hydra_protocol::{
    normalize_tool_id, ContentPart, FinishReason, Message, Role, Sampling, ThinkingConfig,
    ThinkingEffort, ToolCall, ToolChoice, ToolSpec, UnifiedEvent, UnifiedRequest, Usage,
};

use crate::context::StreamContext;
use crate::registry::{Format, FormatEmitter, FormatParser};
use crate::sse;

pub struct ResponsesFormat;

#[derive(Debug, Default)]
pub struct ResponsesParseState {
    /// Streamed function-call items: wire item id → unified tool index.
    pub tool_items: HashMap<String, usize>,
}

/// Which output item the emitter currently has open.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenItem {
    Message { item_id: String },
    FunctionCall { item_id: String, call_id: String, name: String },
    Reasoning { item_id: String },
}

#[derive(Debug, Default)]
pub struct ResponsesEmitState {
    pub sequence: u64,
    pub output_index: u64,
    pub open_item: Option<OpenItem>,
    pub created_sent: bool,
    /// Accumulators for the `*.done` events.
    pub text_accum: String,
    pub args_accum: String,
    pub summary_accum: String,
}

fn parse_responses_usage(usage: Option<&Value>) -> Usage {
    let Some(u) = usage else {
        return Usage::default();
    };
    Usage {
        prompt_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
        completion_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
        total_tokens: u.get("total_tokens").and_then(Value::as_u64).unwrap_or(0),
        thoughts_tokens: u
            .pointer("/output_tokens_details/reasoning_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        cached_tokens: u
            .pointer("/input_tokens_details/cached_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    }
    .with_total()
}

fn emit_responses_usage(usage: &Usage) -> Value {
    json!({
        "input_tokens": usage.prompt_tokens,
        "output_tokens": usage.completion_tokens,
        "total_tokens": usage.with_total().total_tokens,
        "output_tokens_details": { "reasoning_tokens": usage.thoughts_tokens },
        "input_tokens_details": { "cached_tokens": usage.cached_tokens },
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

    if let Some(instructions) = obj.get("instructions").and_then(Value::as_str) {
        req.messages.push(Message::text(Role::System, instructions));
    }

    match obj.get("input") {
        Some(Value::String(text)) => req.messages.push(Message::text(Role::User, text)),
        Some(Value::Array(items)) => {
            for item in items {
                parse_input_item(item, &mut req.messages)?;
            }
        }
        _ => return Err(GatewayError::Parse("missing input".into())),
    }

    // Responses tools are flat (no nested `function` object).
    for tool in obj.get("tools").and_then(Value::as_array).into_iter().flatten() {
        if tool.get("type").and_then(Value::as_str) != Some("function") {
            continue;
        }
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
            parameters: tool.get("parameters").cloned().unwrap_or(json!({})),
        });
    }
    if let Some(choice) = obj.get("tool_choice") {
        req.tool_choice = Some(match choice {
            Value::String(s) => match s.as_str() {
                "required" => ToolChoice::Any,
                "none" => ToolChoice::None,
                _ => ToolChoice::Auto,
            },
            other => other
                .get("name")
                .and_then(Value::as_str)
                .map(|n| ToolChoice::Tool(n.to_string()))
                .unwrap_or_default(),
        });
    }

    req.sampling = Sampling {
        temperature: obj.get("temperature").and_then(Value::as_f64),
        top_p: obj.get("top_p").and_then(Value::as_f64),
        max_tokens: obj
            .get("max_output_tokens")
            .and_then(Value::as_u64)
            .map(|v| v as u32),
        ..Default::default()
    };

    if let Some(reasoning) = obj.get("reasoning") {
        req.thinking = Some(ThinkingConfig {
            include_thoughts: true,
            budget_tokens: None,
            effort: reasoning
                .get("effort")
                .and_then(Value::as_str)
                .and_then(|e| match e {
                    "minimal" => Some(ThinkingEffort::Minimal),
                    "low" => Some(ThinkingEffort::Low),
                    "medium" => Some(ThinkingEffort::Medium),
                    "high" => Some(ThinkingEffort::High),
                    _ => None,
                }),
            summary: reasoning
                .get("summary")
                .and_then(Value::as_str)
                .map(str::to_string),
        });
    }
    req.stream = obj.get("stream").and_then(Value::as_bool).unwrap_or(false);

    const KNOWN: &[&str] = &[
        "model",
        "input",
        "instructions",
        "tools",
        "tool_choice",
        "temperature",
        "top_p",
        "max_output_tokens",
        "reasoning",
        "stream",
    ];
    for (key, value) in obj {
        if !KNOWN.contains(&key.as_str()) {
            req.metadata
                .insert(format!("openai-response.{key}"), value.clone());
        }
    }
    Ok(req)
}

fn parse_input_item(item: &Value, out: &mut Vec<Message>) -> Result<()> {
    match item.get("type").and_then(Value::as_str) {
        // Untyped items default to messages (the API allows bare role/content).
        Some("message") | None => {
            let role = match item.get("role").and_then(Value::as_str) {
                Some("assistant") => Role::Assistant,
                Some("system") | Some("developer") => Role::System,
                _ => Role::User,
            };
            let mut msg = Message::new(role);
            match item.get("content") {
                Some(Value::String(text)) => msg.parts.push(ContentPart::text(text)),
                Some(Value::Array(blocks)) => {
                    for block in blocks {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            msg.parts.push(ContentPart::text(text));
                        }
                    }
                }
                _ => {}
            }
            if !msg.parts.is_empty() {
                out.push(msg);
            }
        }
        Some("function_call") => {
            let call = ToolCall {
                id: normalize_tool_id(
                    item.get("call_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default(),
                ),
                name: item
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                arguments: item
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or("{}")
                    .to_string(),
                thought_signature: None,
            };
            // Attach to the previous assistant turn when one exists.
            match out.last_mut() {
                Some(prev) if prev.role == Role::Assistant => prev.tool_calls.push(call),
                _ => {
                    let mut msg = Message::new(Role::Assistant);
                    msg.tool_calls.push(call);
                    out.push(msg);
                }
            }
        }
        Some("function_call_output") => {
            let mut msg = Message::new(Role::Tool);
            msg.parts.push(ContentPart::ToolResult {
                call_id: normalize_tool_id(
                    item.get("call_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default(),
                ),
                text: item
                    .get("output")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                is_error: false,
            });
            out.push(msg);
        }
        Some("reasoning") => {
            let text: String = item
                .get("summary")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|s| s.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("");
            let signature = item
                .get("encrypted_content")
                .and_then(Value::as_str)
                .map(str::to_string);
            let part = ContentPart::Reasoning { text, signature };
            match out.last_mut() {
                Some(prev) if prev.role == Role::Assistant => prev.parts.insert(0, part),
                _ => {
                    let mut msg = Message::new(Role::Assistant);
                    msg.parts.push(part);
                    out.push(msg);
                }
            }
        }
        _ => {}
    }
    Ok(())
}

// ── request emission ─────────────────────────────────────────────────────────

fn emit_request_value(ir: &UnifiedRequest) -> Result<Value> {
    let mut instructions: Vec<&str> = Vec::new();
    let mut input: Vec<Value> = Vec::new();

    for msg in &ir.messages {
        match msg.role {
            Role::System => {
                for part in &msg.parts {
                    if let ContentPart::Text { text } = part {
                        instructions.push(text);
                    }
                }
            }
            Role::Tool => {
                for part in &msg.parts {
                    if let ContentPart::ToolResult { call_id, text, .. } = part {
                        input.push(json!({
                            "type": "function_call_output",
                            "call_id": call_id,
                            "output": text,
                        }));
                    }
                }
            }
            Role::User | Role::Assistant => {
                let role = if msg.role == Role::User {
                    "user"
                } else {
                    "assistant"
                };
                let text_type = if msg.role == Role::User {
                    "input_text"
                } else {
                    "output_text"
                };

                // Reasoning first so the upstream sees thoughts before output.
                for part in &msg.parts {
                    if let ContentPart::Reasoning { text, signature } = part {
                        let mut item = json!({
                            "type": "reasoning",
                            "summary": [{"type": "summary_text", "text": text}],
                        });
                        if let Some(sig) = signature {
                            item["encrypted_content"] = json!(sig);
                        }
                        input.push(item);
                    }
                }

                let content: Vec<Value> = msg
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text { text } => {
                            Some(json!({"type": text_type, "text": text}))
                        }
                        _ => None,
                    })
                    .collect();
                if !content.is_empty() {
                    input.push(json!({"type": "message", "role": role, "content": content}));
                }
                for call in &msg.tool_calls {
                    input.push(json!({
                        "type": "function_call",
                        "call_id": call.id,
                        "name": call.name,
                        "arguments": call.arguments,
                    }));
                }
            }
        }
    }

    let mut body = json!({
        "model": ir.model,
        "input": input,
    });
    let obj = body.as_object_mut().expect("body is an object");
    if !instructions.is_empty() {
        obj.insert("instructions".into(), json!(instructions.join("\n\n")));
    }
    if !ir.tools.is_empty() {
        let tools: Vec<Value> = ir
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();
        obj.insert("tools".into(), json!(tools));
    }
    if let Some(choice) = &ir.tool_choice {
        let wire = match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Any => json!("required"),
            ToolChoice::None => json!("none"),
            ToolChoice::Tool(name) => json!({"type": "function", "name": name}),
        };
        obj.insert("tool_choice".into(), wire);
    }
    if let Some(t) = ir.sampling.temperature {
        obj.insert("temperature".into(), json!(t));
    }
    if let Some(p) = ir.sampling.top_p {
        obj.insert("top_p".into(), json!(p));
    }
    if let Some(m) = ir.sampling.max_tokens {
        obj.insert("max_output_tokens".into(), json!(m));
    }
    if let Some(thinking) = &ir.thinking {
        let mut reasoning = Map::new();
        if let Some(effort) = thinking.effort {
            reasoning.insert("effort".into(), json!(effort.as_str()));
        }
        if let Some(summary) = &thinking.summary {
            reasoning.insert("summary".into(), json!(summary));
        }
        if !reasoning.is_empty() {
            obj.insert("reasoning".into(), Value::Object(reasoning));
        }
    }
    if ir.stream {
        obj.insert("stream".into(), json!(true));
    }
    Ok(body)
}

// ── response parsing / emission ──────────────────────────────────────────────

fn parse_response_value(root: &Value) -> Result<(Vec<Message>, Usage)> {
    let output = root
        .get("output")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::Parse("response has no output".into()))?;

    let mut msg = Message::new(Role::Assistant);
    for item in output {
        match item.get("type").and_then(Value::as_str) {
            Some("message") => {
                for block in item.get("content").and_then(Value::as_array).into_iter().flatten() {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        msg.parts.push(ContentPart::text(text));
                    }
                }
            }
            Some("reasoning") => {
                let text: String = item
                    .get("summary")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(|s| s.get("text").and_then(Value::as_str))
                    .collect();
                msg.parts.insert(
                    0,
                    ContentPart::Reasoning {
                        text,
                        signature: item
                            .get("encrypted_content")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    },
                );
            }
            Some("function_call") => {
                msg.tool_calls.push(ToolCall {
                    id: normalize_tool_id(
                        item.get("call_id")
                            .and_then(Value::as_str)
                            .unwrap_or_default(),
                    ),
                    name: item
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    arguments: item
                        .get("arguments")
                        .and_then(Value::as_str)
                        .unwrap_or("{}")
                        .to_string(),
                    thought_signature: None,
                });
            }
            _ => {}
        }
    }
    Ok((vec![msg], parse_responses_usage(root.get("usage"))))
}

fn emit_response_value(messages: &[Message], usage: &Usage, model: &str) -> Result<Value> {
    let assistant = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .ok_or_else(|| GatewayError::Parse("no assistant message to emit".into()))?;

    let response_id = format!("resp_{}", uuid::Uuid::new_v4().simple());
    let mut output = Vec::new();
    for part in &assistant.parts {
        match part {
            ContentPart::Reasoning { text, signature } => {
                let mut item = json!({
                    "type": "reasoning",
                    "id": format!("rs_{}", uuid::Uuid::new_v4().simple()),
                    "summary": [{"type": "summary_text", "text": text}],
                });
                if let Some(sig) = signature {
                    item["encrypted_content"] = json!(sig);
                }
                output.push(item);
            }
            ContentPart::Text { text } => output.push(json!({
                "type": "message",
                "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
                "status": "completed",
                "role": "assistant",
                "content": [{"type": "output_text", "text": text, "annotations": []}],
            })),
            _ => {}
        }
    }
    for call in &assistant.tool_calls {
        output.push(json!({
            "type": "function_call",
            "id": format!("fc_{}", uuid::Uuid::new_v4().simple()),
            "status": "completed",
            "call_id": call.id,
            "name": call.name,
            "arguments": call.arguments,
        }));
    }

    Ok(json!({
        "id": response_id,
        "object": "response",
        "status": "completed",
        "model": model,
        "output": output,
        "usage": emit_responses_usage(usage),
    }))
}

// ── chunk parsing ────────────────────────────────────────────────────────────

fn parse_chunk_value(data: &str, ctx: &mut StreamContext) -> Result<Vec<UnifiedEvent>> {
    let root: Value = serde_json::from_str(data)
        .map_err(|e| GatewayError::Parse(format!("bad stream chunk: {e}")))?;
    let kind = root.get("type").and_then(Value::as_str).unwrap_or_default();
    let mut events = Vec::new();

    match kind {
        "response.created" => {
            events.push(UnifiedEvent::StreamMeta {
                message_id: root
                    .pointer("/response/id")
                    .and_then(Value::as_str)
                    .unwrap_or(&ctx.message_id)
                    .to_string(),
                model: root
                    .pointer("/response/model")
                    .and_then(Value::as_str)
                    .unwrap_or(&ctx.model)
                    .to_string(),
                estimated_input_tokens: ctx.estimated_input_tokens,
            });
        }
        "response.output_item.added" => {
            let item = root.get("item").cloned().unwrap_or_default();
            if item.get("type").and_then(Value::as_str) == Some("function_call") {
                let item_id = item
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let index = ctx.next_tool_index();
                ctx.responses_parse.tool_items.insert(item_id, index);
                events.push(UnifiedEvent::ToolCallDelta {
                    index,
                    id: Some(normalize_tool_id(
                        item.get("call_id")
                            .and_then(Value::as_str)
                            .unwrap_or_default(),
                    )),
                    name: Some(
                        item.get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    ),
                    arguments_delta: String::new(),
                });
            }
        }
        "response.output_text.delta" => {
            if let Some(delta) = root.get("delta").and_then(Value::as_str) {
                events.push(UnifiedEvent::Token {
                    text: delta.to_string(),
                });
            }
        }
        "response.reasoning_summary_text.delta" => {
            if let Some(delta) = root.get("delta").and_then(Value::as_str) {
                events.push(UnifiedEvent::ReasoningSummary {
                    text: delta.to_string(),
                });
            }
        }
        "response.reasoning_text.delta" => {
            if let Some(delta) = root.get("delta").and_then(Value::as_str) {
                events.push(UnifiedEvent::Reasoning {
                    text: delta.to_string(),
                    signature: None,
                });
            }
        }
        "response.function_call_arguments.delta" => {
            let item_id = root
                .get("item_id")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if let Some(index) = ctx.responses_parse.tool_items.get(item_id) {
                events.push(UnifiedEvent::ToolCallDelta {
                    index: *index,
                    id: None,
                    name: None,
                    arguments_delta: root
                        .get("delta")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
        }
        "response.completed" | "response.done" | "response.incomplete" | "response.failed" => {
            let usage = parse_responses_usage(root.pointer("/response/usage"));
            ctx.usage.merge(&usage);
            let reason = match kind {
                "response.incomplete" => {
                    match root
                        .pointer("/response/incomplete_details/reason")
                        .and_then(Value::as_str)
                    {
                        Some("max_output_tokens") => FinishReason::Length,
                        Some("content_filter") => FinishReason::ContentFilter,
                        _ => FinishReason::Unknown,
                    }
                }
                "response.failed" => FinishReason::Error,
                _ => FinishReason::Stop,
            };
            events.push(UnifiedEvent::Finish {
                reason,
                usage: (!ctx.usage.is_empty()).then_some(ctx.usage),
            });
        }
        "error" | "response.error" => {
            events.push(UnifiedEvent::Error {
                message: root
                    .pointer("/error/message")
                    .or_else(|| root.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("upstream error")
                    .to_string(),
            });
        }
        // in_progress / content_part / *.done events carry no new content
        _ => {}
    }
    Ok(events)
}

// ── chunk emission ───────────────────────────────────────────────────────────

fn seq(ctx: &mut StreamContext) -> u64 {
    let n = ctx.responses_emit.sequence;
    ctx.responses_emit.sequence += 1;
    n
}

fn typed_frame(ctx: &mut StreamContext, kind: &str, mut payload: Value) -> String {
    payload["type"] = json!(kind);
    payload["sequence_number"] = json!(seq(ctx));
    sse::event_frame(kind, &payload.to_string())
}

fn ensure_created(ctx: &mut StreamContext, frames: &mut Vec<String>) {
    if ctx.responses_emit.created_sent {
        return;
    }
    ctx.responses_emit.created_sent = true;
    let response = json!({
        "id": format!("resp_{}", ctx.message_id),
        "object": "response",
        "status": "in_progress",
        "model": ctx.model,
        "output": [],
    });
    frames.push(typed_frame(
        ctx,
        "response.created",
        json!({"response": response}),
    ));
    frames.push(typed_frame(
        ctx,
        "response.in_progress",
        json!({"response": response}),
    ));
}

fn close_open_item(ctx: &mut StreamContext, frames: &mut Vec<String>) {
    let Some(open) = ctx.responses_emit.open_item.take() else {
        return;
    };
    let output_index = ctx.responses_emit.output_index;
    ctx.responses_emit.output_index += 1;
    match open {
        OpenItem::Message { item_id } => {
            let text = std::mem::take(&mut ctx.responses_emit.text_accum);
            frames.push(typed_frame(
                ctx,
                "response.output_text.done",
                json!({"item_id": item_id, "output_index": output_index, "content_index": 0, "text": text}),
            ));
            frames.push(typed_frame(
                ctx,
                "response.content_part.done",
                json!({
                    "item_id": item_id,
                    "output_index": output_index,
                    "content_index": 0,
                    "part": {"type": "output_text", "text": text, "annotations": []},
                }),
            ));
            frames.push(typed_frame(
                ctx,
                "response.output_item.done",
                json!({
                    "output_index": output_index,
                    "item": {
                        "type": "message",
                        "id": item_id,
                        "status": "completed",
                        "role": "assistant",
                        "content": [{"type": "output_text", "text": text, "annotations": []}],
                    },
                }),
            ));
        }
        OpenItem::FunctionCall {
            item_id,
            call_id,
            name,
        } => {
            let args = std::mem::take(&mut ctx.responses_emit.args_accum);
            frames.push(typed_frame(
                ctx,
                "response.function_call_arguments.done",
                json!({"item_id": item_id, "output_index": output_index, "arguments": args}),
            ));
            frames.push(typed_frame(
                ctx,
                "response.output_item.done",
                json!({
                    "output_index": output_index,
                    "item": {
                        "type": "function_call",
                        "id": item_id,
                        "status": "completed",
                        "call_id": call_id,
                        "name": name,
                        "arguments": args,
                    },
                }),
            ));
        }
        OpenItem::Reasoning { item_id } => {
            let text = std::mem::take(&mut ctx.responses_emit.summary_accum);
            frames.push(typed_frame(
                ctx,
                "response.reasoning_summary_text.done",
                json!({"item_id": item_id, "output_index": output_index, "summary_index": 0, "text": text}),
            ));
            frames.push(typed_frame(
                ctx,
                "response.output_item.done",
                json!({
                    "output_index": output_index,
                    "item": {
                        "type": "reasoning",
                        "id": item_id,
                        "summary": [{"type": "summary_text", "text": text}],
                    },
                }),
            ));
        }
    }
}

fn emit_chunk_value(event: &UnifiedEvent, ctx: &mut StreamContext) -> Result<Vec<String>> {
    let mut frames = Vec::new();

    match event {
        UnifiedEvent::StreamMeta { .. } => {
            ensure_created(ctx, &mut frames);
        }
        UnifiedEvent::Token { text } => {
            ensure_created(ctx, &mut frames);
            let item_id = match &ctx.responses_emit.open_item {
                Some(OpenItem::Message { item_id }) => item_id.clone(),
                _ => {
                    close_open_item(ctx, &mut frames);
                    let item_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
                    let output_index = ctx.responses_emit.output_index;
                    frames.push(typed_frame(
                        ctx,
                        "response.output_item.added",
                        json!({
                            "output_index": output_index,
                            "item": {
                                "type": "message",
                                "id": item_id,
                                "status": "in_progress",
                                "role": "assistant",
                                "content": [],
                            },
                        }),
                    ));
                    frames.push(typed_frame(
                        ctx,
                        "response.content_part.added",
                        json!({
                            "item_id": item_id,
                            "output_index": output_index,
                            "content_index": 0,
                            "part": {"type": "output_text", "text": "", "annotations": []},
                        }),
                    ));
                    ctx.responses_emit.open_item = Some(OpenItem::Message {
                        item_id: item_id.clone(),
                    });
                    item_id
                }
            };
            ctx.responses_emit.text_accum.push_str(text);
            let output_index = ctx.responses_emit.output_index;
            frames.push(typed_frame(
                ctx,
                "response.output_text.delta",
                json!({
                    "item_id": item_id,
                    "output_index": output_index,
                    "content_index": 0,
                    "delta": text,
                }),
            ));
        }
        UnifiedEvent::Reasoning { text, .. } | UnifiedEvent::ReasoningSummary { text } => {
            if text.is_empty() {
                return Ok(frames);
            }
            ensure_created(ctx, &mut frames);
            let item_id = match &ctx.responses_emit.open_item {
                Some(OpenItem::Reasoning { item_id }) => item_id.clone(),
                _ => {
                    close_open_item(ctx, &mut frames);
                    let item_id = format!("rs_{}", uuid::Uuid::new_v4().simple());
                    let output_index = ctx.responses_emit.output_index;
                    frames.push(typed_frame(
                        ctx,
                        "response.output_item.added",
                        json!({
                            "output_index": output_index,
                            "item": {"type": "reasoning", "id": item_id, "summary": []},
                        }),
                    ));
                    ctx.responses_emit.open_item = Some(OpenItem::Reasoning {
                        item_id: item_id.clone(),
                    });
                    item_id
                }
            };
            ctx.responses_emit.summary_accum.push_str(text);
            let output_index = ctx.responses_emit.output_index;
            frames.push(typed_frame(
                ctx,
                "response.reasoning_summary_text.delta",
                json!({
                    "item_id": item_id,
                    "output_index": output_index,
                    "summary_index": 0,
                    "delta": text,
                }),
            ));
        }
        UnifiedEvent::ToolCall { call } => {
            ensure_created(ctx, &mut frames);
            close_open_item(ctx, &mut frames);
            open_function_call(ctx, &call.id, &call.name, &mut frames);
            ctx.responses_emit.args_accum.push_str(&call.arguments);
            let (item_id, output_index) = current_item(ctx);
            frames.push(typed_frame(
                ctx,
                "response.function_call_arguments.delta",
                json!({"item_id": item_id, "output_index": output_index, "delta": call.arguments}),
            ));
            close_open_item(ctx, &mut frames);
        }
        UnifiedEvent::ToolCallDelta {
            id,
            name,
            arguments_delta,
            ..
        } => {
            ensure_created(ctx, &mut frames);
            if let (Some(id), Some(name)) = (id, name) {
                close_open_item(ctx, &mut frames);
                open_function_call(ctx, id, name, &mut frames);
            }
            if !arguments_delta.is_empty() {
                ctx.responses_emit.args_accum.push_str(arguments_delta);
                let (item_id, output_index) = current_item(ctx);
                frames.push(typed_frame(
                    ctx,
                    "response.function_call_arguments.delta",
                    json!({"item_id": item_id, "output_index": output_index, "delta": arguments_delta}),
                ));
            }
        }
        UnifiedEvent::Image { .. } | UnifiedEvent::CodeExecution { .. } => {}
        UnifiedEvent::Error { message } => {
            frames.push(typed_frame(
                ctx,
                "error",
                json!({"code": "upstream_error", "message": message}),
            ));
        }
        UnifiedEvent::Finish { reason, usage } => {
            ensure_created(ctx, &mut frames);
            close_open_item(ctx, &mut frames);
            let (kind, status) = match reason {
                FinishReason::Length | FinishReason::ContentFilter => {
                    ("response.incomplete", "incomplete")
                }
                FinishReason::Error => ("response.failed", "failed"),
                _ => ("response.completed", "completed"),
            };
            let usage = usage.unwrap_or(ctx.usage);
            frames.push(typed_frame(
                ctx,
                kind,
                json!({
                    "response": {
                        "id": format!("resp_{}", ctx.message_id),
                        "object": "response",
                        "status": status,
                        "model": ctx.model,
                        "usage": emit_responses_usage(&usage),
                    },
                }),
            ));
        }
    }
    Ok(frames)
}

fn open_function_call(ctx: &mut StreamContext, call_id: &str, name: &str, frames: &mut Vec<String>) {
    let item_id = format!("fc_{}", uuid::Uuid::new_v4().simple());
    let output_index = ctx.responses_emit.output_index;
    frames.push(typed_frame(
        ctx,
        "response.output_item.added",
        json!({
            "output_index": output_index,
            "item": {
                "type": "function_call",
                "id": item_id,
                "status": "in_progress",
                "call_id": call_id,
                "name": name,
                "arguments": "",
            },
        }),
    ));
    ctx.responses_emit.open_item = Some(OpenItem::FunctionCall {
        item_id,
        call_id: call_id.to_string(),
        name: name.to_string(),
    });
}

fn current_item(ctx: &StreamContext) -> (String, u64) {
    let item_id = match &ctx.responses_emit.open_item {
        Some(OpenItem::Message { item_id })
        | Some(OpenItem::Reasoning { item_id })
        | Some(OpenItem::FunctionCall { item_id, .. }) => item_id.clone(),
        None => String::new(),
    };
    (item_id, ctx.responses_emit.output_index)
}

// ── trait wiring ─────────────────────────────────────────────────────────────

impl FormatParser for ResponsesFormat {
    fn format(&self) -> Format {
        Format::Responses
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
}

impl FormatEmitter for ResponsesFormat {
    fn format(&self) -> Format {
        Format::Responses
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
    fn request_items_parse_into_messages() {
        let raw = json!({
            "model": "gpt-5-codex",
            "instructions": "be fast",
            "input": [
                {"type": "message", "role": "user", "content": [{"type": "input_text", "text": "hi"}]},
                {"type": "function_call", "call_id": "call_1", "name": "f", "arguments": "{}"},
                {"type": "function_call_output", "call_id": "call_1", "output": "ok"},
            ],
            "reasoning": {"effort": "high"},
        });
        let req = parse_request_value(&raw).unwrap();
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[1].joined_text(), "hi");
        assert_eq!(req.messages[2].tool_calls[0].id, "call_1");
        assert_eq!(req.messages[3].role, Role::Tool);
        assert_eq!(
            req.thinking.as_ref().unwrap().effort,
            Some(ThinkingEffort::High)
        );
    }

    #[test]
    fn emit_request_produces_flat_tools() {
        let mut req = UnifiedRequest::new("gpt-5-codex");
        req.messages.push(Message::text(Role::User, "x"));
        req.tools.push(ToolSpec {
            name: "f".into(),
            description: "d".into(),
            parameters: json!({"type": "object"}),
        });
        let wire = emit_request_value(&req).unwrap();
        assert_eq!(wire["tools"][0]["name"], "f");
        assert!(wire["tools"][0].get("function").is_none());
    }

    #[test]
    fn stream_events_translate_in_order() {
        let fmt = ResponsesFormat;
        let mut ctx = StreamContext::new("m", "id");
        let ev = fmt
            .parse_chunk(
                r#"{"type":"response.created","sequence_number":0,"response":{"id":"resp_1","model":"m"}}"#,
                &mut ctx,
            )
            .unwrap();
        assert!(matches!(ev[0], UnifiedEvent::StreamMeta { .. }));

        let ev = fmt
            .parse_chunk(
                r#"{"type":"response.output_item.added","output_index":0,"item":{"type":"function_call","id":"fc_1","call_id":"call_9","name":"f"}}"#,
                &mut ctx,
            )
            .unwrap();
        assert_eq!(
            ev[0],
            UnifiedEvent::ToolCallDelta {
                index: 0,
                id: Some("call_9".into()),
                name: Some("f".into()),
                arguments_delta: String::new(),
            }
        );

        let ev = fmt
            .parse_chunk(
                r#"{"type":"response.function_call_arguments.delta","item_id":"fc_1","delta":"{\"x\":1}"}"#,
                &mut ctx,
            )
            .unwrap();
        assert_eq!(
            ev[0],
            UnifiedEvent::ToolCallDelta {
                index: 0,
                id: None,
                name: None,
                arguments_delta: "{\"x\":1}".into(),
            }
        );

        let ev = fmt
            .parse_chunk(
                r#"{"type":"response.completed","response":{"usage":{"input_tokens":3,"output_tokens":4}}}"#,
                &mut ctx,
            )
            .unwrap();
        match &ev[0] {
            UnifiedEvent::Finish { reason, usage } => {
                assert_eq!(*reason, FinishReason::Stop);
                assert_eq!(usage.unwrap().completion_tokens, 4);
            }
            other => panic!("expected finish, got {other:?}"),
        }
    }

    #[test]
    fn emitted_stream_carries_sequence_numbers() {
        let mut ctx = StreamContext::new("m", "abc");
        let mut frames = Vec::new();
        frames.extend(
            emit_chunk_value(
                &UnifiedEvent::StreamMeta {
                    message_id: "abc".into(),
                    model: "m".into(),
                    estimated_input_tokens: None,
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
        // Every data payload parses and the sequence strictly increases.
        let mut last = -1i64;
        for frame in &frames {
            let data_line = frame.lines().find(|l| l.starts_with("data: ")).unwrap();
            let body: Value =
                serde_json::from_str(data_line.trim_start_matches("data: ")).unwrap();
            let seq = body["sequence_number"].as_i64().unwrap();
            assert!(seq > last, "sequence must increase: {seq} after {last}");
            last = seq;
        }
        let joined = frames.join("");
        assert!(joined.contains("response.created"));
        assert!(joined.contains("response.output_text.delta"));
        assert!(joined.contains("response.output_text.done"));
        assert!(joined.contains("response.completed"));
    }

    #[test]
    fn incomplete_maps_to_length() {
        let fmt = ResponsesFormat;
        let mut ctx = StreamContext::new("m", "id");
        let ev = fmt
            .parse_chunk(
                r#"{"type":"response.incomplete","response":{"incomplete_details":{"reason":"max_output_tokens"},"usage":{"input_tokens":1,"output_tokens":2}}}"#,
                &mut ctx,
            )
            .unwrap();
        assert!(matches!(
            ev[0],
            UnifiedEvent::Finish {
                reason: FinishReason::Length,
                ..
            }
        ));
    }

    #[test]
    fn response_round_trip_keeps_reasoning_signature() {
        let raw = json!({
            "id": "resp_1",
            "output": [
                {"type": "reasoning", "summary": [{"type": "summary_text", "text": "th"}],
                 "encrypted_content": "enc-1"},
                {"type": "message", "content": [{"type": "output_text", "text": "hi"}]},
            ],
            "usage": {"input_tokens": 1, "output_tokens": 2},
        });
        let (messages, usage) = parse_response_value(&raw).unwrap();
        let wire = emit_response_value(&messages, &usage, "m").unwrap();
        assert_eq!(wire["output"][0]["encrypted_content"], "enc-1");
        assert_eq!(
            wire["output"][1]["content"][0]["text"],
            "hi"
        );
    }
}
