//! Ollama dialect — newline-delimited JSON, chat and generate variants.
//!
//! Chunks are bare JSON lines (no SSE framing). The final line has
//! `done: true` and carries `done_reason` plus the eval counters.

use chrono::Utc;
use serde_json::{json, Map, Value};

use hydra_core::{GatewayError, Result};
use hydra_protocol::{
    ContentPart, FinishReason, Message, Role, Sampling, ToolCall, ToolIdAllocator, ToolSpec,
    UnifiedEvent, UnifiedRequest, Usage,
};

use crate::context::StreamContext;
use crate::registry::{Format, FormatEmitter, FormatParser};

pub struct OllamaFormat;

#[derive(Debug, Default)]
pub struct OllamaEmitState {
    /// Stable `created_at` across all chunks of one stream.
    pub created_at: Option<String>,
}

impl OllamaEmitState {
    fn created_at(&mut self) -> String {
        self.created_at
            .get_or_insert_with(|| Utc::now().to_rfc3339())
            .clone()
    }
}

fn finish_from_done_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        _ => FinishReason::Unknown,
    }
}

fn done_reason_from_finish(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Length => "length",
        _ => "stop",
    }
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

    if let Some(messages) = obj.get("messages").and_then(Value::as_array) {
        // Chat variant.
        let mut alloc = ToolIdAllocator::new();
        for raw in messages {
            req.messages.push(parse_chat_message(raw, &mut alloc));
        }
    } else if let Some(prompt) = obj.get("prompt").and_then(Value::as_str) {
        // Generate variant: optional system plus a single user prompt.
        if let Some(system) = obj.get("system").and_then(Value::as_str) {
            req.messages.push(Message::text(Role::System, system));
        }
        req.messages.push(Message::text(Role::User, prompt));
        req.metadata
            .insert("ollama.endpoint".into(), json!("generate"));
    } else {
        return Err(GatewayError::Parse("missing messages or prompt".into()));
    }

    for tool in obj.get("tools").and_then(Value::as_array).into_iter().flatten() {
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

    if let Some(options) = obj.get("options") {
        req.sampling = Sampling {
            temperature: options.get("temperature").and_then(Value::as_f64),
            top_p: options.get("top_p").and_then(Value::as_f64),
            top_k: options
                .get("top_k")
                .and_then(Value::as_u64)
                .map(|v| v as u32),
            max_tokens: options
                .get("num_predict")
                .and_then(Value::as_u64)
                .map(|v| v as u32),
            stop: options
                .get("stop")
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
    }
    // Ollama streams unless the caller says otherwise.
    req.stream = obj.get("stream").and_then(Value::as_bool).unwrap_or(true);

    if let Some(format) = obj.get("format") {
        if format.is_object() {
            req.response_schema = Some(format.clone());
        }
    }

    const KNOWN: &[&str] = &[
        "model", "messages", "prompt", "system", "tools", "options", "stream", "format",
    ];
    for (key, value) in obj {
        if !KNOWN.contains(&key.as_str()) {
            req.metadata.insert(format!("ollama.{key}"), value.clone());
        }
    }
    Ok(req)
}

fn parse_chat_message(raw: &Value, alloc: &mut ToolIdAllocator) -> Message {
    let role = match raw.get("role").and_then(Value::as_str) {
        Some("assistant") => Role::Assistant,
        Some("system") => Role::System,
        Some("tool") => Role::Tool,
        _ => Role::User,
    };
    let mut msg = Message::new(role);

    if let Some(content) = raw.get("content").and_then(Value::as_str) {
        if role == Role::Tool {
            // Tool outputs pair FIFO with the most recent unanswered call.
            let name = raw
                .get("tool_name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            msg.parts.push(ContentPart::ToolResult {
                call_id: alloc.resolve(name),
                text: content.to_string(),
                is_error: false,
            });
        } else if !content.is_empty() {
            msg.parts.push(ContentPart::text(content));
        }
    }
    if let Some(thinking) = raw.get("thinking").and_then(Value::as_str) {
        msg.parts.insert(
            0,
            ContentPart::Reasoning {
                text: thinking.to_string(),
                signature: None,
            },
        );
    }
    for image in raw.get("images").and_then(Value::as_array).into_iter().flatten() {
        if let Some(data) = image.as_str() {
            msg.parts.push(ContentPart::Image {
                mime: "image/png".into(),
                source: hydra_protocol::ImageSource::Base64(data.to_string()),
            });
        }
    }
    for call in raw
        .get("tool_calls")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let func = call.get("function").cloned().unwrap_or_default();
        let name = func
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        msg.tool_calls.push(ToolCall {
            id: alloc.assign(&name),
            name,
            arguments: func
                .get("arguments")
                .map(|v| {
                    if v.is_string() {
                        v.as_str().unwrap_or_default().to_string()
                    } else {
                        v.to_string()
                    }
                })
                .unwrap_or_else(|| "{}".into()),
            thought_signature: None,
        });
    }
    msg
}

// ── request emission ─────────────────────────────────────────────────────────

fn emit_request_value(ir: &UnifiedRequest) -> Result<Value> {
    let mut messages = Vec::new();
    for msg in &ir.messages {
        match msg.role {
            Role::Tool => {
                for part in &msg.parts {
                    if let ContentPart::ToolResult { call_id, text, .. } = part {
                        let name = ir
                            .messages
                            .iter()
                            .flat_map(|m| m.tool_calls.iter())
                            .find(|c| &c.id == call_id)
                            .map(|c| c.name.clone())
                            .unwrap_or_default();
                        messages.push(json!({
                            "role": "tool",
                            "tool_name": name,
                            "content": text,
                        }));
                    }
                }
            }
            _ => {
                let role = match msg.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::System => "system",
                    Role::Tool => unreachable!(),
                };
                let mut wire = Map::new();
                wire.insert("role".into(), json!(role));
                wire.insert("content".into(), json!(msg.joined_text()));
                let images: Vec<&str> = msg
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Image {
                            source: hydra_protocol::ImageSource::Base64(data),
                            ..
                        } => Some(data.as_str()),
                        _ => None,
                    })
                    .collect();
                if !images.is_empty() {
                    wire.insert("images".into(), json!(images));
                }
                if !msg.tool_calls.is_empty() {
                    let calls: Vec<Value> = msg
                        .tool_calls
                        .iter()
                        .map(|c| {
                            let args: Value =
                                serde_json::from_str(&c.arguments).unwrap_or(json!({}));
                            json!({"function": {"name": c.name, "arguments": args}})
                        })
                        .collect();
                    wire.insert("tool_calls".into(), json!(calls));
                }
                messages.push(Value::Object(wire));
            }
        }
    }

    let mut body = json!({
        "model": ir.model,
        "messages": messages,
        "stream": ir.stream,
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

    let mut options = Map::new();
    let s = &ir.sampling;
    if let Some(v) = s.temperature {
        options.insert("temperature".into(), json!(v));
    }
    if let Some(v) = s.top_p {
        options.insert("top_p".into(), json!(v));
    }
    if let Some(v) = s.top_k {
        options.insert("top_k".into(), json!(v));
    }
    if let Some(v) = s.max_tokens {
        options.insert("num_predict".into(), json!(v));
    }
    if !s.stop.is_empty() {
        options.insert("stop".into(), json!(s.stop));
    }
    if !options.is_empty() {
        obj.insert("options".into(), Value::Object(options));
    }
    if let Some(schema) = &ir.response_schema {
        obj.insert("format".into(), schema.clone());
    }
    Ok(body)
}

// ── response parsing / emission ──────────────────────────────────────────────

fn parse_response_value(root: &Value) -> Result<(Vec<Message>, Usage)> {
    let mut alloc = ToolIdAllocator::new();
    let msg = if let Some(message) = root.get("message") {
        let mut parsed = parse_chat_message(message, &mut alloc);
        parsed.role = Role::Assistant;
        parsed
    } else if let Some(text) = root.get("response").and_then(Value::as_str) {
        // Generate variant.
        Message::text(Role::Assistant, text)
    } else {
        return Err(GatewayError::Parse("response has no message".into()));
    };

    let usage = Usage {
        prompt_tokens: root
            .get("prompt_eval_count")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        completion_tokens: root.get("eval_count").and_then(Value::as_u64).unwrap_or(0),
        ..Default::default()
    }
    .with_total();
    Ok((vec![msg], usage))
}

fn emit_response_value(messages: &[Message], usage: &Usage, model: &str) -> Result<Value> {
    let assistant = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .ok_or_else(|| GatewayError::Parse("no assistant message to emit".into()))?;

    let mut message = json!({
        "role": "assistant",
        "content": assistant.joined_text(),
    });
    let thinking: String = assistant
        .parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::Reasoning { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    if !thinking.is_empty() {
        message["thinking"] = json!(thinking);
    }
    if !assistant.tool_calls.is_empty() {
        let calls: Vec<Value> = assistant
            .tool_calls
            .iter()
            .map(|c| {
                let args: Value = serde_json::from_str(&c.arguments).unwrap_or(json!({}));
                json!({"function": {"name": c.name, "arguments": args}})
            })
            .collect();
        message["tool_calls"] = json!(calls);
    }

    Ok(json!({
        "model": model,
        "created_at": Utc::now().to_rfc3339(),
        "message": message,
        "done": true,
        "done_reason": done_reason_from_finish(if assistant.tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        }),
        "prompt_eval_count": usage.prompt_tokens,
        "eval_count": usage.completion_tokens,
    }))
}

// ── chunk parsing / emission ─────────────────────────────────────────────────

fn parse_chunk_value(data: &str, ctx: &mut StreamContext) -> Result<Vec<UnifiedEvent>> {
    let root: Value = serde_json::from_str(data)
        .map_err(|e| GatewayError::Parse(format!("bad stream chunk: {e}")))?;
    let mut events = Vec::new();

    let done = root.get("done").and_then(Value::as_bool).unwrap_or(false);
    if done {
        ctx.usage.merge(&Usage {
            prompt_tokens: root
                .get("prompt_eval_count")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            completion_tokens: root.get("eval_count").and_then(Value::as_u64).unwrap_or(0),
            ..Default::default()
        });
        let reason = root
            .get("done_reason")
            .and_then(Value::as_str)
            .map(finish_from_done_reason)
            .unwrap_or(FinishReason::Stop);
        events.push(UnifiedEvent::Finish {
            reason,
            usage: (!ctx.usage.is_empty()).then_some(ctx.usage),
        });
        return Ok(events);
    }

    if let Some(message) = root.get("message") {
        if let Some(thinking) = message.get("thinking").and_then(Value::as_str) {
            if !thinking.is_empty() {
                events.push(UnifiedEvent::Reasoning {
                    text: thinking.to_string(),
                    signature: None,
                });
            }
        }
        if let Some(text) = message.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                events.push(UnifiedEvent::Token {
                    text: text.to_string(),
                });
            }
        }
        for call in message
            .get("tool_calls")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let func = call.get("function").cloned().unwrap_or_default();
            events.push(UnifiedEvent::ToolCall {
                call: ToolCall {
                    id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                    name: func
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    arguments: func
                        .get("arguments")
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "{}".into()),
                    thought_signature: None,
                },
            });
        }
    } else if let Some(text) = root.get("response").and_then(Value::as_str) {
        if !text.is_empty() {
            events.push(UnifiedEvent::Token {
                text: text.to_string(),
            });
        }
    }
    Ok(events)
}

fn ndjson_line(value: &Value) -> String {
    format!("{value}\n")
}

fn emit_chunk_value(event: &UnifiedEvent, ctx: &mut StreamContext) -> Result<Vec<String>> {
    let created_at = ctx.ollama_emit.created_at();
    let model = ctx.model.clone();

    let frame = match event {
        UnifiedEvent::StreamMeta { .. } => return Ok(Vec::new()),
        UnifiedEvent::Token { text } => json!({
            "model": model,
            "created_at": created_at,
            "message": {"role": "assistant", "content": text},
            "done": false,
        }),
        UnifiedEvent::Reasoning { text, .. } | UnifiedEvent::ReasoningSummary { text } => {
            if text.is_empty() {
                return Ok(Vec::new());
            }
            json!({
                "model": model,
                "created_at": created_at,
                "message": {"role": "assistant", "content": "", "thinking": text},
                "done": false,
            })
        }
        UnifiedEvent::ToolCall { call } => {
            let args: Value = serde_json::from_str(&call.arguments).unwrap_or(json!({}));
            json!({
                "model": model,
                "created_at": created_at,
                "message": {
                    "role": "assistant",
                    "content": "",
                    "tool_calls": [{"function": {"name": call.name, "arguments": args}}],
                },
                "done": false,
            })
        }
        // Partial tool calls cannot be expressed in NDJSON chunks; they are
        // accumulated by the gemini-style buffers upstream of this emitter,
        // so a bare delta here is dropped.
        UnifiedEvent::ToolCallDelta { .. } => return Ok(Vec::new()),
        UnifiedEvent::Image { .. } | UnifiedEvent::CodeExecution { .. } => return Ok(Vec::new()),
        UnifiedEvent::Error { message } => json!({"error": message}),
        UnifiedEvent::Finish { reason, usage } => {
            let usage = usage.unwrap_or(ctx.usage);
            json!({
                "model": model,
                "created_at": created_at,
                "message": {"role": "assistant", "content": ""},
                "done": true,
                "done_reason": done_reason_from_finish(*reason),
                "prompt_eval_count": usage.prompt_tokens,
                "eval_count": usage.completion_tokens,
            })
        }
    };
    Ok(vec![ndjson_line(&frame)])
}

// ── trait wiring ─────────────────────────────────────────────────────────────

impl FormatParser for OllamaFormat {
    fn format(&self) -> Format {
        Format::Ollama
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

impl FormatEmitter for OllamaFormat {
    fn format(&self) -> Format {
        Format::Ollama
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
    fn chat_request_parses_with_default_stream() {
        let raw = json!({
            "model": "llama3.2",
            "messages": [{"role": "user", "content": "hi"}],
            "options": {"num_predict": 128, "temperature": 0.5},
        });
        let req = parse_request_value(&raw).unwrap();
        assert!(req.stream, "ollama streams by default");
        assert_eq!(req.sampling.max_tokens, Some(128));
    }

    #[test]
    fn generate_request_becomes_user_message() {
        let raw = json!({"model": "m", "prompt": "count to 3", "system": "sys", "stream": false});
        let req = parse_request_value(&raw).unwrap();
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[1].joined_text(), "count to 3");
        assert!(!req.stream);
        assert_eq!(req.metadata["ollama.endpoint"], "generate");
    }

    #[test]
    fn stream_chunks_translate_and_finish() {
        let fmt = OllamaFormat;
        let mut ctx = StreamContext::new("m", "id");
        let ev = fmt
            .parse_chunk(
                r#"{"model":"m","message":{"role":"assistant","content":"hel"},"done":false}"#,
                &mut ctx,
            )
            .unwrap();
        assert_eq!(ev, vec![UnifiedEvent::Token { text: "hel".into() }]);

        let ev = fmt
            .parse_chunk(
                r#"{"model":"m","message":{"role":"assistant","content":""},"done":true,"done_reason":"stop","prompt_eval_count":5,"eval_count":3}"#,
                &mut ctx,
            )
            .unwrap();
        match &ev[0] {
            UnifiedEvent::Finish { reason, usage } => {
                assert_eq!(*reason, FinishReason::Stop);
                assert_eq!(usage.unwrap().prompt_tokens, 5);
            }
            other => panic!("expected finish, got {other:?}"),
        }
    }

    #[test]
    fn emitted_chunks_are_ndjson_lines() {
        let mut ctx = StreamContext::new("llama3.2", "id");
        let frames =
            emit_chunk_value(&UnifiedEvent::Token { text: "hi".into() }, &mut ctx).unwrap();
        assert!(frames[0].ends_with('\n'));
        assert!(!frames[0].contains("data: "));
        let body: Value = serde_json::from_str(frames[0].trim()).unwrap();
        assert_eq!(body["message"]["content"], "hi");
        assert_eq!(body["done"], false);

        let frames = emit_chunk_value(
            &UnifiedEvent::Finish {
                reason: FinishReason::Stop,
                usage: Some(Usage {
                    prompt_tokens: 2,
                    completion_tokens: 1,
                    ..Default::default()
                }),
            },
            &mut ctx,
        )
        .unwrap();
        let body: Value = serde_json::from_str(frames[0].trim()).unwrap();
        assert_eq!(body["done"], true);
        assert_eq!(body["done_reason"], "stop");
        assert_eq!(body["eval_count"], 1);
    }

    #[test]
    fn tool_calls_pair_fifo_through_round_trip() {
        let raw = json!({
            "model": "m",
            "messages": [
                {"role": "assistant", "content": "",
                 "tool_calls": [{"function": {"name": "add", "arguments": {"a": 1}}}]},
                {"role": "tool", "tool_name": "add", "content": "2"},
            ],
        });
        let req = parse_request_value(&raw).unwrap();
        let call_id = req.messages[0].tool_calls[0].id.clone();
        match &req.messages[1].parts[0] {
            ContentPart::ToolResult { call_id: rid, .. } => assert_eq!(rid, &call_id),
            other => panic!("unexpected part {other:?}"),
        }
    }
}
