//! Gemini generateContent dialect (plain and gemini-cli flavors, plus the
//! Vertex envelope).
//!
//! Gemini has no stream terminator of its own: the last chunk carries
//! `finishReason` and `usageMetadata`. Consumers reject finish-only chunks,
//! so the emitter runs a delay-one buffer: it holds the most recent content
//! chunk and merges finish metadata into it when the stream ends.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use hydra_core::{GatewayError, Result};
use hydra_protocol::{
    ContentPart, FinishReason, ImageSource, Message, Role, Sampling, ThinkingConfig,
    ToolCall, ToolChoice, ToolIdAllocator, ToolSpec, UnifiedEvent, UnifiedRequest, Usage,
};

use crate::context::StreamContext;
use crate::registry::{Format, FormatEmitter, FormatParser};
use crate::schema::clean_json_schema_for_gemini;
use crate::sse;

pub struct GeminiFormat {
    /// gemini-cli speaks the same wire format; only the format tag differs.
    pub cli: bool,
}

#[derive(Debug, Default)]
pub struct GeminiParseState {
    /// Reasoning text waiting for the signature Gemini sends in a later part.
    pub pending_thought: Option<String>,
}

#[derive(Debug, Default)]
pub struct GeminiEmitState {
    /// Delay-one buffer: most recent content chunk, unreleased.
    pub held: Option<Value>,
    /// Partial tool calls accumulated from delta events, keyed by unified
    /// index. Gemini only speaks whole `functionCall` parts.
    pub pending_calls: BTreeMap<usize, PendingCall>,
}

#[derive(Debug, Default, Clone)]
pub struct PendingCall {
    pub name: String,
    pub arguments: String,
}

fn finish_from_wire(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" | "RECITATION" => FinishReason::ContentFilter,
        "MALFORMED_FUNCTION_CALL" => FinishReason::Error,
        _ => FinishReason::Unknown,
    }
}

fn finish_to_wire(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Stop | FinishReason::ToolCalls | FinishReason::Unknown => "STOP",
        FinishReason::Length => "MAX_TOKENS",
        FinishReason::ContentFilter => "SAFETY",
        FinishReason::Error => "OTHER",
    }
}

fn parse_usage_metadata(usage: Option<&Value>) -> Usage {
    let Some(u) = usage else {
        return Usage::default();
    };
    Usage {
        prompt_tokens: u
            .get("promptTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        completion_tokens: u
            .get("candidatesTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        total_tokens: u
            .get("totalTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        thoughts_tokens: u
            .get("thoughtsTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        cached_tokens: u
            .get("cachedContentTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    }
    .with_total()
}

fn emit_usage_metadata(usage: &Usage) -> Value {
    json!({
        "promptTokenCount": usage.prompt_tokens,
        "candidatesTokenCount": usage.completion_tokens,
        "totalTokenCount": usage.with_total().total_tokens,
        "thoughtsTokenCount": usage.thoughts_tokens,
        "cachedContentTokenCount": usage.cached_tokens,
    })
}

/// Vertex responses may arrive wrapped as `{"response": {…}}`.
pub fn unwrap_envelope(root: &Value) -> &Value {
    match root.get("response") {
        Some(inner) if inner.is_object() => inner,
        _ => root,
    }
}

/// Vertex request envelope: `{project, model, request: <body>}`.
pub fn wrap_vertex_envelope(project: &str, model: &str, body: Value) -> Value {
    json!({
        "project": project,
        "model": model,
        "request": body,
    })
}

fn thought_signature(part: &Value) -> Option<String> {
    part.get("thoughtSignature")
        .or_else(|| part.get("thought_signature"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

// ── request parsing ──────────────────────────────────────────────────────────

fn parse_request_value(root: &Value) -> Result<UnifiedRequest> {
    let obj = root
        .as_object()
        .ok_or_else(|| GatewayError::Parse("request body is not a JSON object".into()))?;

    // Model arrives in the URL for Gemini; callers that tunnel it in the body
    // (gemini-cli) put it under "model".
    let mut req = UnifiedRequest::new(
        obj.get("model").and_then(Value::as_str).unwrap_or_default(),
    );

    if let Some(si) = obj
        .get("systemInstruction")
        .or_else(|| obj.get("system_instruction"))
    {
        let mut sys = Message::new(Role::System);
        for part in si.get("parts").and_then(Value::as_array).into_iter().flatten() {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                sys.parts.push(ContentPart::text(text));
            }
        }
        if !sys.parts.is_empty() {
            req.messages.push(sys);
        }
    }

    let mut alloc = ToolIdAllocator::new();
    for content in obj
        .get("contents")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::Parse("missing contents".into()))?
    {
        parse_content(content, &mut alloc, &mut req.messages)?;
    }

    for group in obj.get("tools").and_then(Value::as_array).into_iter().flatten() {
        for decl in group
            .get("functionDeclarations")
            .or_else(|| group.get("function_declarations"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            req.tools.push(ToolSpec {
                name: decl
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                description: decl
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                parameters: decl
                    .get("parameters")
                    .or_else(|| decl.get("parametersJsonSchema"))
                    .cloned()
                    .unwrap_or(json!({})),
            });
        }
    }

    if let Some(mode) = root
        .pointer("/toolConfig/functionCallingConfig/mode")
        .and_then(Value::as_str)
    {
        req.tool_choice = Some(match mode {
            "ANY" => ToolChoice::Any,
            "NONE" => ToolChoice::None,
            _ => ToolChoice::Auto,
        });
    }

    if let Some(gc) = obj
        .get("generationConfig")
        .or_else(|| obj.get("generation_config"))
    {
        req.sampling = Sampling {
            temperature: gc.get("temperature").and_then(Value::as_f64),
            top_p: gc.get("topP").and_then(Value::as_f64),
            top_k: gc.get("topK").and_then(Value::as_u64).map(|v| v as u32),
            max_tokens: gc
                .get("maxOutputTokens")
                .and_then(Value::as_u64)
                .map(|v| v as u32),
            stop: gc
                .get("stopSequences")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            frequency_penalty: gc.get("frequencyPenalty").and_then(Value::as_f64),
            presence_penalty: gc.get("presencePenalty").and_then(Value::as_f64),
            logprobs: gc.get("responseLogprobs").and_then(Value::as_bool),
            top_logprobs: gc.get("logprobs").and_then(Value::as_u64).map(|v| v as u32),
            candidate_count: gc
                .get("candidateCount")
                .and_then(Value::as_u64)
                .map(|v| v as u32),
        };
        if let Some(schema) = gc.get("responseSchema") {
            req.response_schema = Some(schema.clone());
        }
        if let Some(tc) = gc.get("thinkingConfig").or_else(|| gc.get("thinking_config")) {
            req.thinking = Some(ThinkingConfig {
                include_thoughts: tc
                    .get("includeThoughts")
                    .or_else(|| tc.get("include_thoughts"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                budget_tokens: tc
                    .get("thinkingBudget")
                    .or_else(|| tc.get("thinking_budget"))
                    .and_then(Value::as_u64)
                    .map(|v| v as u32),
                effort: None,
                summary: None,
            });
        }
    }
    if let Some(safety) = obj.get("safetySettings").or_else(|| obj.get("safety_settings")) {
        req.safety_settings = Some(safety.clone());
    }

    const KNOWN: &[&str] = &[
        "model",
        "contents",
        "systemInstruction",
        "system_instruction",
        "tools",
        "toolConfig",
        "tool_config",
        "generationConfig",
        "generation_config",
        "safetySettings",
        "safety_settings",
    ];
    for (key, value) in obj {
        if !KNOWN.contains(&key.as_str()) {
            req.metadata.insert(format!("gemini.{key}"), value.clone());
        }
    }
    Ok(req)
}

fn parse_content(
    content: &Value,
    alloc: &mut ToolIdAllocator,
    out: &mut Vec<Message>,
) -> Result<()> {
    let role = match content.get("role").and_then(Value::as_str) {
        Some("model") => Role::Assistant,
        _ => Role::User,
    };
    let mut msg = Message::new(role);
    let mut tool_msg = Message::new(Role::Tool);

    for part in content
        .get("parts")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        if let Some(call) = part.get("functionCall").or_else(|| part.get("function_call")) {
            let name = call
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            msg.tool_calls.push(ToolCall {
                id: alloc.assign(&name),
                name,
                arguments: call
                    .get("args")
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "{}".into()),
                thought_signature: thought_signature(part),
            });
            continue;
        }
        if let Some(resp) = part
            .get("functionResponse")
            .or_else(|| part.get("function_response"))
        {
            let name = resp.get("name").and_then(Value::as_str).unwrap_or_default();
            tool_msg.parts.push(ContentPart::ToolResult {
                call_id: alloc.resolve(name),
                text: resp
                    .get("response")
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
                is_error: false,
            });
            continue;
        }
        if let Some(inline) = part.get("inlineData").or_else(|| part.get("inline_data")) {
            msg.parts.push(ContentPart::Image {
                mime: inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .unwrap_or("image/png")
                    .to_string(),
                source: ImageSource::Base64(
                    inline
                        .get("data")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                ),
            });
            continue;
        }
        if let Some(code) = part
            .get("executableCode")
            .or_else(|| part.get("executable_code"))
        {
            msg.parts.push(ContentPart::ExecutableCode {
                language: code
                    .get("language")
                    .and_then(Value::as_str)
                    .unwrap_or("PYTHON")
                    .to_string(),
                code: code
                    .get("code")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
            continue;
        }
        if let Some(result) = part
            .get("codeExecutionResult")
            .or_else(|| part.get("code_execution_result"))
        {
            msg.parts.push(ContentPart::CodeResult {
                outcome: result
                    .get("outcome")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                output: result
                    .get("output")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
            continue;
        }
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            let is_thought = part.get("thought").and_then(Value::as_bool).unwrap_or(false);
            if is_thought {
                msg.parts.push(ContentPart::Reasoning {
                    text: text.to_string(),
                    signature: thought_signature(part),
                });
            } else {
                msg.parts.push(ContentPart::text(text));
            }
        }
    }

    if !tool_msg.parts.is_empty() {
        out.push(tool_msg);
    }
    if !msg.parts.is_empty() || !msg.tool_calls.is_empty() {
        out.push(msg);
    }
    Ok(())
}

// ── request emission ─────────────────────────────────────────────────────────

fn emit_request_value(ir: &UnifiedRequest) -> Result<Value> {
    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();

    for msg in &ir.messages {
        if msg.role == Role::System {
            for part in &msg.parts {
                if let ContentPart::Text { text } = part {
                    system_parts.push(json!({"text": text}));
                }
            }
            continue;
        }

        let wire_role = if msg.role == Role::Assistant {
            "model"
        } else {
            "user"
        };
        let parts = emit_parts(msg, &ir.messages);
        if parts.is_empty() {
            continue;
        }
        // Gemini wants alternating user/model turns; fold repeats together.
        match contents.last_mut() {
            Some(prev) if prev["role"] == wire_role => {
                if let Some(arr) = prev["parts"].as_array_mut() {
                    arr.extend(parts);
                }
            }
            _ => contents.push(json!({"role": wire_role, "parts": parts})),
        }
    }
    reorder_function_responses(&mut contents);

    let mut body = json!({ "contents": contents });
    let obj = body.as_object_mut().expect("body is an object");
    if !system_parts.is_empty() {
        obj.insert(
            "systemInstruction".into(),
            json!({"parts": system_parts}),
        );
    }

    if !ir.tools.is_empty() {
        let decls: Vec<Value> = ir
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": clean_json_schema_for_gemini(&t.parameters),
                })
            })
            .collect();
        obj.insert("tools".into(), json!([{ "functionDeclarations": decls }]));
    }
    if let Some(choice) = &ir.tool_choice {
        let mode = match choice {
            ToolChoice::Auto | ToolChoice::Tool(_) => "AUTO",
            ToolChoice::Any => "ANY",
            ToolChoice::None => "NONE",
        };
        let mut cfg = json!({"mode": mode});
        if let ToolChoice::Tool(name) = choice {
            cfg["allowedFunctionNames"] = json!([name]);
            cfg["mode"] = json!("ANY");
        }
        obj.insert("toolConfig".into(), json!({"functionCallingConfig": cfg}));
    }

    let mut gc = Map::new();
    let s = &ir.sampling;
    if let Some(v) = s.temperature {
        gc.insert("temperature".into(), json!(v));
    }
    if let Some(v) = s.top_p {
        gc.insert("topP".into(), json!(v));
    }
    if let Some(v) = s.top_k {
        gc.insert("topK".into(), json!(v));
    }
    if let Some(v) = s.max_tokens {
        gc.insert("maxOutputTokens".into(), json!(v));
    }
    if !s.stop.is_empty() {
        gc.insert("stopSequences".into(), json!(s.stop));
    }
    if let Some(v) = s.candidate_count {
        gc.insert("candidateCount".into(), json!(v));
    }
    if let Some(schema) = &ir.response_schema {
        gc.insert("responseSchema".into(), schema.clone());
        gc.insert("responseMimeType".into(), json!("application/json"));
    }
    if let Some(thinking) = &ir.thinking {
        let mut tc = json!({"includeThoughts": thinking.include_thoughts});
        if let Some(budget) = thinking.budget_tokens {
            tc["thinkingBudget"] = json!(budget);
        }
        gc.insert("thinkingConfig".into(), tc);
    }
    if !gc.is_empty() {
        obj.insert("generationConfig".into(), Value::Object(gc));
    }
    if let Some(safety) = &ir.safety_settings {
        obj.insert("safetySettings".into(), safety.clone());
    }
    Ok(body)
}

fn emit_parts(msg: &Message, all_messages: &[Message]) -> Vec<Value> {
    let mut parts = Vec::new();
    for part in &msg.parts {
        match part {
            ContentPart::Text { text } => parts.push(json!({"text": text})),
            ContentPart::Reasoning { text, signature } => {
                let mut p = json!({"text": text, "thought": true});
                if let Some(sig) = signature {
                    p["thoughtSignature"] = json!(sig);
                }
                parts.push(p);
            }
            ContentPart::RedactedThinking { data } => {
                parts.push(json!({"data": data}));
            }
            ContentPart::Image { mime, source } => {
                if let ImageSource::Base64(data) = source {
                    parts.push(json!({"inlineData": {"mimeType": mime, "data": data}}));
                }
            }
            ContentPart::ToolResult { call_id, text, .. } => {
                let name = lookup_call_name(call_id, all_messages);
                let response: Value = serde_json::from_str(text)
                    .unwrap_or_else(|_| json!({"result": text}));
                parts.push(json!({
                    "functionResponse": {"name": name, "response": response}
                }));
            }
            ContentPart::ExecutableCode { language, code } => {
                parts.push(json!({"executableCode": {"language": language, "code": code}}));
            }
            ContentPart::CodeResult { outcome, output } => {
                parts.push(json!({
                    "codeExecutionResult": {"outcome": outcome, "output": output}
                }));
            }
            ContentPart::File { .. } => {}
        }
    }
    for call in &msg.tool_calls {
        let args: Value = serde_json::from_str(&call.arguments).unwrap_or(json!({}));
        let mut p = json!({"functionCall": {"name": call.name, "args": args}});
        if let Some(sig) = &call.thought_signature {
            p["thoughtSignature"] = json!(sig);
        }
        parts.push(p);
    }
    parts
}

/// Gemini `functionResponse` parts carry a name, not an id; recover the name
/// from the assistant call with the matching id.
fn lookup_call_name(call_id: &str, messages: &[Message]) -> String {
    messages
        .iter()
        .flat_map(|m| m.tool_calls.iter())
        .find(|c| c.id == call_id)
        .map(|c| c.name.clone())
        .unwrap_or_default()
}

/// Vertex requires each model `functionCall` turn to be answered by a user
/// turn whose `functionResponse` parts appear in call order.
fn reorder_function_responses(contents: &mut [Value]) {
    for i in 0..contents.len().saturating_sub(1) {
        let call_names: Vec<String> = contents[i]
            .get("parts")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|p| p.pointer("/functionCall/name").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        if call_names.is_empty() {
            continue;
        }
        let Some(parts) = contents[i + 1]
            .get_mut("parts")
            .and_then(Value::as_array_mut)
        else {
            continue;
        };
        parts.sort_by_key(|p| {
            p.pointer("/functionResponse/name")
                .and_then(Value::as_str)
                .and_then(|name| call_names.iter().position(|c| c == name))
                .unwrap_or(usize::MAX)
        });
    }
}

// ── response parsing / emission ──────────────────────────────────────────────

fn parse_response_value(root: &Value) -> Result<(Vec<Message>, Usage)> {
    let root = unwrap_envelope(root);
    let candidate = root
        .pointer("/candidates/0")
        .ok_or_else(|| GatewayError::Parse("response has no candidates".into()))?;

    let mut alloc = ToolIdAllocator::new();
    let mut messages = Vec::new();
    if let Some(content) = candidate.get("content") {
        parse_content(
            &with_role(content.clone(), "model"),
            &mut alloc,
            &mut messages,
        )?;
    }
    if messages.is_empty() {
        messages.push(Message::new(Role::Assistant));
    }
    Ok((messages, parse_usage_metadata(root.get("usageMetadata"))))
}

fn with_role(mut content: Value, role: &str) -> Value {
    if content.get("role").is_none() {
        content["role"] = json!(role);
    }
    content
}

fn emit_response_value(messages: &[Message], usage: &Usage, model: &str) -> Result<Value> {
    let assistant = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .ok_or_else(|| GatewayError::Parse("no assistant message to emit".into()))?;

    let parts = emit_parts(assistant, messages);
    Ok(json!({
        "candidates": [{
            "content": {"parts": parts, "role": "model"},
            // Gemini reports STOP for tool-call turns too.
            "finishReason": "STOP",
            "index": 0,
        }],
        "usageMetadata": emit_usage_metadata(usage),
        "modelVersion": model,
    }))
}

// ── chunk parsing ────────────────────────────────────────────────────────────

fn flush_pending_thought(ctx: &mut StreamContext, events: &mut Vec<UnifiedEvent>) {
    if let Some(text) = ctx.gemini_parse.pending_thought.take() {
        events.push(UnifiedEvent::Reasoning {
            text,
            signature: None,
        });
    }
}

fn parse_chunk_value(data: &str, ctx: &mut StreamContext) -> Result<Vec<UnifiedEvent>> {
    let root: Value = serde_json::from_str(data)
        .map_err(|e| GatewayError::Parse(format!("bad stream chunk: {e}")))?;
    let root = unwrap_envelope(&root);
    let mut events = Vec::new();

    if let Some(candidate) = root.pointer("/candidates/0") {
        for part in candidate
            .pointer("/content/parts")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let Some(call) = part.get("functionCall") {
                flush_pending_thought(ctx, &mut events);
                let name = call
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                events.push(UnifiedEvent::ToolCall {
                    call: ToolCall {
                        id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                        name,
                        arguments: call
                            .get("args")
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "{}".into()),
                        thought_signature: thought_signature(part),
                    },
                });
                continue;
            }
            if let Some(inline) = part.get("inlineData") {
                flush_pending_thought(ctx, &mut events);
                events.push(UnifiedEvent::Image {
                    mime: inline
                        .get("mimeType")
                        .and_then(Value::as_str)
                        .unwrap_or("image/png")
                        .to_string(),
                    data: inline
                        .get("data")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
                continue;
            }
            if let Some(code) = part.get("executableCode") {
                flush_pending_thought(ctx, &mut events);
                events.push(UnifiedEvent::CodeExecution {
                    language: code
                        .get("language")
                        .and_then(Value::as_str)
                        .unwrap_or("PYTHON")
                        .to_string(),
                    code: code
                        .get("code")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    output: None,
                });
                continue;
            }
            if let Some(result) = part.get("codeExecutionResult") {
                flush_pending_thought(ctx, &mut events);
                events.push(UnifiedEvent::CodeExecution {
                    language: String::new(),
                    code: String::new(),
                    output: result
                        .get("output")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                });
                continue;
            }
            let Some(text) = part.get("text").and_then(Value::as_str) else {
                continue;
            };
            let is_thought = part.get("thought").and_then(Value::as_bool).unwrap_or(false);
            if !is_thought {
                flush_pending_thought(ctx, &mut events);
                events.push(UnifiedEvent::Token {
                    text: text.to_string(),
                });
                continue;
            }
            match thought_signature(part) {
                Some(sig) => {
                    // Signature closes the pending thought (possibly empty).
                    let pending = ctx.gemini_parse.pending_thought.take().unwrap_or_default();
                    events.push(UnifiedEvent::Reasoning {
                        text: format!("{pending}{text}"),
                        signature: Some(sig),
                    });
                }
                None => {
                    flush_pending_thought(ctx, &mut events);
                    ctx.gemini_parse.pending_thought = Some(text.to_string());
                }
            }
        }

        if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
            flush_pending_thought(ctx, &mut events);
            ctx.usage
                .merge(&parse_usage_metadata(root.get("usageMetadata")));
            events.push(UnifiedEvent::Finish {
                reason: finish_from_wire(reason),
                usage: (!ctx.usage.is_empty()).then_some(ctx.usage),
            });
            return Ok(events);
        }
    }

    if let Some(err) = root.get("error") {
        events.push(UnifiedEvent::Error {
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("upstream error")
                .to_string(),
        });
    }
    ctx.usage
        .merge(&parse_usage_metadata(root.get("usageMetadata")));
    Ok(events)
}

// ── chunk emission (delay-one) ───────────────────────────────────────────────

fn content_chunk(parts: Vec<Value>, model: &str) -> Value {
    json!({
        "candidates": [{
            "content": {"parts": parts, "role": "model"},
            "index": 0,
        }],
        "modelVersion": model,
    })
}

/// Hold the new chunk, release the previously held one.
fn rotate_held(ctx: &mut StreamContext, chunk: Value) -> Vec<String> {
    let released = ctx
        .gemini_emit
        .held
        .replace(chunk)
        .map(|held| sse::data_frame(&held.to_string()));
    released.into_iter().collect()
}

fn emit_chunk_value(event: &UnifiedEvent, ctx: &mut StreamContext) -> Result<Vec<String>> {
    let model = ctx.model.clone();
    match event {
        UnifiedEvent::StreamMeta { .. } => Ok(Vec::new()),
        UnifiedEvent::Token { text } => {
            let chunk = content_chunk(vec![json!({"text": text})], &model);
            Ok(rotate_held(ctx, chunk))
        }
        UnifiedEvent::Reasoning { text, signature } => {
            let mut part = json!({"text": text, "thought": true});
            if let Some(sig) = signature {
                part["thoughtSignature"] = json!(sig);
            }
            Ok(rotate_held(ctx, content_chunk(vec![part], &model)))
        }
        UnifiedEvent::ReasoningSummary { text } => {
            let part = json!({"text": text, "thought": true});
            Ok(rotate_held(ctx, content_chunk(vec![part], &model)))
        }
        UnifiedEvent::ToolCall { call } => {
            let args: Value = serde_json::from_str(&call.arguments).unwrap_or(json!({}));
            let mut part = json!({"functionCall": {"name": call.name, "args": args}});
            if let Some(sig) = &call.thought_signature {
                part["thoughtSignature"] = json!(sig);
            }
            Ok(rotate_held(ctx, content_chunk(vec![part], &model)))
        }
        UnifiedEvent::ToolCallDelta {
            index,
            name,
            arguments_delta,
            ..
        } => {
            // Accumulate; whole functionCall parts go out at finish time.
            let entry = ctx.gemini_emit.pending_calls.entry(*index).or_default();
            if let Some(name) = name {
                entry.name = name.clone();
            }
            entry.arguments.push_str(arguments_delta);
            Ok(Vec::new())
        }
        UnifiedEvent::Image { mime, data } => {
            let part = json!({"inlineData": {"mimeType": mime, "data": data}});
            Ok(rotate_held(ctx, content_chunk(vec![part], &model)))
        }
        UnifiedEvent::CodeExecution {
            language,
            code,
            output,
        } => {
            let part = match output {
                Some(out) => json!({
                    "codeExecutionResult": {"outcome": "OUTCOME_OK", "output": out}
                }),
                None => json!({"executableCode": {"language": language, "code": code}}),
            };
            Ok(rotate_held(ctx, content_chunk(vec![part], &model)))
        }
        UnifiedEvent::Error { message } => {
            let mut frames: Vec<String> = ctx
                .gemini_emit
                .held
                .take()
                .map(|held| sse::data_frame(&held.to_string()))
                .into_iter()
                .collect();
            let chunk = json!({"error": {"code": 502, "message": message, "status": "UNAVAILABLE"}});
            frames.push(sse::data_frame(&chunk.to_string()));
            Ok(frames)
        }
        UnifiedEvent::Finish { reason, usage } => {
            let mut frames = Vec::new();

            // Completed tool calls accumulated from deltas go out first.
            let pending: Vec<PendingCall> =
                ctx.gemini_emit.pending_calls.values().cloned().collect();
            ctx.gemini_emit.pending_calls.clear();
            for call in pending {
                let args: Value = serde_json::from_str(&call.arguments).unwrap_or(json!({}));
                let chunk = content_chunk(
                    vec![json!({"functionCall": {"name": call.name, "args": args}})],
                    &model,
                );
                frames.extend(rotate_held(ctx, chunk));
            }

            // Merge finish metadata into the held chunk; synthesize an empty
            // text chunk when nothing was held (finish must not be dropped).
            let mut held = ctx.gemini_emit.held.take().unwrap_or_else(|| {
                content_chunk(vec![json!({"text": ""})], &model)
            });
            held["candidates"][0]["finishReason"] = json!(finish_to_wire(*reason));
            let usage = usage.unwrap_or(ctx.usage);
            held["usageMetadata"] = emit_usage_metadata(&usage);
            frames.push(sse::data_frame(&held.to_string()));
            Ok(frames)
        }
    }
}

// ── trait wiring ─────────────────────────────────────────────────────────────

impl FormatParser for GeminiFormat {
    fn format(&self) -> Format {
        if self.cli {
            Format::GeminiCli
        } else {
            Format::Gemini
        }
    }

    fn parse_request(&self, raw: &[u8]) -> Result<UnifiedRequest> {
        let root: Value = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::Parse(format!("bad request JSON: {e}")))?;
        // gemini-cli tunnels the body inside the Vertex request envelope.
        let body = match root.get("request") {
            Some(inner) if inner.is_object() => inner,
            _ => &root,
        };
        let mut req = parse_request_value(body)?;
        if req.model.is_empty() {
            if let Some(model) = root.get("model").and_then(Value::as_str) {
                req.model = model.to_string();
            }
        }
        Ok(req)
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
        let mut events = Vec::new();
        flush_pending_thought(ctx, &mut events);
        events
    }
}

impl FormatEmitter for GeminiFormat {
    fn format(&self) -> Format {
        if self.cli {
            Format::GeminiCli
        } else {
            Format::Gemini
        }
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

    fn flush(&self, ctx: &mut StreamContext) -> Result<Vec<String>> {
        // A held chunk only survives to flush when the pipeline never saw a
        // finish; release it so no content is dropped.
        Ok(ctx
            .gemini_emit
            .held
            .take()
            .map(|held| sse::data_frame(&held.to_string()))
            .into_iter()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contents_round_trip_with_function_calls() {
        let raw = json!({
            "contents": [
                {"role": "user", "parts": [{"text": "weather?"}]},
                {"role": "model", "parts": [
                    {"functionCall": {"name": "get_weather", "args": {"city": "Oslo"}},
                     "thoughtSignature": "sig-9"},
                ]},
                {"role": "user", "parts": [
                    {"functionResponse": {"name": "get_weather", "response": {"temp": 3}}},
                ]},
            ],
            "generationConfig": {"maxOutputTokens": 100, "thinkingConfig": {"includeThoughts": true, "thinkingBudget": 512}},
        });
        let req = parse_request_value(&raw).unwrap();
        assert_eq!(req.messages.len(), 3);
        let call = &req.messages[1].tool_calls[0];
        assert!(call.id.starts_with("call_"));
        assert_eq!(call.thought_signature.as_deref(), Some("sig-9"));
        // The functionResponse resolved to the same id FIFO.
        match &req.messages[2].parts[0] {
            ContentPart::ToolResult { call_id, .. } => assert_eq!(call_id, &call.id),
            other => panic!("unexpected part {other:?}"),
        }
        assert_eq!(req.thinking.as_ref().unwrap().budget_tokens, Some(512));

        let wire = emit_request_value(&req).unwrap();
        assert_eq!(
            wire["contents"][1]["parts"][0]["functionCall"]["name"],
            "get_weather"
        );
        assert_eq!(wire["contents"][1]["parts"][0]["thoughtSignature"], "sig-9");
        assert_eq!(
            wire["contents"][2]["parts"][0]["functionResponse"]["name"],
            "get_weather"
        );
    }

    #[test]
    fn consecutive_same_role_messages_merge() {
        let mut req = UnifiedRequest::new("m");
        req.messages.push(Message::text(Role::User, "one"));
        req.messages.push(Message::text(Role::User, "two"));
        let wire = emit_request_value(&req).unwrap();
        let contents = wire["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["parts"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn tool_schemas_are_scrubbed() {
        let mut req = UnifiedRequest::new("m");
        req.messages.push(Message::text(Role::User, "x"));
        req.tools.push(ToolSpec {
            name: "f".into(),
            description: String::new(),
            parameters: json!({"type": "object", "properties": {"n": {"type": "integer", "minimum": 1}}}),
        });
        let wire = emit_request_value(&req).unwrap();
        let params = &wire["tools"][0]["functionDeclarations"][0]["parameters"];
        assert!(params["properties"]["n"].get("minimum").is_none());
    }

    #[test]
    fn envelope_unwraps_for_responses() {
        let wrapped = json!({"response": {
            "candidates": [{"content": {"parts": [{"text": "hi"}]}}],
            "usageMetadata": {"promptTokenCount": 2, "candidatesTokenCount": 1},
        }});
        let (messages, usage) = parse_response_value(&wrapped).unwrap();
        assert_eq!(messages[0].joined_text(), "hi");
        assert_eq!(usage.prompt_tokens, 2);
    }

    #[test]
    fn pending_thought_pairs_with_later_signature() {
        let fmt = GeminiFormat { cli: false };
        let mut ctx = StreamContext::new("m", "id");
        let ev = fmt
            .parse_chunk(
                r#"{"candidates":[{"content":{"parts":[{"text":"think…","thought":true}]}}]}"#,
                &mut ctx,
            )
            .unwrap();
        assert!(ev.is_empty(), "thought is held pending a signature");
        let ev = fmt
            .parse_chunk(
                r#"{"candidates":[{"content":{"parts":[{"text":"","thought":true,"thoughtSignature":"s1"}]}}]}"#,
                &mut ctx,
            )
            .unwrap();
        assert_eq!(
            ev,
            vec![UnifiedEvent::Reasoning {
                text: "think…".into(),
                signature: Some("s1".into()),
            }]
        );
    }

    #[test]
    fn pending_thought_flushes_on_plain_text() {
        let fmt = GeminiFormat { cli: false };
        let mut ctx = StreamContext::new("m", "id");
        fmt.parse_chunk(
            r#"{"candidates":[{"content":{"parts":[{"text":"t","thought":true}]}}]}"#,
            &mut ctx,
        )
        .unwrap();
        let ev = fmt
            .parse_chunk(
                r#"{"candidates":[{"content":{"parts":[{"text":"answer"}]}}]}"#,
                &mut ctx,
            )
            .unwrap();
        assert_eq!(
            ev,
            vec![
                UnifiedEvent::Reasoning {
                    text: "t".into(),
                    signature: None,
                },
                UnifiedEvent::Token {
                    text: "answer".into(),
                },
            ]
        );
    }

    #[test]
    fn delay_one_merges_finish_into_last_content() {
        let mut ctx = StreamContext::new("m", "id");
        // First content chunk is held, nothing released.
        let frames =
            emit_chunk_value(&UnifiedEvent::Token { text: "hi".into() }, &mut ctx).unwrap();
        assert!(frames.is_empty());
        // Finish merges into the held chunk.
        let frames = emit_chunk_value(
            &UnifiedEvent::Finish {
                reason: FinishReason::Stop,
                usage: Some(Usage {
                    prompt_tokens: 4,
                    completion_tokens: 2,
                    ..Default::default()
                }),
            },
            &mut ctx,
        )
        .unwrap();
        assert_eq!(frames.len(), 1);
        let body: Value =
            serde_json::from_str(frames[0].trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(body["candidates"][0]["content"]["parts"][0]["text"], "hi");
        assert_eq!(body["candidates"][0]["finishReason"], "STOP");
        assert_eq!(body["usageMetadata"]["promptTokenCount"], 4);
    }

    #[test]
    fn finish_without_content_emits_empty_text_chunk() {
        let mut ctx = StreamContext::new("m", "id");
        let frames = emit_chunk_value(
            &UnifiedEvent::Finish {
                reason: FinishReason::Stop,
                usage: None,
            },
            &mut ctx,
        )
        .unwrap();
        let body: Value =
            serde_json::from_str(frames[0].trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(body["candidates"][0]["content"]["parts"][0]["text"], "");
        assert_eq!(body["candidates"][0]["finishReason"], "STOP");
    }

    #[test]
    fn reorder_places_responses_in_call_order() {
        let mut contents = vec![
            json!({"role": "model", "parts": [
                {"functionCall": {"name": "a", "args": {}}},
                {"functionCall": {"name": "b", "args": {}}},
            ]}),
            json!({"role": "user", "parts": [
                {"functionResponse": {"name": "b", "response": {}}},
                {"functionResponse": {"name": "a", "response": {}}},
            ]}),
        ];
        reorder_function_responses(&mut contents);
        assert_eq!(
            contents[1]["parts"][0]["functionResponse"]["name"],
            "a"
        );
    }
}
