//! The per-request stream translation pipeline.
//!
//! One `StreamTranslator` is instantiated per streamed request. Upstream data
//! payloads go in, translated wire frames come out. Between the two sits a
//! small preprocess step: it guarantees a head `stream-meta` event, tracks
//! tool-call presence, deduplicates `finish`, and backfills thought-token
//! counts for providers that never report them.

use serde_json::Value;
use uuid::Uuid;

use hydra_core::Result;
use hydra_protocol::{FinishReason, UnifiedEvent, UnifiedRequest};

use crate::context::StreamContext;
use crate::registry::{emitter_for, parser_for, Format, FormatEmitter, FormatParser};
use crate::schema::ToolMaps;

pub struct StreamTranslator {
    parser: &'static dyn FormatParser,
    emitter: &'static dyn FormatEmitter,
    from: Format,
    to: Format,
    /// Same wire family on both sides: forward chunks as-is (modulo the
    /// Gemini envelope) instead of translating through the IR.
    passthrough: bool,
    ctx: StreamContext,
    meta_sent: bool,
    finished: bool,
}

impl StreamTranslator {
    pub fn new(from: Format, to: Format, model: &str, request: Option<&UnifiedRequest>) -> Self {
        let mut ctx = StreamContext::new(model, Uuid::new_v4().simple().to_string());
        if let Some(req) = request {
            ctx.estimated_input_tokens = Some(req.estimate_input_tokens());
            ctx.tool_maps = ToolMaps::build(&req.tools, &req.messages);
        }
        Self {
            parser: parser_for(from),
            emitter: emitter_for(to),
            from,
            to,
            passthrough: from.is_passthrough_to(to),
            ctx,
            meta_sent: false,
            finished: false,
        }
    }

    pub fn context_mut(&mut self) -> &mut StreamContext {
        &mut self.ctx
    }

    /// Has a finish event been emitted to the client yet?
    pub fn finish_seen(&self) -> bool {
        self.ctx.finish_sent
    }

    /// Best usage observed so far (complete once the stream finished).
    pub fn usage(&self) -> hydra_protocol::Usage {
        self.ctx.usage
    }

    /// Feed one upstream data payload (SSE `data:` value or NDJSON line).
    pub fn push_chunk(&mut self, data: &str) -> Result<Vec<String>> {
        if self.finished {
            return Ok(Vec::new());
        }
        if self.passthrough {
            return self.forward_chunk(data);
        }
        let events = self.parser.parse_chunk(data, &mut self.ctx)?;
        self.process_events(events)
    }

    /// Passthrough forwarding: reframe the payload for the client side,
    /// unwrap the Vertex envelope within the Gemini family, and watch for
    /// the format's own terminal marker.
    fn forward_chunk(&mut self, data: &str) -> Result<Vec<String>> {
        let payload: Value = serde_json::from_str(data)
            .map_err(|e| hydra_core::GatewayError::Parse(format!("bad stream chunk: {e}")))?;

        let (payload, family) = match self.from.family() {
            "gemini" => {
                let inner = match payload.get("response") {
                    Some(inner) if inner.is_object() => inner.clone(),
                    _ => payload,
                };
                if inner.pointer("/candidates/0/finishReason").is_some() {
                    self.ctx.finish_sent = true;
                }
                (inner, "gemini")
            }
            family => {
                match family {
                    "claude"
                        if payload.get("type").and_then(Value::as_str)
                            == Some("message_stop") =>
                    {
                        self.ctx.finish_sent = true;
                    }
                    "ollama" if payload.get("done") == Some(&Value::Bool(true)) => {
                        self.ctx.finish_sent = true;
                    }
                    "responses"
                        if payload
                            .get("type")
                            .and_then(Value::as_str)
                            .is_some_and(|t| t.ends_with(".completed")) =>
                    {
                        self.ctx.finish_sent = true;
                    }
                    _ => {}
                }
                (payload, family)
            }
        };

        let frame = match family {
            // Claude clients expect the `event:` line restored from the type.
            "claude" => {
                let event = payload
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("message_delta")
                    .to_string();
                crate::sse::event_frame(&event, &payload.to_string())
            }
            "responses" => {
                let event = payload
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("response.output_text.delta")
                    .to_string();
                crate::sse::event_frame(&event, &payload.to_string())
            }
            "ollama" => format!("{payload}\n"),
            _ => crate::sse::data_frame(&payload.to_string()),
        };
        Ok(vec![frame])
    }

    /// Terminal signal: EOF, `[DONE]`, or cancellation. Flushes parser state,
    /// guarantees exactly one finish event, releases buffered output.
    pub fn finish(&mut self) -> Result<Vec<String>> {
        if self.finished {
            return Ok(Vec::new());
        }
        self.finished = true;

        if self.passthrough {
            // OpenAI-family clients still expect the terminator we consumed.
            if matches!(self.to.family(), "openai" | "cline") {
                self.ctx.finish_sent = true;
                return Ok(vec![crate::sse::done_frame()]);
            }
            return Ok(Vec::new());
        }

        let trailing = self.parser.finalize(&mut self.ctx);
        let mut frames = self.process_events(trailing)?;

        if !self.ctx.finish_sent {
            let reason = self.ctx.pending_finish.take().unwrap_or(FinishReason::Stop);
            let usage = (!self.ctx.usage.is_empty()).then_some(self.ctx.usage);
            frames.extend(self.process_events(vec![UnifiedEvent::Finish { reason, usage }])?);
        }
        frames.extend(self.emitter.flush(&mut self.ctx)?);
        Ok(frames)
    }

    /// Surface an upstream failure to the client mid-stream.
    pub fn push_error(&mut self, message: &str) -> Result<Vec<String>> {
        self.process_events(vec![UnifiedEvent::Error {
            message: message.to_string(),
        }])
    }

    fn process_events(&mut self, events: Vec<UnifiedEvent>) -> Result<Vec<String>> {
        let mut frames = Vec::new();
        for event in events {
            // The head chunk goes out before anything else, synthesized when
            // the upstream format has no equivalent of its own.
            if !self.meta_sent && !matches!(event, UnifiedEvent::StreamMeta { .. }) {
                let meta = UnifiedEvent::StreamMeta {
                    message_id: self.ctx.message_id.clone(),
                    model: self.ctx.model.clone(),
                    estimated_input_tokens: self.ctx.estimated_input_tokens,
                };
                self.meta_sent = true;
                frames.extend(self.emitter.emit_chunk(&meta, &mut self.ctx)?);
            }
            let Some(event) = self.preprocess(event) else {
                continue;
            };
            frames.extend(self.emitter.emit_chunk(&event, &mut self.ctx)?);
        }
        Ok(frames)
    }

    fn preprocess(&mut self, event: UnifiedEvent) -> Option<UnifiedEvent> {
        match event {
            UnifiedEvent::StreamMeta {
                message_id,
                model,
                estimated_input_tokens,
            } => {
                if self.meta_sent {
                    return None;
                }
                self.meta_sent = true;
                Some(UnifiedEvent::StreamMeta {
                    message_id,
                    model,
                    estimated_input_tokens: estimated_input_tokens
                        .or(self.ctx.estimated_input_tokens),
                })
            }
            UnifiedEvent::Reasoning { text, signature } => {
                self.ctx.reasoning_chars += text.len();
                Some(UnifiedEvent::Reasoning { text, signature })
            }
            UnifiedEvent::ReasoningSummary { text } => {
                self.ctx.reasoning_chars += text.len();
                Some(UnifiedEvent::ReasoningSummary { text })
            }
            UnifiedEvent::ToolCall { call } => {
                self.ctx.has_tool_calls = true;
                Some(UnifiedEvent::ToolCall { call })
            }
            UnifiedEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments_delta,
            } => {
                self.ctx.has_tool_calls = true;
                Some(UnifiedEvent::ToolCallDelta {
                    index,
                    id,
                    name,
                    arguments_delta,
                })
            }
            UnifiedEvent::Finish { reason, usage } => {
                if self.ctx.finish_sent {
                    return None;
                }
                self.ctx.finish_sent = true;

                // A turn that produced tool calls finishes as tool_calls even
                // when the upstream reports a generic stop.
                let reason = if self.ctx.has_tool_calls
                    && matches!(reason, FinishReason::Stop | FinishReason::Unknown)
                {
                    FinishReason::ToolCalls
                } else {
                    reason
                };

                let mut usage = usage.unwrap_or(self.ctx.usage);
                usage.merge(&self.ctx.usage);
                // Providers that stream reasoning without accounting for it
                // get a rough chars/3 estimate.
                if usage.thoughts_tokens == 0 && self.ctx.reasoning_chars > 0 {
                    usage.thoughts_tokens = (self.ctx.reasoning_chars / 3) as u64;
                }
                self.ctx.usage = usage;
                Some(UnifiedEvent::Finish {
                    reason,
                    usage: (!usage.is_empty()).then_some(usage),
                })
            }
            other => Some(other),
        }
    }
}

/// Translate a complete non-streaming response body between two formats.
/// Same-family pairs pass through untouched (modulo the Gemini envelope,
/// which the caller unwraps).
pub fn translate_response(
    from: Format,
    to: Format,
    raw: &[u8],
    model: &str,
) -> Result<Vec<u8>> {
    if from.is_passthrough_to(to) {
        return Ok(raw.to_vec());
    }
    let (messages, usage) = parser_for(from).parse_response(raw)?;
    let body = emitter_for(to).emit_response(&messages, &usage, model)?;
    Ok(serde_json::to_vec(&body).expect("serializable body"))
}

/// Translate a request body between two formats via the IR.
pub fn translate_request(from: Format, to: Format, raw: &[u8]) -> Result<Value> {
    let ir = parser_for(from).parse_request(raw)?;
    emitter_for(to).emit_request(&ir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data_payloads(frames: &[String]) -> Vec<Value> {
        frames
            .iter()
            .flat_map(|f| f.lines())
            .filter_map(|l| l.strip_prefix("data: "))
            .filter(|d| *d != "[DONE]")
            .map(|d| serde_json::from_str(d).unwrap())
            .collect()
    }

    /// OpenAI client ← Claude upstream, streaming: "he"/"llo" then stop.
    #[test]
    fn claude_upstream_to_openai_client() {
        let mut tr = StreamTranslator::new(Format::Claude, Format::OpenAi, "claude-sonnet-x", None);

        let mut frames = Vec::new();
        for chunk in [
            r#"{"type":"message_start","message":{"id":"msg_1","model":"claude-sonnet-x","usage":{"input_tokens":3}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"he"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"llo"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}}"#,
            r#"{"type":"message_stop"}"#,
        ] {
            frames.extend(tr.push_chunk(chunk).unwrap());
        }
        frames.extend(tr.finish().unwrap());

        let bodies = data_payloads(&frames);
        assert_eq!(bodies[0]["choices"][0]["delta"]["content"], "he");
        assert_eq!(bodies[0]["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(bodies[1]["choices"][0]["delta"]["content"], "llo");
        let finish = bodies
            .iter()
            .find(|b| b["choices"][0]["finish_reason"] == "stop")
            .expect("finish chunk present");
        assert_eq!(finish["usage"]["prompt_tokens"], 3);
        assert!(frames.last().unwrap().contains("[DONE]"));
    }

    /// Gemini upstream → Claude client: text, tool call, blocks in order.
    #[test]
    fn gemini_upstream_to_claude_client() {
        let mut tr = StreamTranslator::new(Format::Gemini, Format::Claude, "gemini-2.5-pro", None);

        let mut frames = Vec::new();
        frames.extend(
            tr.push_chunk(r#"{"candidates":[{"content":{"parts":[{"text":"hi"}]}}]}"#)
                .unwrap(),
        );
        frames.extend(
            tr.push_chunk(
                r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"f","args":{"x":1}}}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":2,"candidatesTokenCount":5}}"#,
            )
            .unwrap(),
        );
        frames.extend(tr.finish().unwrap());
        let joined = frames.join("");

        assert!(joined.contains("message_start"));
        assert!(joined.contains("text_delta"));
        assert!(joined.contains("tool_use"));
        // Tool calls force the stop reason even though Gemini said STOP.
        assert!(joined.contains("\"stop_reason\":\"tool_use\""));
        assert!(joined.contains("message_stop"));
    }

    /// Exactly one finish even when the upstream never sends a terminal chunk.
    #[test]
    fn eof_synthesizes_single_finish() {
        let mut tr = StreamTranslator::new(Format::Cline, Format::OpenAi, "m", None);
        let mut frames = tr
            .push_chunk(r#"{"choices":[{"delta":{"content":"partial"}}]}"#)
            .unwrap();
        frames.extend(tr.finish().unwrap());
        // A second finish() is a no-op.
        assert!(tr.finish().unwrap().is_empty());

        let bodies = data_payloads(&frames);
        let finishes: Vec<_> = bodies
            .iter()
            .filter(|b| {
                b.pointer("/choices/0/finish_reason")
                    .map(|f| !f.is_null())
                    .unwrap_or(false)
            })
            .collect();
        assert_eq!(finishes.len(), 1);
    }

    /// Thoughts-token backfill: chars/3 when the provider reported none.
    #[test]
    fn reasoning_tokens_are_estimated() {
        let mut tr = StreamTranslator::new(Format::Claude, Format::OpenAi, "m", None);
        tr.push_chunk(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking"}}"#,
        )
        .unwrap();
        tr.push_chunk(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"abcdefghij"}}"#,
        )
        .unwrap();
        let frames = tr.finish().unwrap();
        let bodies = data_payloads(&frames);
        let finish = bodies
            .iter()
            .find(|b| b.get("usage").is_some())
            .expect("finish with usage");
        assert_eq!(
            finish["usage"]["completion_tokens_details"]["reasoning_tokens"],
            3
        );
    }

    #[test]
    fn same_family_response_passthrough_is_byte_exact() {
        let raw = br#"{"id":"x","choices":[{"message":{"role":"assistant","content":"ok"}}]}"#;
        let out = translate_response(Format::OpenAi, Format::OpenAi, raw, "m").unwrap();
        assert_eq!(out, raw.to_vec());
    }

    #[test]
    fn same_family_stream_passthrough_forwards_chunks() {
        let mut tr = StreamTranslator::new(Format::OpenAi, Format::OpenAi, "m", None);
        let frames = tr
            .push_chunk(r#"{"choices":[{"delta":{"content":"hi"}}]}"#)
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].starts_with("data: "));
        let body: Value =
            serde_json::from_str(frames[0].trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(body["choices"][0]["delta"]["content"], "hi");
        // The consumed [DONE] terminator is restored at finish.
        let frames = tr.finish().unwrap();
        assert_eq!(frames, vec!["data: [DONE]\n\n".to_string()]);
    }

    #[test]
    fn gemini_family_passthrough_unwraps_envelope() {
        let mut tr = StreamTranslator::new(Format::GeminiCli, Format::Gemini, "m", None);
        let frames = tr
            .push_chunk(
                r#"{"response":{"candidates":[{"content":{"parts":[{"text":"x"}]},"finishReason":"STOP"}]}}"#,
            )
            .unwrap();
        let body: Value =
            serde_json::from_str(frames[0].trim_start_matches("data: ").trim()).unwrap();
        assert!(body.get("response").is_none(), "envelope unwrapped");
        assert_eq!(body["candidates"][0]["finishReason"], "STOP");
        assert!(tr.finish_seen());
    }

    #[test]
    fn request_translates_openai_to_claude() {
        let raw = json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "system", "content": "terse"},
                {"role": "user", "content": "hello"},
            ],
            "max_tokens": 64,
        });
        let body =
            translate_request(Format::OpenAi, Format::Claude, raw.to_string().as_bytes()).unwrap();
        assert_eq!(body["system"], "terse");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["max_tokens"], 64);
    }

    /// Tool-call id round trip across the IR (claude → openai → claude).
    #[test]
    fn tool_ids_round_trip_through_formats() {
        let claude_req = json!({
            "model": "m",
            "max_tokens": 5,
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_abc", "name": "f", "input": {}},
                ]},
            ],
        });
        let openai_body = translate_request(
            Format::Claude,
            Format::OpenAi,
            claude_req.to_string().as_bytes(),
        )
        .unwrap();
        assert_eq!(
            openai_body["messages"][0]["tool_calls"][0]["id"],
            "call_abc"
        );

        let claude_body = translate_request(
            Format::OpenAi,
            Format::Claude,
            openai_body.to_string().as_bytes(),
        )
        .unwrap();
        assert_eq!(claude_body["messages"][0]["content"][0]["id"], "toolu_abc");
    }
}
