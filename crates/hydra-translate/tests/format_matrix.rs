//! Cross-format properties that must hold over the whole translation matrix:
//! tool-call ids return to their native prefix, thought signatures survive
//! round trips, and responses translate without losing content.

use serde_json::{json, Value};

use hydra_protocol::{ContentPart, Message, Role, ToolCall, UnifiedRequest, Usage};
use hydra_translate::{emitter_for, parser_for, Format};

const ALL_FORMATS: &[Format] = &[
    Format::OpenAi,
    Format::Responses,
    Format::Claude,
    Format::Gemini,
    Format::Ollama,
    Format::Cline,
];

/// Formats whose request dialect can carry a reasoning signature.
const SIGNATURE_FORMATS: &[Format] = &[Format::Claude, Format::Gemini, Format::Responses];

fn ir_with_signature() -> UnifiedRequest {
    let mut req = UnifiedRequest::new("test-model");
    req.messages.push(Message::text(Role::User, "question"));
    let mut assistant = Message::new(Role::Assistant);
    assistant.parts.push(ContentPart::Reasoning {
        text: "thinking it through".into(),
        signature: Some("sig-roundtrip-1".into()),
    });
    assistant.parts.push(ContentPart::text("answer"));
    req.messages.push(assistant);
    req.sampling.max_tokens = Some(128);
    req
}

fn find_signature(req: &UnifiedRequest) -> Option<String> {
    req.messages
        .iter()
        .flat_map(|m| m.parts.iter())
        .find_map(|p| match p {
            ContentPart::Reasoning { signature, .. } => signature.clone(),
            _ => None,
        })
        .or_else(|| {
            req.messages
                .iter()
                .flat_map(|m| m.tool_calls.iter())
                .find_map(|c| c.thought_signature.clone())
        })
}

#[test]
fn thought_signatures_survive_emit_parse_round_trip() {
    for &format in SIGNATURE_FORMATS {
        let original = ir_with_signature();
        let wire = emitter_for(format).emit_request(&original).unwrap();
        let reparsed = parser_for(format)
            .parse_request(wire.to_string().as_bytes())
            .unwrap();
        assert_eq!(
            find_signature(&reparsed).as_deref(),
            Some("sig-roundtrip-1"),
            "signature lost through {format:?}"
        );
    }
}

fn ir_with_tool_call() -> UnifiedRequest {
    let mut req = UnifiedRequest::new("test-model");
    req.messages.push(Message::text(Role::User, "do it"));
    let mut assistant = Message::new(Role::Assistant);
    assistant.tool_calls.push(ToolCall {
        id: "call_fixed".into(),
        name: "do_thing".into(),
        arguments: r#"{"arg":1}"#.into(),
        thought_signature: None,
    });
    req.messages.push(assistant);
    let mut tool = Message::new(Role::Tool);
    tool.parts.push(ContentPart::ToolResult {
        call_id: "call_fixed".into(),
        text: "done".into(),
        is_error: false,
    });
    req.messages.push(tool);
    req.sampling.max_tokens = Some(64);
    req
}

/// Emitted tool ids carry the format's prefix; reparsing restores the
/// canonical id so results still pair with their calls.
#[test]
fn tool_ids_keep_native_prefix_per_format() {
    let ir = ir_with_tool_call();

    let claude_wire = emitter_for(Format::Claude).emit_request(&ir).unwrap();
    assert_eq!(
        claude_wire["messages"][1]["content"][0]["id"],
        "toolu_fixed"
    );
    let openai_wire = emitter_for(Format::OpenAi).emit_request(&ir).unwrap();
    assert_eq!(
        openai_wire["messages"][1]["tool_calls"][0]["id"],
        "call_fixed"
    );
    let responses_wire = emitter_for(Format::Responses).emit_request(&ir).unwrap();
    let call_item = responses_wire["input"]
        .as_array()
        .unwrap()
        .iter()
        .find(|i| i["type"] == "function_call")
        .unwrap();
    assert_eq!(call_item["call_id"], "call_fixed");
}

#[test]
fn tool_pairing_survives_every_format_round_trip() {
    for &format in ALL_FORMATS {
        let ir = ir_with_tool_call();
        let wire = emitter_for(format).emit_request(&ir).unwrap();
        let reparsed = parser_for(format)
            .parse_request(wire.to_string().as_bytes())
            .unwrap();

        let call_id = reparsed
            .messages
            .iter()
            .flat_map(|m| m.tool_calls.iter())
            .map(|c| c.id.clone())
            .next()
            .unwrap_or_else(|| panic!("{format:?} dropped the tool call"));
        let result_id = reparsed
            .messages
            .iter()
            .flat_map(|m| m.parts.iter())
            .find_map(|p| match p {
                ContentPart::ToolResult { call_id, .. } => Some(call_id.clone()),
                _ => None,
            })
            .unwrap_or_else(|| panic!("{format:?} dropped the tool result"));

        assert!(
            call_id.starts_with("call_"),
            "{format:?} id not canonical: {call_id}"
        );
        assert_eq!(call_id, result_id, "{format:?} broke call/result pairing");
    }
}

/// A response emitted in any format parses back with the same visible text
/// and usage totals.
#[test]
fn response_bodies_round_trip_content_and_usage() {
    let mut assistant = Message::new(Role::Assistant);
    assistant.parts.push(ContentPart::text("the answer is 42"));
    let messages = vec![assistant];
    let usage = Usage {
        prompt_tokens: 11,
        completion_tokens: 4,
        ..Default::default()
    }
    .with_total();

    for &format in ALL_FORMATS {
        let wire = emitter_for(format)
            .emit_response(&messages, &usage, "test-model")
            .unwrap();
        let (reparsed, reparsed_usage) = parser_for(format)
            .parse_response(wire.to_string().as_bytes())
            .unwrap();
        let text: String = reparsed
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .map(Message::joined_text)
            .collect();
        assert_eq!(text, "the answer is 42", "{format:?} mangled the text");
        assert_eq!(
            reparsed_usage.prompt_tokens, 11,
            "{format:?} lost prompt tokens"
        );
        assert_eq!(
            reparsed_usage.completion_tokens, 4,
            "{format:?} lost completion tokens"
        );
    }
}

/// Request translation through the IR keeps sampling knobs that both sides
/// can express.
#[test]
fn sampling_fields_map_across_formats() {
    let openai = json!({
        "model": "m",
        "messages": [{"role": "user", "content": "x"}],
        "temperature": 0.3,
        "top_p": 0.9,
        "max_tokens": 256,
        "stop": ["END"],
    });
    let ir = parser_for(Format::OpenAi)
        .parse_request(openai.to_string().as_bytes())
        .unwrap();

    let claude: Value = emitter_for(Format::Claude).emit_request(&ir).unwrap();
    assert_eq!(claude["temperature"], 0.3);
    assert_eq!(claude["max_tokens"], 256);
    assert_eq!(claude["stop_sequences"][0], "END");

    let gemini: Value = emitter_for(Format::Gemini).emit_request(&ir).unwrap();
    assert_eq!(gemini["generationConfig"]["temperature"], 0.3);
    assert_eq!(gemini["generationConfig"]["maxOutputTokens"], 256);
    assert_eq!(gemini["generationConfig"]["stopSequences"][0], "END");

    let ollama: Value = emitter_for(Format::Ollama).emit_request(&ir).unwrap();
    assert_eq!(ollama["options"]["num_predict"], 256);
}
