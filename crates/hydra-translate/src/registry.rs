//! Format registry — maps format names to their parser and emitter.
//!
//! Parsers and emitters are stateless unit values; per-stream state lives in
//! `StreamContext`. The registry is a static table, looked up by the manager
//! once per request.

use hydra_core::Result;
use hydra_protocol::{Message, UnifiedEvent, UnifiedRequest, Usage};
use serde_json::Value;

use crate::context::StreamContext;
use crate::formats::{claude, cline, gemini, ollama, openai, responses};

/// A wire dialect understood on at least one side of the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// OpenAI Chat Completions.
    OpenAi,
    /// OpenAI Responses API (codex clients).
    Responses,
    /// Claude Messages.
    Claude,
    /// Gemini generateContent.
    Gemini,
    /// Gemini as spoken by the gemini CLI; same wire family as `Gemini`.
    GeminiCli,
    /// Ollama NDJSON chat/generate.
    Ollama,
    /// Cline's OpenAI dialect with `reasoning` deltas.
    Cline,
}

impl Format {
    /// Resolve a client-supplied format name, including the usual aliases.
    pub fn from_name(name: &str) -> Option<Format> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" | "openai-chat" | "chat-completions" => Some(Format::OpenAi),
            "openai-response" | "openai-responses" | "codex" => Some(Format::Responses),
            "claude" | "anthropic" | "claude-messages" => Some(Format::Claude),
            "gemini" | "vertex" => Some(Format::Gemini),
            "gemini-cli" => Some(Format::GeminiCli),
            "ollama" => Some(Format::Ollama),
            "cline" => Some(Format::Cline),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Format::OpenAi => "openai",
            Format::Responses => "openai-response",
            Format::Claude => "claude",
            Format::Gemini => "gemini",
            Format::GeminiCli => "gemini-cli",
            Format::Ollama => "ollama",
            Format::Cline => "cline",
        }
    }

    /// Equivalence class for the passthrough matrix: formats in the same
    /// family exchange payloads byte-for-byte (modulo envelope unwrapping).
    pub fn family(self) -> &'static str {
        match self {
            Format::OpenAi => "openai",
            Format::Responses => "responses",
            Format::Claude => "claude",
            Format::Gemini | Format::GeminiCli => "gemini",
            Format::Ollama => "ollama",
            Format::Cline => "cline",
        }
    }

    pub fn is_passthrough_to(self, other: Format) -> bool {
        self.family() == other.family()
    }
}

/// Lifts wire payloads of one format into the neutral model.
pub trait FormatParser: Send + Sync {
    fn format(&self) -> Format;

    /// Parse a client request body.
    fn parse_request(&self, raw: &[u8]) -> Result<UnifiedRequest>;

    /// Parse a complete (non-streaming) upstream response.
    fn parse_response(&self, raw: &[u8]) -> Result<(Vec<Message>, Usage)>;

    /// Parse one upstream stream chunk (the SSE data payload or NDJSON line).
    fn parse_chunk(&self, data: &str, ctx: &mut StreamContext) -> Result<Vec<UnifiedEvent>>;

    /// Produce trailing events when the stream ends (flush buffered state).
    fn finalize(&self, _ctx: &mut StreamContext) -> Vec<UnifiedEvent> {
        Vec::new()
    }
}

/// Lowers the neutral model back into one format's wire shapes.
pub trait FormatEmitter: Send + Sync {
    fn format(&self) -> Format;

    /// Build an upstream request body.
    fn emit_request(&self, ir: &UnifiedRequest) -> Result<Value>;

    /// Build a complete (non-streaming) response body.
    fn emit_response(&self, messages: &[Message], usage: &Usage, model: &str) -> Result<Value>;

    /// Turn one event into zero or more wire frames (SSE frames or NDJSON
    /// lines, ready to write).
    fn emit_chunk(&self, event: &UnifiedEvent, ctx: &mut StreamContext) -> Result<Vec<String>>;

    /// Trailing frames at stream end (format terminators, held chunks).
    fn flush(&self, _ctx: &mut StreamContext) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

static OPENAI_PARSER: openai::OpenAiFormat = openai::OpenAiFormat;
static RESPONSES_PARSER: responses::ResponsesFormat = responses::ResponsesFormat;
static CLAUDE_PARSER: claude::ClaudeFormat = claude::ClaudeFormat;
static GEMINI_PARSER: gemini::GeminiFormat = gemini::GeminiFormat { cli: false };
static GEMINI_CLI_PARSER: gemini::GeminiFormat = gemini::GeminiFormat { cli: true };
static OLLAMA_PARSER: ollama::OllamaFormat = ollama::OllamaFormat;
static CLINE_PARSER: cline::ClineFormat = cline::ClineFormat;

/// Parser for a format. Total over `Format`.
pub fn parser_for(format: Format) -> &'static dyn FormatParser {
    match format {
        Format::OpenAi => &OPENAI_PARSER,
        Format::Responses => &RESPONSES_PARSER,
        Format::Claude => &CLAUDE_PARSER,
        Format::Gemini => &GEMINI_PARSER,
        Format::GeminiCli => &GEMINI_CLI_PARSER,
        Format::Ollama => &OLLAMA_PARSER,
        Format::Cline => &CLINE_PARSER,
    }
}

/// Emitter for a format. Total over `Format`.
pub fn emitter_for(format: Format) -> &'static dyn FormatEmitter {
    match format {
        Format::OpenAi => &OPENAI_PARSER,
        Format::Responses => &RESPONSES_PARSER,
        Format::Claude => &CLAUDE_PARSER,
        Format::Gemini => &GEMINI_PARSER,
        Format::GeminiCli => &GEMINI_CLI_PARSER,
        Format::Ollama => &OLLAMA_PARSER,
        Format::Cline => &CLINE_PARSER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve() {
        assert_eq!(Format::from_name("codex"), Some(Format::Responses));
        assert_eq!(Format::from_name("Anthropic"), Some(Format::Claude));
        assert_eq!(Format::from_name(" gemini-cli "), Some(Format::GeminiCli));
        assert_eq!(Format::from_name("smoke-signals"), None);
    }

    #[test]
    fn gemini_family_is_passthrough() {
        assert!(Format::Gemini.is_passthrough_to(Format::GeminiCli));
        assert!(Format::OpenAi.is_passthrough_to(Format::OpenAi));
        assert!(!Format::OpenAi.is_passthrough_to(Format::Cline));
    }

    #[test]
    fn every_format_has_parser_and_emitter() {
        for f in [
            Format::OpenAi,
            Format::Responses,
            Format::Claude,
            Format::Gemini,
            Format::GeminiCli,
            Format::Ollama,
            Format::Cline,
        ] {
            assert_eq!(parser_for(f).format().family(), f.family());
            assert_eq!(emitter_for(f).format().family(), f.family());
        }
    }
}
