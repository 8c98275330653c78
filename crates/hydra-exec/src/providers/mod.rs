//! Per-provider executors plus the table the manager resolves them from.

pub mod antigravity;
pub mod claude;
pub mod codex;
pub mod gemini;
pub mod ollama;
pub mod openai_compat;

use std::sync::Arc;

use hydra_core::Result;
use hydra_protocol::UnifiedRequest;
use hydra_translate::{parser_for, translate_response, Format};

use crate::executor::{ExecContext, GatewayResponse, ProviderExecutor};

/// Resolve an executor by provider name.
pub fn executor_for(provider: &str) -> Option<Arc<dyn ProviderExecutor>> {
    match provider {
        "claude" => Some(Arc::new(claude::ClaudeExecutor)),
        "gemini" | "gemini-cli" => Some(Arc::new(gemini::GeminiExecutor)),
        "antigravity" => Some(Arc::new(antigravity::AntigravityExecutor)),
        "openai" => Some(Arc::new(openai_compat::OpenAiCompatExecutor::openai())),
        "copilot" => Some(Arc::new(openai_compat::OpenAiCompatExecutor::copilot())),
        "qwen" => Some(Arc::new(openai_compat::OpenAiCompatExecutor::qwen())),
        "cline" => Some(Arc::new(openai_compat::OpenAiCompatExecutor::cline())),
        "codex" => Some(Arc::new(codex::CodexExecutor)),
        "ollama" => Some(Arc::new(ollama::OllamaExecutor)),
        _ => None,
    }
}

/// All providers the table knows, for host listings.
pub const KNOWN_PROVIDERS: &[&str] = &[
    "claude",
    "gemini",
    "gemini-cli",
    "antigravity",
    "openai",
    "copilot",
    "qwen",
    "cline",
    "codex",
    "ollama",
];

/// Copy the IR with the wire model id applied and the model registry's
/// limits enforced (thinking budget and max output tokens).
pub(crate) fn clamp_request(cx: &ExecContext, provider: &str, ir: &UnifiedRequest) -> UnifiedRequest {
    let mut ir = ir.clone();
    ir.model = cx.wire_model.clone();
    if let Some(info) = cx.registry.lookup(provider, &cx.wire_model) {
        if let Some(requested) = ir.sampling.max_tokens {
            ir.sampling.max_tokens = Some(info.clamp_max_tokens(requested));
        }
        if let Some(thinking) = ir.thinking.as_mut() {
            match info.thinking_budget {
                Some(_) => {
                    if let Some(budget) = thinking.budget_tokens {
                        thinking.budget_tokens = info.clamp_thinking_budget(budget);
                    }
                }
                // Model cannot think; drop the config rather than get a 400.
                None => ir.thinking = None,
            }
        }
    }
    ir
}

/// Parse usage out of the upstream body and translate the payload into the
/// client's dialect (passthrough within a family).
pub(crate) fn into_client_response(
    wire: Format,
    client: Format,
    raw: &[u8],
    model: &str,
) -> Result<GatewayResponse> {
    let (_, usage) = parser_for(wire).parse_response(raw)?;
    let payload = translate_response(wire, client, raw, model)?;
    Ok(GatewayResponse {
        payload,
        usage: Some(usage),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_known_provider_resolves() {
        for provider in KNOWN_PROVIDERS {
            let executor = executor_for(provider).unwrap();
            assert!(!executor.identifier().is_empty());
        }
        assert!(executor_for("smoke-signals").is_none());
    }
}
