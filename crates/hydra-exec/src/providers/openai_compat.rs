//! OpenAI-compatible executors: stock OpenAI, GitHub Copilot, Qwen, and
//! Cline-flavored upstreams all speak Chat Completions with different bases
//! and headers.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use hydra_auth::refresh::COPILOT_API_ENDPOINT;
use hydra_core::{GatewayError, Result};
use hydra_protocol::{UnifiedRequest, Usage};
use hydra_translate::{emitter_for, Format, StreamTranslator};

use crate::executor::{
    classify_error_response, common_request, pump_stream, send_with_micro_retry, ExecContext,
    GatewayResponse, ProviderExecutor, StreamSender, WireFraming,
};
use crate::providers::{clamp_request, into_client_response};

/// Header/endpoint flavor of one compatible provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompatFlavor {
    Standard,
    Copilot,
}

pub struct OpenAiCompatExecutor {
    id: &'static str,
    default_base: &'static str,
    chat_path: &'static str,
    flavor: CompatFlavor,
    wire: Format,
}

impl OpenAiCompatExecutor {
    pub fn openai() -> Self {
        Self {
            id: "openai",
            default_base: "https://api.openai.com/v1",
            chat_path: "/chat/completions",
            flavor: CompatFlavor::Standard,
            wire: Format::OpenAi,
        }
    }

    pub fn copilot() -> Self {
        Self {
            id: "copilot",
            default_base: "https://api.githubcopilot.com",
            chat_path: "/chat/completions",
            flavor: CompatFlavor::Copilot,
            wire: Format::OpenAi,
        }
    }

    pub fn qwen() -> Self {
        Self {
            id: "qwen",
            default_base: "https://portal.qwen.ai/v1",
            chat_path: "/chat/completions",
            flavor: CompatFlavor::Standard,
            wire: Format::OpenAi,
        }
    }

    /// Cline-flavored upstream: Chat Completions plus `reasoning` deltas.
    pub fn cline() -> Self {
        Self {
            id: "cline",
            default_base: "https://api.cline.bot/v1",
            chat_path: "/chat/completions",
            flavor: CompatFlavor::Standard,
            wire: Format::Cline,
        }
    }

    fn endpoint(&self, cx: &ExecContext) -> String {
        // Copilot's exchanged token carries its own api endpoint.
        let from_meta = if self.flavor == CompatFlavor::Copilot {
            cx.auth
                .metadata
                .get(COPILOT_API_ENDPOINT)
                .and_then(Value::as_str)
        } else {
            None
        };
        let base = from_meta
            .or_else(|| cx.auth.base_url())
            .unwrap_or(self.default_base);
        format!("{}{}", base.trim_end_matches('/'), self.chat_path)
    }

    fn authorize(&self, cx: &ExecContext, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.bearer_auth(&cx.access_token);
        match self.flavor {
            CompatFlavor::Standard => builder,
            CompatFlavor::Copilot => builder
                .header("Editor-Version", "vscode/1.85.1")
                .header("Editor-Plugin-Version", "copilot/1.155.0")
                .header("Copilot-Integration-Id", "vscode-chat"),
        }
    }

    fn build_body(&self, cx: &ExecContext, ir: &UnifiedRequest, stream: bool) -> Result<Value> {
        let mut ir = clamp_request(cx, self.id, ir);
        ir.stream = stream;
        emitter_for(self.wire).emit_request(&ir)
    }
}

#[async_trait]
impl ProviderExecutor for OpenAiCompatExecutor {
    fn identifier(&self) -> &'static str {
        self.id
    }

    fn wire_format(&self) -> Format {
        self.wire
    }

    async fn execute(&self, cx: &ExecContext, ir: &UnifiedRequest) -> Result<GatewayResponse> {
        let body = self.build_body(cx, ir, false)?;
        let url = self.endpoint(cx);
        debug!(provider = self.id, model = %cx.wire_model, "chat completions request");

        let resp = send_with_micro_retry(cx, || {
            self.authorize(cx, common_request(&cx.client, &url, &body))
        })
        .await?;
        if !resp.status().is_success() {
            return Err(classify_error_response(resp).await);
        }
        let raw = resp
            .bytes()
            .await
            .map_err(|e| GatewayError::Parse(e.to_string()))?;
        into_client_response(self.wire, cx.client_format, &raw, &cx.wire_model)
    }

    async fn execute_stream(
        &self,
        cx: &ExecContext,
        ir: &UnifiedRequest,
        tx: StreamSender,
    ) -> Result<Usage> {
        let body = self.build_body(cx, ir, true)?;
        let url = self.endpoint(cx);
        debug!(provider = self.id, model = %cx.wire_model, "chat completions streaming request");

        let resp = send_with_micro_retry(cx, || {
            self.authorize(cx, common_request(&cx.client, &url, &body))
        })
        .await?;
        if !resp.status().is_success() {
            return Err(classify_error_response(resp).await);
        }

        let mut translator =
            StreamTranslator::new(self.wire, cx.client_format, &cx.wire_model, Some(ir));
        pump_stream(cx, resp, WireFraming::Sse, &mut translator, &tx).await
    }
}
