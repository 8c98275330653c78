//! Ollama executor — local NDJSON upstream, no auth.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use hydra_core::{GatewayError, Result};
use hydra_protocol::{UnifiedRequest, Usage};
use hydra_translate::{emitter_for, Format, StreamTranslator};

use crate::executor::{
    classify_error_response, common_request, pump_stream, send_with_micro_retry, ExecContext,
    GatewayResponse, ProviderExecutor, StreamSender, WireFraming,
};
use crate::providers::{clamp_request, into_client_response};

const DEFAULT_BASE: &str = "http://localhost:11434";

pub struct OllamaExecutor;

impl OllamaExecutor {
    fn endpoint(cx: &ExecContext) -> String {
        let base = cx.auth.base_url().unwrap_or(DEFAULT_BASE);
        format!("{}/api/chat", base.trim_end_matches('/'))
    }

    fn build_body(cx: &ExecContext, ir: &UnifiedRequest, stream: bool) -> Result<Value> {
        let mut ir = clamp_request(cx, "ollama", ir);
        ir.stream = stream;
        emitter_for(Format::Ollama).emit_request(&ir)
    }
}

#[async_trait]
impl ProviderExecutor for OllamaExecutor {
    fn identifier(&self) -> &'static str {
        "ollama"
    }

    fn wire_format(&self) -> Format {
        Format::Ollama
    }

    async fn execute(&self, cx: &ExecContext, ir: &UnifiedRequest) -> Result<GatewayResponse> {
        let body = Self::build_body(cx, ir, false)?;
        let url = Self::endpoint(cx);
        debug!(model = %cx.wire_model, "ollama request");

        let resp =
            send_with_micro_retry(cx, || common_request(&cx.client, &url, &body)).await?;
        if !resp.status().is_success() {
            return Err(classify_error_response(resp).await);
        }
        let raw = resp
            .bytes()
            .await
            .map_err(|e| GatewayError::Parse(e.to_string()))?;
        into_client_response(Format::Ollama, cx.client_format, &raw, &cx.wire_model)
    }

    async fn execute_stream(
        &self,
        cx: &ExecContext,
        ir: &UnifiedRequest,
        tx: StreamSender,
    ) -> Result<Usage> {
        let body = Self::build_body(cx, ir, true)?;
        let url = Self::endpoint(cx);
        debug!(model = %cx.wire_model, "ollama streaming request");

        let resp =
            send_with_micro_retry(cx, || common_request(&cx.client, &url, &body)).await?;
        if !resp.status().is_success() {
            return Err(classify_error_response(resp).await);
        }

        let mut translator =
            StreamTranslator::new(Format::Ollama, cx.client_format, &cx.wire_model, Some(ir));
        pump_stream(cx, resp, WireFraming::Ndjson, &mut translator, &tx).await
    }
}
