//! Claude Messages executor.
//!
//! Speaks the Messages API directly; OAuth tokens use a bearer header with
//! the oauth beta flag, plain `sk-ant-` keys use `x-api-key`.

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

const DEFAULT_BASE: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct ClaudeExecutor;

impl ClaudeExecutor {
    fn base_url(cx: &ExecContext) -> String {
        cx.auth
            .base_url()
            .unwrap_or(DEFAULT_BASE)
            .trim_end_matches('/')
            .to_string()
    }

    fn authorize(cx: &ExecContext, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("anthropic-version", API_VERSION);
        if cx.access_token.starts_with("sk-ant-") {
            builder.header("x-api-key", &cx.access_token)
        } else {
            builder
                .bearer_auth(&cx.access_token)
                .header("anthropic-beta", "oauth-2025-04-20")
        }
    }

    fn build_body(cx: &ExecContext, ir: &UnifiedRequest, stream: bool) -> Result<Value> {
        let mut ir = clamp_request(cx, "claude", ir);
        ir.stream = stream;
        emitter_for(Format::Claude).emit_request(&ir)
    }
}

#[async_trait]
impl ProviderExecutor for ClaudeExecutor {
    fn identifier(&self) -> &'static str {
        "claude"
    }

    fn wire_format(&self) -> Format {
        Format::Claude
    }

    async fn execute(&self, cx: &ExecContext, ir: &UnifiedRequest) -> Result<GatewayResponse> {
        let body = Self::build_body(cx, ir, false)?;
        let url = format!("{}/v1/messages", Self::base_url(cx));
        debug!(model = %cx.wire_model, "claude request");

        let resp = send_with_micro_retry(cx, || {
            Self::authorize(cx, common_request(&cx.client, &url, &body))
        })
        .await?;
        if !resp.status().is_success() {
            return Err(classify_error_response(resp).await);
        }
        let raw = resp
            .bytes()
            .await
            .map_err(|e| GatewayError::Parse(e.to_string()))?;
        into_client_response(Format::Claude, cx.client_format, &raw, &cx.wire_model)
    }

    async fn execute_stream(
        &self,
        cx: &ExecContext,
        ir: &UnifiedRequest,
        tx: StreamSender,
    ) -> Result<Usage> {
        let body = Self::build_body(cx, ir, true)?;
        let url = format!("{}/v1/messages", Self::base_url(cx));
        debug!(model = %cx.wire_model, "claude streaming request");

        let resp = send_with_micro_retry(cx, || {
            Self::authorize(cx, common_request(&cx.client, &url, &body))
        })
        .await?;
        if !resp.status().is_success() {
            return Err(classify_error_response(resp).await);
        }

        let mut translator =
            StreamTranslator::new(Format::Claude, cx.client_format, &cx.wire_model, Some(ir));
        pump_stream(cx, resp, WireFraming::Sse, &mut translator, &tx).await
    }

    /// Claude has a native count endpoint.
    async fn count_tokens(&self, cx: &ExecContext, ir: &UnifiedRequest) -> Result<u64> {
        let mut body = Self::build_body(cx, ir, false)?;
        if let Some(obj) = body.as_object_mut() {
            // The count endpoint takes a messages body without max_tokens.
            obj.remove("max_tokens");
            obj.remove("stream");
        }
        let url = format!("{}/v1/messages/count_tokens", Self::base_url(cx));

        let resp = send_with_micro_retry(cx, || {
            Self::authorize(cx, common_request(&cx.client, &url, &body))
        })
        .await?;
        if !resp.status().is_success() {
            return Err(classify_error_response(resp).await);
        }
        let parsed: Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Parse(e.to_string()))?;
        parsed
            .get("input_tokens")
            .and_then(Value::as_u64)
            .ok_or_else(|| GatewayError::Parse("count_tokens response missing input_tokens".into()))
    }
}
