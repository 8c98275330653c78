//! Gemini generateContent executor.
//!
//! Streams with `alt=sse`; `AIza…` API keys go in `x-goog-api-key`, OAuth
//! tokens in the bearer header.

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

const DEFAULT_BASE: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiExecutor;

impl GeminiExecutor {
    fn base_url(cx: &ExecContext) -> String {
        cx.auth
            .base_url()
            .unwrap_or(DEFAULT_BASE)
            .trim_end_matches('/')
            .to_string()
    }

    fn endpoint(cx: &ExecContext, stream: bool) -> String {
        let verb = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        format!(
            "{}/v1beta/models/{}:{verb}",
            Self::base_url(cx),
            cx.wire_model
        )
    }

    fn authorize(cx: &ExecContext, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if cx.access_token.starts_with("AIza") {
            builder.header("x-goog-api-key", &cx.access_token)
        } else {
            builder.bearer_auth(&cx.access_token)
        }
    }

    fn build_body(cx: &ExecContext, ir: &UnifiedRequest) -> Result<Value> {
        let ir = clamp_request(cx, "gemini", ir);
        emitter_for(Format::Gemini).emit_request(&ir)
    }
}

#[async_trait]
impl ProviderExecutor for GeminiExecutor {
    fn identifier(&self) -> &'static str {
        "gemini"
    }

    fn wire_format(&self) -> Format {
        Format::Gemini
    }

    async fn execute(&self, cx: &ExecContext, ir: &UnifiedRequest) -> Result<GatewayResponse> {
        let body = Self::build_body(cx, ir)?;
        let url = Self::endpoint(cx, false);
        debug!(model = %cx.wire_model, "gemini request");

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
        into_client_response(Format::Gemini, cx.client_format, &raw, &cx.wire_model)
    }

    async fn execute_stream(
        &self,
        cx: &ExecContext,
        ir: &UnifiedRequest,
        tx: StreamSender,
    ) -> Result<Usage> {
        let body = Self::build_body(cx, ir)?;
        let url = Self::endpoint(cx, true);
        debug!(model = %cx.wire_model, "gemini streaming request");

        let resp = send_with_micro_retry(cx, || {
            Self::authorize(cx, common_request(&cx.client, &url, &body))
        })
        .await?;
        if !resp.status().is_success() {
            return Err(classify_error_response(resp).await);
        }

        let mut translator =
            StreamTranslator::new(Format::Gemini, cx.client_format, &cx.wire_model, Some(ir));
        pump_stream(cx, resp, WireFraming::Sse, &mut translator, &tx).await
    }

    /// Native countTokens endpoint.
    async fn count_tokens(&self, cx: &ExecContext, ir: &UnifiedRequest) -> Result<u64> {
        let full = Self::build_body(cx, ir)?;
        // countTokens takes only the contents (and optional system).
        let mut body = serde_json::json!({ "contents": full["contents"] });
        if let Some(si) = full.get("systemInstruction") {
            body["systemInstruction"] = si.clone();
        }
        let url = format!(
            "{}/v1beta/models/{}:countTokens",
            Self::base_url(cx),
            cx.wire_model
        );

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
            .get("totalTokens")
            .and_then(Value::as_u64)
            .ok_or_else(|| GatewayError::Parse("countTokens response missing totalTokens".into()))
    }
}
