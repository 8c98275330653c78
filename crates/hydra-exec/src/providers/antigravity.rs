//! Antigravity executor — Gemini-shaped bodies in the Vertex envelope
//! (`{project, model, request}`), responses wrapped `{response: {…}}`.
//!
//! The provider exposes a quota endpoint; a background refresher polls it and
//! publishes snapshots over a channel so the selector can score accounts by
//! their real remaining quota.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use hydra_auth::{meta, AuthStore};
use hydra_core::{GatewayError, Result};
use hydra_protocol::{UnifiedRequest, Usage};
use hydra_route::state::now_nanos;
use hydra_route::QuotaSnapshot;
use hydra_translate::formats::gemini::{unwrap_envelope, wrap_vertex_envelope};
use hydra_translate::{emitter_for, Format, StreamTranslator};

use crate::executor::{
    classify_error_response, common_request, pump_stream, send_with_micro_retry, ExecContext,
    GatewayResponse, ProviderExecutor, StreamSender, WireFraming,
};
use crate::providers::{clamp_request, into_client_response};

/// Poll cadence for the quota endpoint, plus up to 30 s of jitter.
const QUOTA_POLL_INTERVAL: Duration = Duration::from_secs(120);
const QUOTA_POLL_JITTER_SECS: u64 = 30;

pub struct AntigravityExecutor;

impl AntigravityExecutor {
    fn base_url(cx: &ExecContext) -> Result<String> {
        cx.auth
            .base_url()
            .map(|b| b.trim_end_matches('/').to_string())
            .ok_or_else(|| {
                GatewayError::AuthUnavailable("antigravity credential has no base_url".into())
            })
    }

    fn project(cx: &ExecContext) -> String {
        cx.auth
            .metadata
            .get(meta::PROJECT_ID)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn build_body(cx: &ExecContext, ir: &UnifiedRequest) -> Result<Value> {
        let ir = clamp_request(cx, "antigravity", ir);
        let inner = emitter_for(Format::Gemini).emit_request(&ir)?;
        Ok(wrap_vertex_envelope(
            &Self::project(cx),
            &cx.wire_model,
            inner,
        ))
    }
}

#[async_trait]
impl ProviderExecutor for AntigravityExecutor {
    fn identifier(&self) -> &'static str {
        "antigravity"
    }

    fn wire_format(&self) -> Format {
        Format::Gemini
    }

    async fn execute(&self, cx: &ExecContext, ir: &UnifiedRequest) -> Result<GatewayResponse> {
        let body = Self::build_body(cx, ir)?;
        let url = format!("{}/v1internal:generateContent", Self::base_url(cx)?);
        debug!(model = %cx.wire_model, "antigravity request");

        let resp = send_with_micro_retry(cx, || {
            common_request(&cx.client, &url, &body).bearer_auth(&cx.access_token)
        })
        .await?;
        if !resp.status().is_success() {
            return Err(classify_error_response(resp).await);
        }
        let raw = resp
            .bytes()
            .await
            .map_err(|e| GatewayError::Parse(e.to_string()))?;

        // Unwrap the Vertex envelope before translation so passthrough
        // clients see a plain Gemini body.
        let parsed: Value =
            serde_json::from_slice(&raw).map_err(|e| GatewayError::Parse(e.to_string()))?;
        let unwrapped = serde_json::to_vec(unwrap_envelope(&parsed))
            .map_err(|e| GatewayError::Parse(e.to_string()))?;
        into_client_response(Format::Gemini, cx.client_format, &unwrapped, &cx.wire_model)
    }

    async fn execute_stream(
        &self,
        cx: &ExecContext,
        ir: &UnifiedRequest,
        tx: StreamSender,
    ) -> Result<Usage> {
        let body = Self::build_body(cx, ir)?;
        let url = format!(
            "{}/v1internal:streamGenerateContent?alt=sse",
            Self::base_url(cx)?
        );
        debug!(model = %cx.wire_model, "antigravity streaming request");

        let resp = send_with_micro_retry(cx, || {
            common_request(&cx.client, &url, &body).bearer_auth(&cx.access_token)
        })
        .await?;
        if !resp.status().is_success() {
            return Err(classify_error_response(resp).await);
        }

        // The gemini parser unwraps per-chunk envelopes itself.
        let mut translator =
            StreamTranslator::new(Format::Gemini, cx.client_format, &cx.wire_model, Some(ir));
        pump_stream(cx, resp, WireFraming::Sse, &mut translator, &tx).await
    }
}

/// Poll each antigravity credential's quota endpoint and publish snapshots.
/// Consumers feed them to `Selector::apply_quota_snapshot`.
pub fn spawn_quota_refresher(
    store: Arc<AuthStore>,
    client: reqwest::Client,
    stop: CancellationToken,
) -> mpsc::Receiver<(String, QuotaSnapshot)> {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        loop {
            let jitter = Duration::from_secs(rand::random::<u64>() % (QUOTA_POLL_JITTER_SECS + 1));
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(QUOTA_POLL_INTERVAL + jitter) => {}
            }

            for auth in store.for_provider("antigravity") {
                if !auth.enabled {
                    continue;
                }
                let Some(base) = auth.base_url() else { continue };
                let Some(token) = auth.access_token() else { continue };
                let url = format!("{}/v1internal:fetchQuota", base.trim_end_matches('/'));

                let resp = client.post(&url).bearer_auth(token).json(&Value::Null).send();
                let snapshot = match resp.await {
                    Ok(resp) if resp.status().is_success() => {
                        match resp.json::<Value>().await {
                            Ok(body) => parse_quota_body(&body),
                            Err(err) => {
                                warn!(auth_id = %auth.id, error = %err, "bad quota body");
                                None
                            }
                        }
                    }
                    Ok(resp) => {
                        debug!(auth_id = %auth.id, status = resp.status().as_u16(), "quota poll refused");
                        None
                    }
                    Err(err) => {
                        debug!(auth_id = %auth.id, error = %err, "quota poll failed");
                        None
                    }
                };
                if let Some(snapshot) = snapshot {
                    if tx.send((auth.id.clone(), snapshot)).await.is_err() {
                        return; // consumer gone, stop polling
                    }
                }
            }
        }
    });
    rx
}

fn parse_quota_body(body: &Value) -> Option<QuotaSnapshot> {
    let remaining = body
        .get("remainingFraction")
        .or_else(|| body.pointer("/quota/remainingFraction"))
        .and_then(Value::as_f64)?;
    let reset_at = body
        .get("resetTime")
        .or_else(|| body.pointer("/quota/resetTime"))
        .and_then(Value::as_str)
        .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.timestamp())
        .unwrap_or(0);
    Some(QuotaSnapshot {
        remaining_fraction: remaining.clamp(0.0, 1.0),
        window_reset_at: reset_at,
        fetched_at: now_nanos(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_body_parses_flat_and_nested() {
        let flat = serde_json::json!({"remainingFraction": 0.42, "resetTime": "2026-08-01T00:00:00Z"});
        let snap = parse_quota_body(&flat).unwrap();
        assert!((snap.remaining_fraction - 0.42).abs() < 1e-9);
        assert!(snap.window_reset_at > 0);

        let nested = serde_json::json!({"quota": {"remainingFraction": 1.5}});
        let snap = parse_quota_body(&nested).unwrap();
        assert_eq!(snap.remaining_fraction, 1.0, "clamped into range");

        assert!(parse_quota_body(&serde_json::json!({})).is_none());
    }
}
