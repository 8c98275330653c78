//! The provider executor contract and the HTTP machinery all executors share:
//! common headers, status classification with retry-after extraction, the
//! single in-executor 429 micro-retry, and the stream pump that feeds
//! upstream bytes through the translator into the caller's channel.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use hydra_auth::Auth;
use hydra_core::{GatewayError, ModelRegistry, Result};
use hydra_protocol::{UnifiedRequest, Usage};
use hydra_translate::sse::{parse_sse_line, LineBuffer, SseLine};
use hydra_translate::{Format, StreamTranslator};
use hydra_transport::{CloseReason, StreamReader};

use std::sync::Arc;

/// Ceiling on provider-suggested quota waits (some report hours).
pub const MAX_QUOTA_RETRY_DELAY: Duration = Duration::from_secs(5 * 3600);
/// Per-attempt ceiling on the in-executor micro-retry wait.
const MICRO_RETRY_CAP: Duration = Duration::from_secs(20);

/// Everything an executor needs for one attempt against one credential.
pub struct ExecContext {
    pub auth: Arc<Auth>,
    pub access_token: String,
    pub client: reqwest::Client,
    /// Provider-specific model id (already resolved via the registry).
    pub wire_model: String,
    /// Format the client speaks; responses are translated back into it.
    pub client_format: Format,
    pub cancel: CancellationToken,
    pub registry: Arc<ModelRegistry>,
    pub idle_timeout: Duration,
}

/// Completed non-streaming result, already in the client's format.
#[derive(Debug)]
pub struct GatewayResponse {
    pub payload: Vec<u8>,
    pub usage: Option<Usage>,
}

/// Output channel for streamed wire frames (client format, ready to write).
pub type StreamSender = mpsc::Sender<Bytes>;

#[async_trait]
pub trait ProviderExecutor: Send + Sync {
    /// Provider name this executor serves ("claude", "gemini", …).
    fn identifier(&self) -> &'static str;

    /// Wire dialect the upstream speaks.
    fn wire_format(&self) -> Format;

    async fn execute(&self, cx: &ExecContext, ir: &UnifiedRequest) -> Result<GatewayResponse>;

    /// Run the stream to completion, sending translated frames into `tx`.
    /// Errors before the first frame let the manager rotate targets.
    async fn execute_stream(
        &self,
        cx: &ExecContext,
        ir: &UnifiedRequest,
        tx: StreamSender,
    ) -> Result<Usage>;

    /// Providers without a native endpoint answer with a local estimate.
    async fn count_tokens(&self, _cx: &ExecContext, ir: &UnifiedRequest) -> Result<u64> {
        Ok(ir.estimate_input_tokens())
    }

    /// Credential refresh hook; token-managed providers are a no-op here.
    async fn refresh(&self, _cx: &ExecContext) -> Result<()> {
        Ok(())
    }
}

// ── shared HTTP helpers ──────────────────────────────────────────────────────

/// Headers every upstream call carries. Accept-Encoding is left to the
/// client: its gzip/brotli/zstd/deflate features advertise and decode
/// transparently, and a manual header would turn that off.
pub fn common_request(
    client: &reqwest::Client,
    url: &str,
    body: &Value,
) -> reqwest::RequestBuilder {
    client
        .post(url)
        .header("Content-Type", "application/json")
        .header("Connection", "keep-alive")
        .json(body)
}

/// Parse `"3s"`, `"3.5s"`, `"2m30s"`, `"1h5m"` style duration strings
/// (Google RetryInfo / quotaResetDelay shapes).
pub fn parse_duration_str(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut total = 0.0f64;
    let mut number = String::new();
    for ch in raw.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            number.push(ch);
            continue;
        }
        let value: f64 = number.parse().ok()?;
        number.clear();
        total += match ch {
            'h' => value * 3600.0,
            'm' => value * 60.0,
            's' => value,
            _ => return None,
        };
    }
    if !number.is_empty() {
        // Bare number: seconds.
        total += number.parse::<f64>().ok()?;
    }
    Some(Duration::from_secs_f64(total))
}

/// Server-suggested wait, from headers and/or a JSON error body. Looks at
/// `retry-after`, `RetryInfo.retryDelay`, `ErrorInfo.metadata.quotaResetDelay`
/// and `quotaInfo.resetTime`; capped at `MAX_QUOTA_RETRY_DELAY`.
pub fn extract_retry_after(headers: &reqwest::header::HeaderMap, body: &str) -> Option<Duration> {
    let mut found: Option<Duration> = None;

    if let Some(value) = headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        found = Some(Duration::from_secs(value));
    }

    if found.is_none() {
        if let Ok(parsed) = serde_json::from_str::<Value>(body) {
            for detail in parsed
                .pointer("/error/details")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                if let Some(delay) = detail.get("retryDelay").and_then(Value::as_str) {
                    found = parse_duration_str(delay);
                    break;
                }
                if let Some(delay) = detail
                    .pointer("/metadata/quotaResetDelay")
                    .and_then(Value::as_str)
                {
                    found = parse_duration_str(delay);
                    break;
                }
            }
            if found.is_none() {
                if let Some(reset) = parsed
                    .pointer("/quotaInfo/resetTime")
                    .and_then(Value::as_str)
                    .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
                {
                    let delta = reset.timestamp() - chrono::Utc::now().timestamp();
                    if delta > 0 {
                        found = Some(Duration::from_secs(delta as u64));
                    }
                }
            }
        }
    }
    found.map(|d| d.min(MAX_QUOTA_RETRY_DELAY))
}

/// Turn a non-2xx upstream response into a categorized error, consuming the
/// body for context.
pub async fn classify_error_response(resp: reqwest::Response) -> GatewayError {
    let status = resp.status().as_u16();
    let headers = resp.headers().clone();
    let body = resp.text().await.unwrap_or_default();
    let retry_after = extract_retry_after(&headers, &body);
    warn!(status, body = %truncate(&body, 300), "upstream error response");
    GatewayError::Status {
        status,
        body,
        retry_after,
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Issue the request, micro-retrying a 429 at most once inside the executor.
/// Any further 429 propagates so the manager rotates accounts instead.
pub async fn send_with_micro_retry<F>(cx: &ExecContext, build: F) -> Result<reqwest::Response>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut retried = false;
    loop {
        let resp = tokio::select! {
            _ = cx.cancel.cancelled() => return Err(GatewayError::Cancelled),
            resp = build().send() => resp.map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(Duration::from_secs(0))
                } else {
                    GatewayError::Status {
                        status: 502,
                        body: e.to_string(),
                        retry_after: None,
                    }
                }
            })?,
        };

        if resp.status().as_u16() != 429 || retried {
            return Ok(resp);
        }

        let err = classify_error_response(resp).await;
        let delay = err
            .retry_after()
            .map(|hint| hint + Duration::from_millis(500))
            .unwrap_or(Duration::from_secs(1))
            .min(MICRO_RETRY_CAP);
        debug!(?delay, "429 received, one in-executor retry");
        retried = true;
        tokio::select! {
            _ = cx.cancel.cancelled() => return Err(GatewayError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

// ── shared stream pump ───────────────────────────────────────────────────────

/// How chunk boundaries are framed on the upstream wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFraming {
    Sse,
    Ndjson,
}

/// Drive an accepted (2xx) streaming response through the translator into
/// `tx` until EOF, `[DONE]`, cancellation or an idle trip. Returns the final
/// usage; errors only for outcomes the manager should record as failures.
pub async fn pump_stream(
    cx: &ExecContext,
    resp: reqwest::Response,
    framing: WireFraming,
    translator: &mut StreamTranslator,
    tx: &StreamSender,
) -> Result<Usage> {
    let mut reader = StreamReader::from_response(resp, cx.idle_timeout, cx.cancel.clone());
    let mut lines = LineBuffer::new();

    loop {
        match reader.next_chunk().await {
            Some(Ok(bytes)) => {
                for line in lines.push(&bytes) {
                    let payload = match framing {
                        WireFraming::Ndjson => Some(line.as_str()),
                        WireFraming::Sse => match parse_sse_line(&line) {
                            Some(SseLine::Data(_)) => {
                                // Borrow out of the parsed line instead of the
                                // temporary: strip the prefix directly.
                                line.strip_prefix("data:").map(str::trim)
                            }
                            Some(SseLine::Done) => {
                                flush_translator(translator, tx).await;
                                return Ok(translator_usage(translator));
                            }
                            _ => None,
                        },
                    };
                    let Some(payload) = payload else { continue };
                    match translator.push_chunk(payload) {
                        Ok(frames) => {
                            if !send_frames(tx, frames).await {
                                return Err(GatewayError::Cancelled);
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "unparseable upstream chunk");
                        }
                    }
                }
            }
            Some(Err(err)) => {
                let frames = translator.push_error(&err).unwrap_or_default();
                let _ = send_frames(tx, frames).await;
                flush_translator(translator, tx).await;
                return Err(GatewayError::Status {
                    status: 502,
                    body: err,
                    retry_after: None,
                });
            }
            None => {
                // Trailing unterminated line (ollama's last chunk often has
                // no final newline).
                if let Some(rest) = lines.take_remainder() {
                    let payload = match framing {
                        WireFraming::Ndjson => Some(rest.as_str()),
                        WireFraming::Sse => rest.strip_prefix("data:").map(str::trim),
                    };
                    if let Some(payload) = payload {
                        if let Ok(frames) = translator.push_chunk(payload) {
                            let _ = send_frames(tx, frames).await;
                        }
                    }
                }
                let finished_before_close = translator.finish_seen();
                flush_translator(translator, tx).await;
                return match reader.close_reason() {
                    Some(CloseReason::Cancelled) => Err(GatewayError::Cancelled),
                    Some(CloseReason::IdleTimeout) if !finished_before_close => {
                        Err(GatewayError::Timeout(cx.idle_timeout))
                    }
                    _ => Ok(translator_usage(translator)),
                };
            }
        }
    }
}

async fn flush_translator(translator: &mut StreamTranslator, tx: &StreamSender) {
    if let Ok(frames) = translator.finish() {
        let _ = send_frames(tx, frames).await;
    }
}

fn translator_usage(translator: &StreamTranslator) -> Usage {
    translator.usage()
}

/// `false` means the receiver is gone (client disconnected).
async fn send_frames(tx: &StreamSender, frames: Vec<String>) -> bool {
    for frame in frames {
        if tx.send(Bytes::from(frame)).await.is_err() {
            return false;
        }
    }
    true
}
