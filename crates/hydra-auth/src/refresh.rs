//! Just-in-time token refresh with per-credential single-flight.
//!
//! Flow per request:
//!   1. Fast path: the stored token is still valid past the margin; use it.
//!   2. Slow path: take the credential's refresh lock, re-read the store
//!      (another task may have refreshed while we waited), then call the
//!      provider's refresher and publish the updated credential.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use hydra_core::{GatewayError, Result};

use crate::auth::{meta, Auth};
use crate::store::AuthStore;

/// Refresh when the token has less than this many seconds left.
const REFRESH_MARGIN_SECS: i64 = 120;

/// Result of one provider refresh call.
#[derive(Debug, Clone)]
pub struct TokenUpdate {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix seconds.
    pub expires_at: i64,
    /// Extra metadata to merge (e.g. the Copilot api endpoint).
    pub extra: HashMap<String, Value>,
}

/// Provider-specific credential refresh.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Provider this refresher serves.
    fn provider(&self) -> &str;

    async fn refresh(&self, auth: &Auth) -> Result<TokenUpdate>;
}

pub struct TokenManager {
    store: Arc<AuthStore>,
    refreshers: HashMap<String, Arc<dyn TokenRefresher>>,
    /// Per-credential refresh locks; late arrivals wait for the in-flight
    /// refresh instead of issuing their own.
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

impl TokenManager {
    pub fn new(store: Arc<AuthStore>) -> Self {
        Self {
            store,
            refreshers: HashMap::new(),
            inflight: DashMap::new(),
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refreshers
            .insert(refresher.provider().to_string(), refresher);
        self
    }

    /// Return a valid access token for `auth_id`, refreshing if needed.
    pub async fn ensure_token(&self, auth_id: &str) -> Result<String> {
        let auth = self
            .store
            .get(auth_id)
            .ok_or_else(|| GatewayError::AuthNotFound(auth_id.to_string()))?;

        // Fast path: still valid, or a static key with no expiry.
        if !auth.token_expiring(REFRESH_MARGIN_SECS) {
            return auth
                .access_token()
                .map(str::to_string)
                .ok_or_else(|| GatewayError::AuthUnavailable(auth.provider.clone()));
        }

        let lock = self
            .inflight
            .entry(auth_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Double-check: the task that held the lock before us probably
        // refreshed already.
        let auth = self
            .store
            .get(auth_id)
            .ok_or_else(|| GatewayError::AuthNotFound(auth_id.to_string()))?;
        if !auth.token_expiring(REFRESH_MARGIN_SECS) {
            if let Some(token) = auth.access_token() {
                return Ok(token.to_string());
            }
        }

        let refresher = self.refreshers.get(&auth.provider).ok_or_else(|| {
            GatewayError::AuthUnavailable(format!(
                "{}: token expired and no refresher registered",
                auth.provider
            ))
        })?;

        info!(auth_id = %auth.id, provider = %auth.provider, "refreshing credential");
        let update = refresher.refresh(&auth).await?;
        let token = update.access_token.clone();

        self.store.update(auth_id, |a| {
            a.metadata.insert(
                meta::ACCESS_TOKEN.into(),
                Value::String(update.access_token.clone()),
            );
            if let Some(rt) = &update.refresh_token {
                a.metadata
                    .insert(meta::REFRESH_TOKEN.into(), Value::String(rt.clone()));
            }
            a.metadata
                .insert(meta::EXPIRES_AT.into(), Value::from(update.expires_at));
            for (k, v) in &update.extra {
                a.metadata.insert(k.clone(), v.clone());
            }
        });
        Ok(token)
    }
}

// ── Qwen OAuth refresh ───────────────────────────────────────────────────────

const QWEN_TOKEN_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/token";
const QWEN_CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";

/// Refresh-token grant against the Qwen OAuth endpoint.
pub struct QwenRefresher {
    client: reqwest::Client,
}

impl QwenRefresher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TokenRefresher for QwenRefresher {
    fn provider(&self) -> &str {
        "qwen"
    }

    async fn refresh(&self, auth: &Auth) -> Result<TokenUpdate> {
        let refresh_token = auth.refresh_token().ok_or_else(|| {
            GatewayError::AuthUnavailable("qwen credential has no refresh token".into())
        })?;

        let body = format!(
            "grant_type=refresh_token&refresh_token={}&client_id={}",
            urlencoding::encode(refresh_token),
            QWEN_CLIENT_ID
        );
        let resp = self
            .client
            .post(QWEN_TOKEN_URL)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("Accept", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| GatewayError::Status {
                status: 502,
                body: format!("qwen token endpoint unreachable: {e}"),
                retry_after: None,
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "qwen token refresh rejected");
            return Err(GatewayError::Status {
                status,
                body: format!("qwen token refresh failed: {text}"),
                retry_after: None,
            });
        }

        let token: OAuthTokenResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Parse(e.to_string()))?;
        debug!(expires_in = token.expires_in, "qwen token refreshed");

        Ok(TokenUpdate {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: Utc::now().timestamp() + token.expires_in as i64,
            extra: HashMap::new(),
        })
    }
}

#[derive(Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
}

// ── GitHub → Copilot token exchange ──────────────────────────────────────────

const COPILOT_TOKEN_URL: &str = "https://api.github.com/copilot_internal/v2/token";
const COPILOT_DEFAULT_ENDPOINT: &str = "https://api.githubcopilot.com";

/// Metadata key the exchange publishes for the executor to read.
pub const COPILOT_API_ENDPOINT: &str = "copilot_api_endpoint";

/// Exchanges the long-lived GitHub token for a short-lived (~30 min) Copilot
/// API key.
pub struct CopilotRefresher {
    client: reqwest::Client,
}

impl CopilotRefresher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TokenRefresher for CopilotRefresher {
    fn provider(&self) -> &str {
        "copilot"
    }

    async fn refresh(&self, auth: &Auth) -> Result<TokenUpdate> {
        let github_token = auth
            .metadata
            .get(meta::GITHUB_TOKEN)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                GatewayError::AuthUnavailable("copilot credential has no github token".into())
            })?;

        let resp = self
            .client
            .get(COPILOT_TOKEN_URL)
            .header("Authorization", format!("token {github_token}"))
            .header("Editor-Version", "vscode/1.85.1")
            .header("Editor-Plugin-Version", "copilot/1.155.0")
            .header("User-Agent", "GithubCopilot/1.155.0")
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| GatewayError::Status {
                status: 502,
                body: format!("copilot token endpoint unreachable: {e}"),
                retry_after: None,
            })?;

        let status = resp.status().as_u16();
        if status == 401 || status == 403 {
            return Err(GatewayError::AuthUnavailable(
                "github token rejected during copilot exchange".into(),
            ));
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Status {
                status,
                body: format!("copilot token exchange failed: {text}"),
                retry_after: None,
            });
        }

        let exchanged: CopilotExchangeResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Parse(e.to_string()))?;
        let api_endpoint = exchanged
            .endpoints
            .and_then(|e| e.api)
            .unwrap_or_else(|| COPILOT_DEFAULT_ENDPOINT.to_string());
        debug!(expires_at = exchanged.expires_at, endpoint = %api_endpoint, "copilot key exchanged");

        let mut extra = HashMap::new();
        extra.insert(COPILOT_API_ENDPOINT.to_string(), Value::String(api_endpoint));
        Ok(TokenUpdate {
            access_token: exchanged.token,
            refresh_token: None,
            expires_at: exchanged.expires_at,
            extra,
        })
    }
}

#[derive(Deserialize)]
struct CopilotExchangeResponse {
    token: String,
    expires_at: i64,
    #[serde(default)]
    endpoints: Option<CopilotEndpoints>,
}

#[derive(Deserialize)]
struct CopilotEndpoints {
    api: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRefresher {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        fn provider(&self) -> &str {
            "test"
        }

        async fn refresh(&self, _auth: &Auth) -> Result<TokenUpdate> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Hold the single-flight long enough for the others to queue up.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(TokenUpdate {
                access_token: "fresh".into(),
                refresh_token: None,
                expires_at: Utc::now().timestamp() + 3600,
                extra: HashMap::new(),
            })
        }
    }

    fn expired_auth() -> Auth {
        Auth::new("a1", "test")
            .with_meta(meta::ACCESS_TOKEN, "stale")
            .with_meta(meta::EXPIRES_AT, Utc::now().timestamp() - 10)
    }

    #[tokio::test]
    async fn valid_token_skips_refresh() {
        let store = Arc::new(AuthStore::new());
        store.register(
            Auth::new("a1", "test")
                .with_meta(meta::ACCESS_TOKEN, "valid")
                .with_meta(meta::EXPIRES_AT, Utc::now().timestamp() + 3600),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let mgr = TokenManager::new(store).with_refresher(Arc::new(CountingRefresher {
            calls: Arc::clone(&calls),
        }));

        assert_eq!(mgr.ensure_token("a1").await.unwrap(), "valid");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_refresh() {
        let store = Arc::new(AuthStore::new());
        store.register(expired_auth());
        let calls = Arc::new(AtomicUsize::new(0));
        let mgr = Arc::new(TokenManager::new(store).with_refresher(Arc::new(
            CountingRefresher {
                calls: Arc::clone(&calls),
            },
        )));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mgr = Arc::clone(&mgr);
            handles.push(tokio::spawn(async move {
                mgr.ensure_token("a1").await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "fresh");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "refresh was single-flight");
    }

    #[tokio::test]
    async fn missing_refresher_is_unavailable() {
        let store = Arc::new(AuthStore::new());
        store.register(expired_auth());
        let mgr = TokenManager::new(store);
        let err = mgr.ensure_token("a1").await.unwrap_err();
        assert_eq!(err.code(), "auth_unavailable");
    }

    #[tokio::test]
    async fn unknown_auth_is_not_found() {
        let mgr = TokenManager::new(Arc::new(AuthStore::new()));
        let err = mgr.ensure_token("ghost").await.unwrap_err();
        assert_eq!(err.code(), "auth_not_found");
    }
}
