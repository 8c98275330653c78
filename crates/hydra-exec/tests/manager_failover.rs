//! End-to-end manager behavior against stub executors: credential rotation on
//! quota hits, breaker trips, stream failover, and cancellation accounting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use hydra_auth::{Auth, AuthStore};
use hydra_core::GatewayError;
use hydra_exec::report::RecordingReporter;
use hydra_exec::{
    ExecContext, ExecuteOptions, GatewayRequest, GatewayResponse, Manager, ProviderExecutor,
    StreamSender,
};
use hydra_protocol::{UnifiedRequest, Usage};
use hydra_route::BreakerConfig;
use hydra_translate::Format;

/// Outcome a stub plays for one credential.
#[derive(Clone)]
enum Play {
    Ok,
    Status(u16, Option<Duration>),
    WaitForCancel,
}

struct StubExecutor {
    id: &'static str,
    /// auth id → scripted outcome; unlisted auths succeed.
    plays: HashMap<String, Play>,
    calls: AtomicUsize,
    called_auths: Mutex<Vec<String>>,
}

impl StubExecutor {
    fn new(id: &'static str, plays: HashMap<String, Play>) -> Arc<Self> {
        Arc::new(Self {
            id,
            plays,
            calls: AtomicUsize::new(0),
            called_auths: Mutex::new(Vec::new()),
        })
    }

    fn play_for(&self, cx: &ExecContext) -> Play {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.called_auths
            .lock()
            .unwrap()
            .push(cx.auth.id.clone());
        self.plays.get(&cx.auth.id).cloned().unwrap_or(Play::Ok)
    }

    async fn run(&self, cx: &ExecContext) -> Result<Usage, GatewayError> {
        match self.play_for(cx) {
            Play::Ok => Ok(Usage {
                prompt_tokens: 5,
                completion_tokens: 7,
                ..Default::default()
            }),
            Play::Status(status, retry_after) => Err(GatewayError::Status {
                status,
                body: format!("stubbed {status}"),
                retry_after,
            }),
            Play::WaitForCancel => {
                cx.cancel.cancelled().await;
                Err(GatewayError::Cancelled)
            }
        }
    }
}

#[async_trait]
impl ProviderExecutor for StubExecutor {
    fn identifier(&self) -> &'static str {
        self.id
    }

    fn wire_format(&self) -> Format {
        Format::OpenAi
    }

    async fn execute(
        &self,
        cx: &ExecContext,
        _ir: &UnifiedRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        let usage = self.run(cx).await?;
        Ok(GatewayResponse {
            payload: br#"{"ok":true}"#.to_vec(),
            usage: Some(usage),
        })
    }

    async fn execute_stream(
        &self,
        cx: &ExecContext,
        _ir: &UnifiedRequest,
        tx: StreamSender,
    ) -> Result<Usage, GatewayError> {
        let usage = self.run(cx).await?;
        for frame in ["data: {\"delta\":\"he\"}\n\n", "data: {\"delta\":\"llo\"}\n\n"] {
            if tx.send(bytes::Bytes::from(frame)).await.is_err() {
                return Err(GatewayError::Cancelled);
            }
        }
        Ok(usage)
    }
}

fn openai_request() -> GatewayRequest {
    GatewayRequest {
        format: Format::OpenAi,
        model: "test-model".to_string(),
        payload: br#"{"model":"test-model","messages":[{"role":"user","content":"hi"}]}"#.to_vec(),
    }
}

fn store_with(provider: &str, auth_ids: &[&str]) -> Arc<AuthStore> {
    let store = Arc::new(AuthStore::new());
    for id in auth_ids {
        store.register(
            Auth::new(*id, provider).with_meta(hydra_auth::meta::ACCESS_TOKEN, "tok"),
        );
    }
    store
}

#[tokio::test]
async fn quota_hit_rotates_to_free_credential() {
    let store = store_with("stub", &["auth-a", "auth-b"]);
    let stub = StubExecutor::new(
        "stub",
        HashMap::from([(
            "auth-a".to_string(),
            Play::Status(429, Some(Duration::from_secs(3600))),
        )]),
    );
    let reporter = Arc::new(RecordingReporter::new());
    let manager = Manager::builder(store)
        .executor("stub", stub.clone())
        .reporter(reporter.clone())
        .build();

    let response = manager
        .execute_once(
            &["stub".to_string()],
            openai_request(),
            ExecuteOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.payload, br#"{"ok":true}"#.to_vec());

    // Whichever auth 429'd first is now cooling down; if that was auth-a,
    // its state must say so.
    let called = stub.called_auths.lock().unwrap().clone();
    if called.contains(&"auth-a".to_string()) {
        let state = manager.selector().get_state("auth-a").unwrap();
        assert!(state.in_cooldown(hydra_route::state::now_nanos()));
    }
    // The success was recorded with usage.
    let records = reporter.records.lock().unwrap();
    let success = records.iter().find(|r| r.success).unwrap();
    assert_eq!(success.usage.unwrap().completion_tokens, 7);

    manager.shutdown();
}

#[tokio::test]
async fn all_credentials_on_cooldown_is_quota_exhausted() {
    let store = store_with("stub", &["a1", "a2"]);
    let stub = StubExecutor::new(
        "stub",
        HashMap::from([
            ("a1".to_string(), Play::Status(429, Some(Duration::from_secs(1800)))),
            ("a2".to_string(), Play::Status(429, Some(Duration::from_secs(900)))),
        ]),
    );
    let manager = Manager::builder(store)
        .executor("stub", stub)
        .build();

    // First call burns both credentials into cooldown.
    let err = manager
        .execute_once(&["stub".to_string()], openai_request(), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "status_error");

    // Second call finds nothing pickable and reports the earliest retry.
    let err = manager
        .execute_once(&["stub".to_string()], openai_request(), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "quota_exhausted");
    let retry = err.retry_after().unwrap();
    assert!(retry <= Duration::from_secs(900));

    manager.shutdown();
}

#[tokio::test]
async fn breaker_trips_and_rejects_without_calling_executor() {
    let store = store_with("stub", &["a1", "a2"]);
    let stub = StubExecutor::new(
        "stub",
        HashMap::from([
            ("a1".to_string(), Play::Status(503, None)),
            ("a2".to_string(), Play::Status(503, None)),
        ]),
    );
    let manager = Manager::builder(store)
        .executor("stub", stub.clone())
        .breaker_config(BreakerConfig {
            min_requests: 10,
            failure_threshold: 5,
            failure_ratio: 0.6,
            timeout: Duration::from_secs(60),
            ..Default::default()
        })
        .build();

    // Each call attempts both credentials: five calls = ten failures.
    for _ in 0..5 {
        let _ = manager
            .execute_once(&["stub".to_string()], openai_request(), ExecuteOptions::default())
            .await;
    }
    let calls_after_trip = stub.calls.load(Ordering::SeqCst);

    let err = manager
        .execute_once(&["stub".to_string()], openai_request(), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "circuit_open");
    assert_eq!(
        stub.calls.load(Ordering::SeqCst),
        calls_after_trip,
        "tripped breaker must not invoke the executor"
    );

    manager.shutdown();
}

#[tokio::test]
async fn empty_provider_list_is_provider_not_found() {
    let manager = Manager::builder(Arc::new(AuthStore::new())).build();
    let err = manager
        .execute_once(&[], openai_request(), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "provider_not_found");
    manager.shutdown();
}

#[tokio::test]
async fn stream_fails_over_before_first_frame() {
    let store = store_with("stub", &["bad", "good"]);
    let stub = StubExecutor::new(
        "stub",
        HashMap::from([("bad".to_string(), Play::Status(503, None))]),
    );
    let manager = Manager::builder(store)
        .executor("stub", stub)
        .build();

    let mut rx = manager
        .execute_stream_once(
            &["stub".to_string()],
            openai_request(),
            ExecuteOptions::default(),
        )
        .await
        .unwrap();

    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(String::from_utf8_lossy(&frame).to_string());
    }
    assert_eq!(frames.len(), 2, "good credential streamed both frames");
    assert!(frames[0].contains("he"));

    manager.shutdown();
}

#[tokio::test]
async fn client_cancellation_is_not_a_provider_failure() {
    let store = store_with("stub", &["a1"]);
    let stub = StubExecutor::new(
        "stub",
        HashMap::from([("a1".to_string(), Play::WaitForCancel)]),
    );
    let manager = Manager::builder(store)
        .executor("stub", stub)
        .build();

    let cancel = CancellationToken::new();
    let opts = ExecuteOptions {
        force_rotate: false,
        cancel: cancel.clone(),
    };
    let providers = ["stub".to_string()];
    let call = manager.execute_once(&providers, openai_request(), opts);
    tokio::pin!(call);

    tokio::select! {
        _ = &mut call => panic!("call should still be waiting"),
        _ = tokio::time::sleep(Duration::from_millis(20)) => cancel.cancel(),
    }
    let err = call.await.unwrap_err();
    assert_eq!(err.code(), "context_cancelled");

    // Nothing counted against the provider, and the active counter drained.
    let stats = manager.stats_snapshot();
    assert!(stats
        .get("stub:test-model")
        .map(|e| e.failure == 0)
        .unwrap_or(true));
    let state = manager.selector().get_state("a1").unwrap();
    assert_eq!(state.active_requests(), 0);

    manager.shutdown();
}

#[tokio::test]
async fn count_tokens_falls_back_to_estimate() {
    let store = store_with("stub", &["a1"]);
    let stub = StubExecutor::new("stub", HashMap::new());
    let manager = Manager::builder(store)
        .executor("stub", stub)
        .build();

    let count = manager
        .count_tokens_once(
            &["stub".to_string()],
            openai_request(),
            ExecuteOptions::default(),
        )
        .await
        .unwrap();
    // "hi" is two chars; the chars/4 estimate rounds up to one token.
    assert_eq!(count, 1);

    manager.shutdown();
}

#[tokio::test]
async fn provider_names_normalize_and_dedupe() {
    let store = store_with("stub", &["a1"]);
    let stub = StubExecutor::new("stub", HashMap::new());
    let manager = Manager::builder(store)
        .executor("stub", stub.clone())
        .build();

    let response = manager
        .execute_once(
            &[" STUB ".to_string(), "stub".to_string()],
            openai_request(),
            ExecuteOptions::default(),
        )
        .await
        .unwrap();
    assert!(!response.payload.is_empty());
    assert_eq!(stub.calls.load(Ordering::SeqCst), 1);

    manager.shutdown();
}
