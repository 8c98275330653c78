//! Top-level entry points: execute, stream, count-tokens.
//!
//! The manager owns the policy: normalize and order the provider list, skip
//! tripped breakers (falling back to probe traffic when everything is open),
//! rotate credentials through the selector, retry what is locally retriable,
//! and record every outcome where the next request can learn from it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hydra_auth::{Auth, AuthStore, TokenManager};
use hydra_core::{GatewayError, ModelRegistry, Result};
use hydra_protocol::{UnifiedRequest, Usage};
use hydra_route::{
    backoff_delay, BreakerConfig, CircuitBreaker, PickOptions, RetryBudget, Selector,
};
use hydra_translate::{parser_for, Format, StreamTranslator};
use hydra_transport::ClientCache;

use crate::executor::{ExecContext, GatewayResponse, ProviderExecutor};
use crate::providers::{self, executor_for};
use crate::report::{NoopReporter, RequestRecord, UsageReporter};

/// Buffer depth of the streaming output channel.
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// One client request, still in the client's wire format.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub format: Format,
    pub model: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Skip sticky routing for this request.
    pub force_rotate: bool,
    /// Client-scoped cancellation; dropped clients cancel the upstream.
    pub cancel: CancellationToken,
}

#[derive(Clone)]
pub struct Manager {
    store: Arc<AuthStore>,
    tokens: Arc<TokenManager>,
    selector: Arc<Selector>,
    breaker: Arc<CircuitBreaker>,
    budget: Arc<RetryBudget>,
    clients: Arc<ClientCache>,
    registry: Arc<ModelRegistry>,
    reporter: Arc<dyn UsageReporter>,
    executors: Arc<HashMap<String, Arc<dyn ProviderExecutor>>>,
    idle_timeout: Duration,
    stop: CancellationToken,
}

pub struct ManagerBuilder {
    store: Arc<AuthStore>,
    tokens: Option<Arc<TokenManager>>,
    reporter: Arc<dyn UsageReporter>,
    breaker_config: BreakerConfig,
    registry: Arc<ModelRegistry>,
    executors: HashMap<String, Arc<dyn ProviderExecutor>>,
    idle_timeout: Duration,
}

impl ManagerBuilder {
    pub fn new(store: Arc<AuthStore>) -> Self {
        let mut executors: HashMap<String, Arc<dyn ProviderExecutor>> = HashMap::new();
        for provider in providers::KNOWN_PROVIDERS {
            if let Some(executor) = executor_for(provider) {
                executors.insert(provider.to_string(), executor);
            }
        }
        Self {
            store,
            tokens: None,
            reporter: Arc::new(NoopReporter),
            breaker_config: BreakerConfig::default(),
            registry: Arc::new(ModelRegistry::new()),
            executors,
            idle_timeout: hydra_transport::reader::DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn token_manager(mut self, tokens: Arc<TokenManager>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn UsageReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn registry(mut self, registry: Arc<ModelRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Replace or add an executor (tests inject stubs this way).
    pub fn executor(mut self, provider: &str, executor: Arc<dyn ProviderExecutor>) -> Self {
        self.executors.insert(provider.to_string(), executor);
        self
    }

    pub fn build(self) -> Manager {
        let stop = CancellationToken::new();
        let selector = Arc::new(Selector::new());
        let clients = Arc::new(ClientCache::new());
        selector.spawn_maintenance(stop.child_token());
        clients.spawn_sweeper(stop.child_token());

        // Antigravity quota readings flow snapshot-by-snapshot into the
        // selector's per-auth state.
        let mut quota_rx = providers::antigravity::spawn_quota_refresher(
            Arc::clone(&self.store),
            hydra_transport::shared_client(),
            stop.child_token(),
        );
        {
            let selector = Arc::clone(&selector);
            let stop = stop.child_token();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        received = quota_rx.recv() => match received {
                            Some((auth_id, snapshot)) => {
                                selector.apply_quota_snapshot(&auth_id, snapshot);
                            }
                            None => return,
                        },
                    }
                }
            });
        }

        let tokens = self
            .tokens
            .unwrap_or_else(|| Arc::new(TokenManager::new(Arc::clone(&self.store))));
        Manager {
            store: self.store,
            tokens,
            selector,
            breaker: Arc::new(CircuitBreaker::new(self.breaker_config)),
            budget: Arc::new(RetryBudget::default()),
            clients,
            registry: self.registry,
            reporter: self.reporter,
            executors: Arc::new(self.executors),
            idle_timeout: self.idle_timeout,
            stop,
        }
    }
}

/// Lowercase, trim, drop empties, keep first occurrence.
fn normalize_providers(providers: &[String]) -> Vec<String> {
    let mut seen = Vec::new();
    for provider in providers {
        let name = provider.trim().to_ascii_lowercase();
        if !name.is_empty() && !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

impl Manager {
    pub fn builder(store: Arc<AuthStore>) -> ManagerBuilder {
        ManagerBuilder::new(store)
    }

    pub fn selector(&self) -> &Arc<Selector> {
        &self.selector
    }

    /// `(provider:model)` stats for the host's observability surface.
    pub fn stats_snapshot(&self) -> HashMap<String, hydra_route::stats::StatsEntry> {
        self.selector.stats_snapshot()
    }

    /// Stop background loops. Idempotent.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    /// Breaker-filtered, score-ordered provider list. When every breaker is
    /// open the original list goes through as probe traffic.
    fn provider_order(&self, providers: &[String], model: &str) -> Vec<String> {
        let mut usable: Vec<String> = providers
            .iter()
            .filter(|p| !self.breaker.is_open(p))
            .cloned()
            .collect();
        if usable.is_empty() {
            warn!("all circuits open, probing the full provider list");
            usable = providers.to_vec();
        }
        usable.sort_by(|a, b| {
            self.selector
                .provider_score(b, model)
                .total_cmp(&self.selector.provider_score(a, model))
        });
        usable
    }

    fn exec_context(
        &self,
        auth: &Arc<Auth>,
        token: String,
        provider: &str,
        model: &str,
        client_format: Format,
        cancel: CancellationToken,
    ) -> ExecContext {
        ExecContext {
            auth: Arc::clone(auth),
            access_token: token,
            client: self.clients.client_for(auth.proxy_url()),
            wire_model: self.registry.resolve_wire_id(provider, model),
            client_format,
            cancel,
            registry: Arc::clone(&self.registry),
            idle_timeout: self.idle_timeout,
        }
    }

    /// Book-keep one settled attempt: breaker, selector, stats, reporter.
    #[allow(clippy::too_many_arguments)]
    fn settle(
        &self,
        provider: &str,
        model: &str,
        auth_id: &str,
        outcome: std::result::Result<Option<Usage>, &GatewayError>,
        latency: Duration,
    ) {
        match outcome {
            Ok(usage) => {
                self.breaker.record(provider, Ok(()));
                let tokens = usage.map(|u| u.with_total().total_tokens).unwrap_or(0);
                self.selector
                    .record_request_end(provider, auth_id, tokens, false);
                self.selector.record_success(provider, model, latency);
                self.reporter.publish(&RequestRecord {
                    auth_id: auth_id.to_string(),
                    provider: provider.to_string(),
                    model: model.to_string(),
                    success: true,
                    http_status: None,
                    error: None,
                    retry_after: None,
                    usage,
                    latency,
                });
            }
            Err(err) => {
                self.breaker.record(provider, Err(err));
                self.selector.record_request_end(provider, auth_id, 0, true);
                if is_quota_error(err) {
                    self.selector
                        .record_quota_hit(provider, model, auth_id, err.retry_after());
                }
                if err.counts_as_provider_failure() {
                    self.selector.record_failure(provider, model);
                }
                self.reporter.publish_failure(&RequestRecord {
                    auth_id: auth_id.to_string(),
                    provider: provider.to_string(),
                    model: model.to_string(),
                    success: false,
                    http_status: Some(err.http_status()),
                    error: Some(err.to_string()),
                    retry_after: err.retry_after(),
                    usage: None,
                    latency,
                });
            }
        }
    }

    // ── non-streaming ────────────────────────────────────────────────────

    pub async fn execute_once(
        &self,
        providers: &[String],
        req: GatewayRequest,
        opts: ExecuteOptions,
    ) -> Result<GatewayResponse> {
        let providers = normalize_providers(providers);
        if providers.is_empty() {
            return Err(GatewayError::ProviderNotFound("(empty list)".into()));
        }
        let ir = parser_for(req.format).parse_request(&req.payload)?;
        let mut last_err = GatewayError::ProviderNotFound(providers.join(","));

        for provider in self.provider_order(&providers, &req.model) {
            let Some(executor) = self.executors.get(&provider).cloned() else {
                last_err = GatewayError::ProviderNotFound(provider.clone());
                continue;
            };
            let auths = self.store.for_provider(&provider);
            if auths.is_empty() {
                last_err = GatewayError::AuthNotFound(provider.clone());
                continue;
            }

            let mut tried: Vec<String> = Vec::new();
            while tried.len() < auths.len() {
                let pool: Vec<Arc<Auth>> = auths
                    .iter()
                    .filter(|a| !tried.contains(&a.id))
                    .cloned()
                    .collect();
                let pick_opts = PickOptions {
                    force_rotate: opts.force_rotate || !tried.is_empty(),
                };
                let auth = match self.selector.pick(&provider, &req.model, pick_opts, &pool) {
                    Ok(auth) => auth,
                    Err(err) => {
                        last_err = err;
                        break;
                    }
                };
                tried.push(auth.id.clone());

                match self
                    .attempt_execute(&provider, &req, &auth, &executor, &ir, &opts)
                    .await
                {
                    Ok(response) => return Ok(response),
                    Err(GatewayError::Cancelled) => return Err(GatewayError::Cancelled),
                    Err(err) => {
                        debug!(provider = %provider, auth_id = %auth.id, error = %err,
                               "attempt failed, rotating");
                        let next_provider = matches!(err, GatewayError::CircuitOpen(_));
                        last_err = err;
                        if next_provider {
                            break;
                        }
                    }
                }
            }
            info!(provider = %provider, "provider exhausted, trying next provider");
        }
        Err(last_err)
    }

    async fn attempt_execute(
        &self,
        provider: &str,
        req: &GatewayRequest,
        auth: &Arc<Auth>,
        executor: &Arc<dyn ProviderExecutor>,
        ir: &UnifiedRequest,
        opts: &ExecuteOptions,
    ) -> Result<GatewayResponse> {
        // `pick` incremented the active counter; every exit below must either
        // settle (acquired) or at least decrement (rejected).
        if let Err(err) = self.breaker.try_acquire(provider) {
            self.selector.record_request_end(provider, &auth.id, 0, true);
            return Err(err);
        }
        let token = match self.tokens.ensure_token(&auth.id).await {
            Ok(token) => token,
            Err(err) => {
                self.settle(provider, &req.model, &auth.id, Err(&err), Duration::ZERO);
                return Err(err);
            }
        };

        let cx = self.exec_context(
            auth,
            token,
            provider,
            &req.model,
            req.format,
            opts.cancel.clone(),
        );
        let started = Instant::now();
        let mut result = executor.execute(&cx, ir).await;

        // One local retry for retriable, non-fallback errors, bounded by the
        // shared budget. Fallback errors rotate instead.
        if let Err(err) = &result {
            if err.is_retriable() && !err.is_fallback() && self.budget.try_acquire() {
                let delay = backoff_delay(0, err.retry_after());
                debug!(provider, ?delay, "local retry after transient error");
                tokio::select! {
                    _ = opts.cancel.cancelled() => {
                        self.selector.record_request_end(provider, &auth.id, 0, true);
                        return Err(GatewayError::Cancelled);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                result = executor.execute(&cx, ir).await;
                if result.is_ok() {
                    self.budget.release();
                }
            }
        }

        let latency = started.elapsed();
        match result {
            Ok(response) => {
                self.settle(provider, &req.model, &auth.id, Ok(response.usage), latency);
                Ok(response)
            }
            Err(err) => {
                self.settle(provider, &req.model, &auth.id, Err(&err), latency);
                Err(err)
            }
        }
    }

    // ── streaming ────────────────────────────────────────────────────────

    /// Start a translated stream. The receiver yields wire frames already in
    /// the client's format; failures that happen before any output rotate to
    /// the next credential/provider, failures after that surface as an error
    /// frame followed by channel close.
    pub async fn execute_stream_once(
        &self,
        providers: &[String],
        req: GatewayRequest,
        opts: ExecuteOptions,
    ) -> Result<mpsc::Receiver<Bytes>> {
        let provider_list = normalize_providers(providers);
        if provider_list.is_empty() {
            return Err(GatewayError::ProviderNotFound("(empty list)".into()));
        }
        // Parse errors are the client's fault; fail before opening a stream.
        let ir = parser_for(req.format).parse_request(&req.payload)?;

        let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
        let manager = self.clone();
        tokio::spawn(async move {
            manager.drive_stream(provider_list, req, ir, opts, tx).await;
        });
        Ok(rx)
    }

    async fn drive_stream(
        &self,
        providers: Vec<String>,
        req: GatewayRequest,
        ir: UnifiedRequest,
        opts: ExecuteOptions,
        tx: mpsc::Sender<Bytes>,
    ) {
        let mut last_err = GatewayError::ProviderNotFound(providers.join(","));

        for provider in self.provider_order(&providers, &req.model) {
            let Some(executor) = self.executors.get(&provider).cloned() else {
                last_err = GatewayError::ProviderNotFound(provider.clone());
                continue;
            };
            let auths = self.store.for_provider(&provider);
            if auths.is_empty() {
                last_err = GatewayError::AuthNotFound(provider.clone());
                continue;
            }

            let mut tried: Vec<String> = Vec::new();
            while tried.len() < auths.len() {
                let pool: Vec<Arc<Auth>> = auths
                    .iter()
                    .filter(|a| !tried.contains(&a.id))
                    .cloned()
                    .collect();
                let pick_opts = PickOptions {
                    force_rotate: opts.force_rotate || !tried.is_empty(),
                };
                let auth = match self.selector.pick(&provider, &req.model, pick_opts, &pool) {
                    Ok(auth) => auth,
                    Err(err) => {
                        last_err = err;
                        break;
                    }
                };
                tried.push(auth.id.clone());

                match self
                    .attempt_stream(&provider, &req, &auth, &executor, &ir, &opts, &tx)
                    .await
                {
                    StreamAttempt::Done => return,
                    StreamAttempt::ClientGone => return,
                    StreamAttempt::Rotate(err) => {
                        let next_provider = matches!(err, GatewayError::CircuitOpen(_));
                        last_err = err;
                        if next_provider {
                            break;
                        }
                    }
                }
            }
        }

        // Nothing produced output: tell the client in its own dialect.
        warn!(error = %last_err, "stream failed across all targets");
        let mut translator =
            StreamTranslator::new(req.format, req.format, &req.model, None);
        if let Ok(frames) = translator.push_error(&last_err.to_string()) {
            for frame in frames {
                if tx.send(Bytes::from(frame)).await.is_err() {
                    return;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_stream(
        &self,
        provider: &str,
        req: &GatewayRequest,
        auth: &Arc<Auth>,
        executor: &Arc<dyn ProviderExecutor>,
        ir: &UnifiedRequest,
        opts: &ExecuteOptions,
        tx: &mpsc::Sender<Bytes>,
    ) -> StreamAttempt {
        if let Err(err) = self.breaker.try_acquire(provider) {
            self.selector.record_request_end(provider, &auth.id, 0, true);
            return StreamAttempt::Rotate(err);
        }
        let token = match self.tokens.ensure_token(&auth.id).await {
            Ok(token) => token,
            Err(err) => {
                self.settle(provider, &req.model, &auth.id, Err(&err), Duration::ZERO);
                return StreamAttempt::Rotate(err);
            }
        };

        let cx = self.exec_context(
            auth,
            token,
            provider,
            &req.model,
            req.format,
            opts.cancel.clone(),
        );
        let started = Instant::now();

        // Intermediate channel so the manager can tell "failed before any
        // output" (rotate) from "failed mid-stream" (already surfaced).
        let (attempt_tx, mut attempt_rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
        let forward = {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut forwarded = 0usize;
                while let Some(frame) = attempt_rx.recv().await {
                    if tx.send(frame).await.is_err() {
                        return (forwarded, true);
                    }
                    forwarded += 1;
                }
                (forwarded, false)
            })
        };

        let result = executor.execute_stream(&cx, ir, attempt_tx).await;
        let (forwarded, client_gone) = forward.await.unwrap_or((0, true));
        let latency = started.elapsed();

        match result {
            Ok(usage) => {
                self.settle(provider, &req.model, &auth.id, Ok(Some(usage)), latency);
                StreamAttempt::Done
            }
            Err(GatewayError::Cancelled) => {
                // Client went away; decrement active but record no failure.
                self.selector.record_request_end(provider, &auth.id, 0, true);
                self.breaker.record(provider, Err(&GatewayError::Cancelled));
                StreamAttempt::ClientGone
            }
            Err(err) => {
                self.settle(provider, &req.model, &auth.id, Err(&err), latency);
                if client_gone {
                    StreamAttempt::ClientGone
                } else if forwarded > 0 {
                    // Mid-stream failure: the pump already emitted the error
                    // frame and flush; retrying would duplicate output.
                    StreamAttempt::Done
                } else {
                    StreamAttempt::Rotate(err)
                }
            }
        }
    }

    // ── token counting ───────────────────────────────────────────────────

    pub async fn count_tokens_once(
        &self,
        providers: &[String],
        req: GatewayRequest,
        opts: ExecuteOptions,
    ) -> Result<u64> {
        let providers = normalize_providers(providers);
        if providers.is_empty() {
            return Err(GatewayError::ProviderNotFound("(empty list)".into()));
        }
        let ir = parser_for(req.format).parse_request(&req.payload)?;
        let mut last_err = GatewayError::ProviderNotFound(providers.join(","));

        for provider in self.provider_order(&providers, &req.model) {
            let Some(executor) = self.executors.get(&provider).cloned() else {
                last_err = GatewayError::ProviderNotFound(provider.clone());
                continue;
            };
            let auths = self.store.for_provider(&provider);
            if auths.is_empty() {
                last_err = GatewayError::AuthNotFound(provider.clone());
                continue;
            }
            let auth = match self
                .selector
                .pick(&provider, &req.model, PickOptions::default(), &auths)
            {
                Ok(auth) => auth,
                Err(err) => {
                    last_err = err;
                    continue;
                }
            };

            if let Err(err) = self.breaker.try_acquire(&provider) {
                self.selector.record_request_end(&provider, &auth.id, 0, true);
                last_err = err;
                continue;
            }
            let token = match self.tokens.ensure_token(&auth.id).await {
                Ok(token) => token,
                Err(err) => {
                    self.settle(provider.as_str(), &req.model, &auth.id, Err(&err), Duration::ZERO);
                    last_err = err;
                    continue;
                }
            };
            let cx = self.exec_context(
                &auth,
                token,
                &provider,
                &req.model,
                req.format,
                opts.cancel.clone(),
            );
            let started = Instant::now();
            match executor.count_tokens(&cx, &ir).await {
                Ok(count) => {
                    self.settle(&provider, &req.model, &auth.id, Ok(None), started.elapsed());
                    return Ok(count);
                }
                Err(err) => {
                    self.settle(&provider, &req.model, &auth.id, Err(&err), started.elapsed());
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }
}

enum StreamAttempt {
    /// Stream completed (or failed after output had already flowed).
    Done,
    /// Client disconnected; stop entirely, record nothing against providers.
    ClientGone,
    /// Failed before any output; try the next target.
    Rotate(GatewayError),
}

fn is_quota_error(err: &GatewayError) -> bool {
    matches!(err, GatewayError::QuotaExhausted { .. })
        || matches!(err, GatewayError::Status { status: 429, .. })
}
