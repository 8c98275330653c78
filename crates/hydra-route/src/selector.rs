//! Credential selection: filter, score, smear, stick.
//!
//! `pick` owns the accounting contract: every successful pick increments the
//! chosen auth's active counter exactly once, and the caller must answer with
//! exactly one `record_request_end`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use hydra_auth::Auth;
use hydra_core::{GatewayError, Result};

use crate::shard::ShardedStates;
use crate::state::{now_nanos, AuthQuotaState, QuotaSnapshot};
use crate::stats::{ProviderStats, StatsEntry};
use crate::sticky::StickyStore;
use crate::strategy::{strategy_for, ProviderStrategy};

/// Candidates whose score sits within this band of the minimum are
/// interchangeable; picking among them at random smears load.
const SCORE_CLUSTER_BAND: f64 = 100.0;
/// At most this many clustered candidates enter the random draw.
const SCORE_CLUSTER_TOP: usize = 3;
/// Maintenance cadence for state GC and sticky sweeps.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, Default)]
pub struct PickOptions {
    /// Skip the sticky binding and rotate deliberately.
    pub force_rotate: bool,
}

pub struct Selector {
    states: ShardedStates,
    sticky: StickyStore,
    stats: ProviderStats,
    strategies: DashMap<String, Arc<dyn ProviderStrategy>>,
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector {
    pub fn new() -> Self {
        Self {
            states: ShardedStates::new(),
            sticky: StickyStore::new(),
            stats: ProviderStats::new(),
            strategies: DashMap::new(),
        }
    }

    fn strategy(&self, provider: &str) -> Arc<dyn ProviderStrategy> {
        self.strategies
            .entry(provider.to_string())
            .or_insert_with(|| strategy_for(provider))
            .clone()
    }

    /// Pick a credential for `(provider, model)` out of `auths`.
    ///
    /// On success the returned auth's `active_requests` has been incremented;
    /// the caller owes one `record_request_end`.
    pub fn pick(
        &self,
        provider: &str,
        model: &str,
        opts: PickOptions,
        auths: &[Arc<Auth>],
    ) -> Result<Arc<Auth>> {
        let now = now_nanos();

        let available: Vec<&Arc<Auth>> = auths
            .iter()
            .filter(|auth| auth.enabled)
            .filter(|auth| !auth.model_blocked(model))
            .filter(|auth| {
                self.states
                    .get(&auth.id)
                    .map(|state| !state.in_cooldown(now))
                    .unwrap_or(true)
            })
            .collect();

        if available.is_empty() {
            // Everything is cooling down (or nothing exists): report the
            // earliest time anything becomes usable again.
            let earliest = auths
                .iter()
                .filter_map(|auth| self.states.get(&auth.id))
                .map(|state| state.cooldown_until())
                .filter(|until| *until > now)
                .min();
            return match earliest {
                Some(until) => Err(GatewayError::QuotaExhausted {
                    provider: provider.to_string(),
                    retry_after: Some(Duration::from_nanos((until - now).max(0) as u64)),
                }),
                None => Err(GatewayError::AuthUnavailable(provider.to_string())),
            };
        }

        if available.len() == 1 {
            return Ok(self.claim(available[0]));
        }

        // Sticky routing keeps a conversation on the account whose prompt
        // cache is warm, unless the caller forces rotation.
        if !opts.force_rotate {
            if let Some(sticky_id) = self.sticky.get(provider, model) {
                if let Some(auth) = available.iter().find(|a| a.id == sticky_id) {
                    debug!(auth_id = %sticky_id, provider, model, "sticky hit");
                    return Ok(self.claim(auth));
                }
            }
        }

        let picked = self.select_optimal(provider, &available);
        self.sticky.set(provider, model, &picked.id);
        Ok(self.claim(&picked))
    }

    /// Score candidates (lower wins), then draw uniformly among the top few
    /// whose scores cluster at the minimum.
    fn select_optimal(&self, provider: &str, available: &[&Arc<Auth>]) -> Arc<Auth> {
        let strategy = self.strategy(provider);
        let mut scored: Vec<(f64, &Arc<Auth>)> = available
            .iter()
            .map(|auth| {
                let state = self.states.get_or_create(&auth.id);
                (strategy.score(&state), *auth)
            })
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));

        let min = scored[0].0;
        let cluster = scored
            .iter()
            .take(SCORE_CLUSTER_TOP)
            .filter(|(score, _)| *score - min <= SCORE_CLUSTER_BAND)
            .count();
        let winner = (rand::random::<u64>() as usize) % cluster;
        Arc::clone(scored[winner].1)
    }

    fn claim(&self, auth: &Arc<Auth>) -> Arc<Auth> {
        self.states.get_or_create(&auth.id).incr_active();
        Arc::clone(auth)
    }

    /// Exactly one call per successful `pick`. `tokens` is total usage for
    /// the request; failed requests learn nothing. Rate-limit strategies
    /// count the request itself, so this fires even when usage is zero.
    pub fn record_request_end(&self, provider: &str, auth_id: &str, tokens: u64, failed: bool) {
        let state = self.states.get_or_create(auth_id);
        state.decr_active();
        if !failed {
            self.strategy(provider).record_usage(&state, tokens);
        }
    }

    /// The provider refused this credential for quota reasons.
    pub fn record_quota_hit(
        &self,
        provider: &str,
        model: &str,
        auth_id: &str,
        cooldown: Option<Duration>,
    ) {
        info!(auth_id, provider, model, ?cooldown, "quota hit");
        let state = self.states.get_or_create(auth_id);
        self.strategy(provider).on_quota_hit(&state, cooldown);
        // The sticky binding must not keep steering traffic into a wall.
        self.sticky.evict_auth(auth_id);
    }

    pub fn get_state(&self, auth_id: &str) -> Option<Arc<AuthQuotaState>> {
        self.states.get(auth_id)
    }

    /// Publish a quota reading from a provider's quota endpoint (antigravity
    /// background refresher).
    pub fn apply_quota_snapshot(&self, auth_id: &str, snapshot: QuotaSnapshot) {
        self.states.get_or_create(auth_id).set_quota_snapshot(snapshot);
    }

    // ── outcome stats (provider ordering) ────────────────────────────────

    pub fn record_success(&self, provider: &str, model: &str, latency: Duration) {
        self.stats.record_success(provider, model, latency);
    }

    pub fn record_failure(&self, provider: &str, model: &str) {
        self.stats.record_failure(provider, model);
    }

    pub fn provider_score(&self, provider: &str, model: &str) -> f64 {
        self.stats.score(provider, model)
    }

    pub fn stats_snapshot(&self) -> std::collections::HashMap<String, StatsEntry> {
        self.stats.snapshot()
    }

    /// Background maintenance: drop idle per-auth states and expired sticky
    /// bindings every ten minutes until the token fires.
    pub fn spawn_maintenance(self: &Arc<Self>, stop: CancellationToken) -> tokio::task::JoinHandle<()> {
        let selector = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(CLEANUP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tick.tick() => {
                        let now = now_nanos();
                        let removed = selector.states.retain(|_, state| !state.is_idle(now));
                        let swept = selector.sticky.sweep();
                        if removed > 0 || swept > 0 {
                            debug!(removed, swept, "selector maintenance pass");
                        }
                    }
                }
            }
        })
    }
}
