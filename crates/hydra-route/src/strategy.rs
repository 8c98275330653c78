//! Per-provider scoring strategies. Lower priority wins.
//!
//! All strategies are pure functions over the atomic quota state: no locks,
//! no allocation on the hot path. The shared baseline is
//! `active·1000 + usage_fraction·500`; providers with better signals
//! (token buckets, request windows, real quota readings) add their own term.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::state::{now_nanos, AuthQuotaState};

/// Weight of one in-flight request.
const ACTIVE_WEIGHT: f64 = 1000.0;
/// Weight of the token-usage fraction.
const USAGE_WEIGHT: f64 = 500.0;
/// Weight of the gemini/copilot rate terms.
const RATE_WEIGHT: f64 = 600.0;
/// Weight of a fresh real-quota reading.
const REAL_QUOTA_WEIGHT: f64 = 800.0;

pub trait ProviderStrategy: Send + Sync {
    /// Priority for candidate ordering; lower is better.
    fn score(&self, state: &AuthQuotaState) -> f64;

    /// Provider refused for quota; shared semantics live on the state.
    fn on_quota_hit(&self, state: &AuthQuotaState, cooldown: Option<Duration>) {
        state.record_quota_hit(cooldown);
    }

    /// Usage accounting; a no-op for pure rate-limit strategies.
    fn record_usage(&self, state: &AuthQuotaState, tokens: u64) {
        state.add_tokens(tokens);
    }
}

fn usage_fraction(state: &AuthQuotaState, estimated_limit: u64) -> f64 {
    let limit = state.learned_limit().max(estimated_limit);
    if limit == 0 {
        return 0.0;
    }
    (state.total_tokens_used() as f64 / limit as f64).min(1.0)
}

// ── default / claude ─────────────────────────────────────────────────────────

/// Baseline: balance in-flight load against the learned token budget.
pub struct DefaultStrategy {
    pub estimated_limit: u64,
}

impl DefaultStrategy {
    pub fn new(estimated_limit: u64) -> Self {
        Self { estimated_limit }
    }
}

impl ProviderStrategy for DefaultStrategy {
    fn score(&self, state: &AuthQuotaState) -> f64 {
        state.active_requests() as f64 * ACTIVE_WEIGHT
            + usage_fraction(state, self.estimated_limit) * USAGE_WEIGHT
    }
}

// ── gemini: per-auth token bucket ────────────────────────────────────────────

/// CAS token bucket refilled at `capacity` per minute. Scoring favors fuller
/// buckets; each settled request drains one token through `record_usage`.
pub struct GeminiStrategy {
    pub capacity: u64,
}

impl GeminiStrategy {
    pub fn new(capacity: u64) -> Self {
        Self { capacity }
    }

    /// Top the bucket up from elapsed wall time. Lock-free: one CAS on the
    /// refill timestamp elects the refiller, everyone else moves on.
    fn refill(&self, state: &AuthQuotaState) {
        let now = now_nanos();
        let last = state.bucket_refilled_at.load(Ordering::Acquire);
        if last == 0 {
            // First touch: seed a full bucket.
            if state
                .bucket_refilled_at
                .compare_exchange(0, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                state.bucket_available.store(self.capacity, Ordering::Release);
            }
            return;
        }
        let elapsed_nanos = (now - last).max(0) as u128;
        let refill = (elapsed_nanos * self.capacity as u128
            / Duration::from_secs(60).as_nanos()) as u64;
        if refill == 0 {
            return;
        }
        if state
            .bucket_refilled_at
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let available = state.bucket_available.load(Ordering::Acquire);
            state
                .bucket_available
                .store((available + refill).min(self.capacity), Ordering::Release);
        }
    }

    /// Take one token; `false` means the bucket is dry.
    pub fn consume_token(&self, state: &AuthQuotaState) -> bool {
        self.refill(state);
        let mut available = state.bucket_available.load(Ordering::Acquire);
        loop {
            if available == 0 {
                return false;
            }
            match state.bucket_available.compare_exchange_weak(
                available,
                available - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => available = observed,
            }
        }
    }
}

impl ProviderStrategy for GeminiStrategy {
    fn score(&self, state: &AuthQuotaState) -> f64 {
        self.refill(state);
        let available = state.bucket_available.load(Ordering::Acquire) as f64;
        let depletion = 1.0 - (available / self.capacity.max(1) as f64).min(1.0);
        state.active_requests() as f64 * ACTIVE_WEIGHT + depletion * RATE_WEIGHT
    }

    /// The bucket meters requests per minute, not tokens: every settled
    /// request drains one bucket token, so depleted accounts score worse on
    /// the next pick.
    fn record_usage(&self, state: &AuthQuotaState, _tokens: u64) {
        if !self.consume_token(state) {
            debug!("gemini token bucket empty");
        }
    }
}

// ── copilot: request-count window ────────────────────────────────────────────

/// 24 h request-count window. The window restarts when it expires; within it,
/// priority grows with the request count against the estimated daily limit.
pub struct CopilotStrategy {
    pub estimated_limit: u64,
}

impl CopilotStrategy {
    pub fn new(estimated_limit: u64) -> Self {
        Self { estimated_limit }
    }

    const WINDOW: Duration = Duration::from_secs(24 * 3600);

    fn window_count(&self, state: &AuthQuotaState) -> u64 {
        let now = now_nanos();
        let started = state.window_started_at.load(Ordering::Acquire);
        if started == 0 || now - started > Self::WINDOW.as_nanos() as i64 {
            // Window rolled over; whoever wins the CAS resets the counter.
            if state
                .window_started_at
                .compare_exchange(started, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                state.window_count.store(0, Ordering::Release);
            }
        }
        state.window_count.load(Ordering::Acquire)
    }

    pub fn count_request(&self, state: &AuthQuotaState) {
        self.window_count(state);
        state.window_count.fetch_add(1, Ordering::AcqRel);
    }
}

impl ProviderStrategy for CopilotStrategy {
    fn score(&self, state: &AuthQuotaState) -> f64 {
        let fraction =
            (self.window_count(state) as f64 / self.estimated_limit.max(1) as f64).min(1.0);
        state.active_requests() as f64 * ACTIVE_WEIGHT + fraction * RATE_WEIGHT
    }

    /// Requests, not tokens, are the scarce resource here.
    fn record_usage(&self, state: &AuthQuotaState, _tokens: u64) {
        self.count_request(state);
    }
}

// ── antigravity: real quota readings ─────────────────────────────────────────

/// Prefers the provider's own quota endpoint when a reading is fresh
/// (under five minutes); otherwise scores like the default strategy.
pub struct AntigravityStrategy {
    fallback: DefaultStrategy,
}

impl AntigravityStrategy {
    pub fn new(estimated_limit: u64) -> Self {
        Self {
            fallback: DefaultStrategy::new(estimated_limit),
        }
    }
}

impl ProviderStrategy for AntigravityStrategy {
    fn score(&self, state: &AuthQuotaState) -> f64 {
        if let Some(snapshot) = state.quota_snapshot() {
            if snapshot.is_fresh(now_nanos()) {
                let depletion = 1.0 - snapshot.remaining_fraction.clamp(0.0, 1.0);
                return state.active_requests() as f64 * ACTIVE_WEIGHT
                    + depletion * REAL_QUOTA_WEIGHT;
            }
        }
        self.fallback.score(state)
    }
}

/// Strategy table by provider name. Limits are conservative defaults the
/// learning machinery refines at runtime.
pub fn strategy_for(provider: &str) -> Arc<dyn ProviderStrategy> {
    match provider {
        "gemini" | "gemini-cli" => Arc::new(GeminiStrategy::new(60)),
        "copilot" => Arc::new(CopilotStrategy::new(300)),
        "antigravity" => Arc::new(AntigravityStrategy::new(2_000_000)),
        _ => Arc::new(DefaultStrategy::new(2_000_000)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::QuotaSnapshot;

    #[test]
    fn default_strategy_prefers_idle_auths() {
        let strategy = DefaultStrategy::new(1000);
        let idle = AuthQuotaState::new();
        let busy = AuthQuotaState::new();
        busy.incr_active();
        busy.incr_active();
        assert!(strategy.score(&idle) < strategy.score(&busy));
    }

    #[test]
    fn default_strategy_penalizes_token_usage() {
        let strategy = DefaultStrategy::new(1000);
        let fresh = AuthQuotaState::new();
        let used = AuthQuotaState::new();
        used.add_tokens(900);
        assert!(strategy.score(&fresh) < strategy.score(&used));
    }

    #[test]
    fn gemini_bucket_drains_and_refuses() {
        let strategy = GeminiStrategy::new(3);
        let state = AuthQuotaState::new();
        assert!(strategy.consume_token(&state));
        assert!(strategy.consume_token(&state));
        assert!(strategy.consume_token(&state));
        assert!(!strategy.consume_token(&state), "bucket is dry");
    }

    #[test]
    fn gemini_score_rises_as_bucket_drains() {
        let strategy = GeminiStrategy::new(10);
        let state = AuthQuotaState::new();
        let full = strategy.score(&state);
        for _ in 0..8 {
            strategy.consume_token(&state);
        }
        assert!(strategy.score(&state) > full);
    }

    #[test]
    fn gemini_record_usage_drains_one_bucket_token_per_request() {
        let strategy = GeminiStrategy::new(5);
        let state = AuthQuotaState::new();
        let fresh = strategy.score(&state);
        for _ in 0..4 {
            strategy.record_usage(&state, 1_000_000);
        }
        assert!(strategy.score(&state) > fresh);
        assert_eq!(
            state.total_tokens_used(),
            0,
            "bucket strategy keeps no token ledger"
        );
    }

    #[test]
    fn copilot_counts_requests_not_tokens() {
        let strategy = CopilotStrategy::new(100);
        let state = AuthQuotaState::new();
        let before = strategy.score(&state);
        strategy.record_usage(&state, 1_000_000);
        strategy.record_usage(&state, 1);
        assert_eq!(state.total_tokens_used(), 0);
        assert!(strategy.score(&state) > before);
    }

    #[test]
    fn antigravity_uses_fresh_snapshot() {
        let strategy = AntigravityStrategy::new(1000);
        let low = AuthQuotaState::new();
        low.set_quota_snapshot(QuotaSnapshot {
            remaining_fraction: 0.1,
            window_reset_at: 0,
            fetched_at: now_nanos(),
        });
        let high = AuthQuotaState::new();
        high.set_quota_snapshot(QuotaSnapshot {
            remaining_fraction: 0.9,
            window_reset_at: 0,
            fetched_at: now_nanos(),
        });
        assert!(strategy.score(&high) < strategy.score(&low));
    }

    #[test]
    fn antigravity_ignores_stale_snapshot() {
        let strategy = AntigravityStrategy::new(1000);
        let state = AuthQuotaState::new();
        state.set_quota_snapshot(QuotaSnapshot {
            remaining_fraction: 0.0,
            window_reset_at: 0,
            fetched_at: now_nanos() - Duration::from_secs(600).as_nanos() as i64,
        });
        // Stale snapshot → default formula → zero score for an idle state.
        assert_eq!(strategy.score(&state), 0.0);
    }
}
