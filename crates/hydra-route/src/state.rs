//! Per-credential runtime quota state. All hot fields are atomics updated
//! through CAS loops: decrements never go below zero, cooldowns and learned
//! limits only move up (concurrent updaters converge on the maximum).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;

/// Fallback cooldown when the provider never told us how long to wait.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5 * 3600);

/// Idle states older than this get garbage-collected.
pub const STATE_RETENTION: Duration = Duration::from_secs(24 * 3600);

pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Point-in-time quota reading from a provider's quota API.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaSnapshot {
    /// Fraction of quota still available, 0.0..=1.0.
    pub remaining_fraction: f64,
    /// Unix seconds the provider window resets.
    pub window_reset_at: i64,
    /// Unix nanos this snapshot was fetched.
    pub fetched_at: i64,
}

impl QuotaSnapshot {
    /// Snapshots older than five minutes are stale and ignored by scoring.
    pub fn is_fresh(&self, now: i64) -> bool {
        now - self.fetched_at < Duration::from_secs(300).as_nanos() as i64
    }
}

#[derive(Debug, Default)]
pub struct AuthQuotaState {
    active_requests: AtomicU64,
    /// Unix nanos; 0 = no cooldown.
    cooldown_until: AtomicI64,
    /// Tokens used inside the current learning window.
    total_tokens_used: AtomicU64,
    /// Unix nanos; 0 = never.
    last_exhausted_at: AtomicI64,
    /// Largest token count this account sustained before a quota hit.
    learned_limit: AtomicU64,
    /// Seconds the provider told us to wait last time; 0 = unknown.
    learned_cooldown_secs: AtomicU64,

    // Strategy scratch: token bucket (gemini) and rolling request window
    // (copilot). Unused fields stay zero for other providers.
    pub(crate) bucket_available: AtomicU64,
    pub(crate) bucket_refilled_at: AtomicI64,
    pub(crate) window_started_at: AtomicI64,
    pub(crate) window_count: AtomicU64,

    /// Latest reading from the provider's quota endpoint, when one exists.
    quota_snapshot: RwLock<Option<QuotaSnapshot>>,
}

impl AuthQuotaState {
    pub fn new() -> Self {
        Self::default()
    }

    // ── active requests ──────────────────────────────────────────────────

    pub fn active_requests(&self) -> u64 {
        self.active_requests.load(Ordering::Acquire)
    }

    pub fn incr_active(&self) {
        self.active_requests.fetch_add(1, Ordering::AcqRel);
    }

    /// Never goes below zero, even under racing decrements.
    pub fn decr_active(&self) {
        let mut current = self.active_requests.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return;
            }
            match self.active_requests.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    // ── cooldown ─────────────────────────────────────────────────────────

    pub fn cooldown_until(&self) -> i64 {
        self.cooldown_until.load(Ordering::Acquire)
    }

    pub fn in_cooldown(&self, now: i64) -> bool {
        now < self.cooldown_until()
    }

    /// Monotone: concurrent quota hits converge on the latest deadline.
    fn raise_cooldown(&self, until: i64) {
        let mut current = self.cooldown_until.load(Ordering::Acquire);
        while until > current {
            match self.cooldown_until.compare_exchange_weak(
                current,
                until,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    // ── usage learning ───────────────────────────────────────────────────

    pub fn total_tokens_used(&self) -> u64 {
        self.total_tokens_used.load(Ordering::Acquire)
    }

    pub fn add_tokens(&self, tokens: u64) {
        self.total_tokens_used.fetch_add(tokens, Ordering::AcqRel);
    }

    pub fn learned_limit(&self) -> u64 {
        self.learned_limit.load(Ordering::Acquire)
    }

    pub fn learned_cooldown(&self) -> Option<Duration> {
        match self.learned_cooldown_secs.load(Ordering::Acquire) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn last_exhausted_at(&self) -> i64 {
        self.last_exhausted_at.load(Ordering::Acquire)
    }

    /// Monotone max, mirroring `raise_cooldown`.
    fn learn_limit(&self, observed: u64) {
        let mut current = self.learned_limit.load(Ordering::Acquire);
        while observed > current {
            match self.learned_limit.compare_exchange_weak(
                current,
                observed,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(now) => current = now,
            }
        }
    }

    /// The provider refused for quota reasons. Learn from it and start the
    /// cooldown clock: explicit `cooldown` wins, then the learned one, then
    /// the 5 h default.
    pub fn record_quota_hit(&self, cooldown: Option<Duration>) {
        let now = now_nanos();
        self.last_exhausted_at.store(now, Ordering::Release);
        self.learn_limit(self.total_tokens_used());

        if let Some(cooldown) = cooldown {
            self.learned_cooldown_secs
                .store(cooldown.as_secs(), Ordering::Release);
        }
        let effective = cooldown
            .or_else(|| self.learned_cooldown())
            .unwrap_or(DEFAULT_COOLDOWN);
        self.raise_cooldown(now + effective.as_nanos() as i64);
        self.total_tokens_used.store(0, Ordering::Release);
    }

    // ── quota snapshot ───────────────────────────────────────────────────

    pub fn quota_snapshot(&self) -> Option<QuotaSnapshot> {
        *self.quota_snapshot.read().expect("snapshot lock poisoned")
    }

    pub fn set_quota_snapshot(&self, snapshot: QuotaSnapshot) {
        *self.quota_snapshot.write().expect("snapshot lock poisoned") = Some(snapshot);
    }

    // ── lifecycle ────────────────────────────────────────────────────────

    /// A state is deletable only when nothing references it: no in-flight
    /// requests, cooldown elapsed, and the last quota hit is old news.
    pub fn is_idle(&self, now: i64) -> bool {
        self.active_requests() == 0
            && now > self.cooldown_until()
            && now - self.last_exhausted_at() > STATE_RETENTION.as_nanos() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrement_never_goes_negative() {
        let state = AuthQuotaState::new();
        state.decr_active();
        assert_eq!(state.active_requests(), 0);
        state.incr_active();
        state.incr_active();
        state.decr_active();
        assert_eq!(state.active_requests(), 1);
    }

    #[test]
    fn cooldown_is_monotone() {
        let state = AuthQuotaState::new();
        state.record_quota_hit(Some(Duration::from_secs(3600)));
        let first = state.cooldown_until();
        state.record_quota_hit(Some(Duration::from_secs(60)));
        assert!(state.cooldown_until() >= first, "cooldown never shrinks");
    }

    #[test]
    fn quota_hit_learns_limit_and_resets_window() {
        let state = AuthQuotaState::new();
        state.add_tokens(10_000);
        state.record_quota_hit(None);
        assert_eq!(state.learned_limit(), 10_000);
        assert_eq!(state.total_tokens_used(), 0);
        assert!(state.in_cooldown(now_nanos()));

        // A smaller later observation does not lower the learned limit.
        state.add_tokens(100);
        state.record_quota_hit(None);
        assert_eq!(state.learned_limit(), 10_000);
    }

    #[test]
    fn explicit_cooldown_is_remembered() {
        let state = AuthQuotaState::new();
        state.record_quota_hit(Some(Duration::from_secs(1800)));
        assert_eq!(state.learned_cooldown(), Some(Duration::from_secs(1800)));
    }

    #[test]
    fn snapshot_freshness_window() {
        let now = now_nanos();
        let fresh = QuotaSnapshot {
            remaining_fraction: 0.5,
            window_reset_at: 0,
            fetched_at: now,
        };
        assert!(fresh.is_fresh(now));
        let stale = QuotaSnapshot {
            fetched_at: now - Duration::from_secs(301).as_nanos() as i64,
            ..fresh
        };
        assert!(!stale.is_fresh(now));
    }

    #[test]
    fn idle_requires_all_three_conditions() {
        let state = AuthQuotaState::new();
        let now = now_nanos();
        assert!(state.is_idle(now), "fresh state with no history is idle");

        state.incr_active();
        assert!(!state.is_idle(now));
        state.decr_active();

        state.record_quota_hit(Some(Duration::from_secs(1)));
        assert!(!state.is_idle(now_nanos()), "recent exhaustion pins the state");
    }
}
