//! Retry budget and backoff delays.
//!
//! The budget is a token bucket shared by all retries: when a storm empties
//! it, retries are refused outright instead of piling more load onto an
//! already unhappy upstream. Delays are full-jitter exponential, with a
//! server-provided retry-after taking precedence (plus a small pad so we
//! land after the window opens, not on its edge).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Base delay of the exponential schedule.
const BASE_DELAY: Duration = Duration::from_secs(1);
/// Per-attempt cap.
const MAX_DELAY: Duration = Duration::from_secs(20);
/// Pad added on top of a server-provided retry-after.
const SERVER_HINT_PAD: Duration = Duration::from_millis(500);

/// Token-bucket retry budget. `try_acquire` before retrying, `release` when a
/// request settles without having needed its token.
pub struct RetryBudget {
    capacity: u64,
    available: AtomicU64,
}

impl RetryBudget {
    pub const DEFAULT_CAPACITY: u64 = 50;

    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            available: AtomicU64::new(capacity),
        }
    }

    pub fn available(&self) -> u64 {
        self.available.load(Ordering::Acquire)
    }

    /// Take one retry token; `false` means the budget is exhausted.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.available.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.available.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Return one token, saturating at capacity.
    pub fn release(&self) {
        let mut current = self.available.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                return;
            }
            match self.available.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

/// Delay before retry number `attempt` (0-based).
///
/// A server hint wins outright (padded, capped at `max` when one is given);
/// otherwise full jitter over `min(base·2^attempt, 20 s)`.
pub fn backoff_delay(attempt: u32, server_hint: Option<Duration>) -> Duration {
    if let Some(hint) = server_hint {
        return hint + SERVER_HINT_PAD;
    }
    let exp = BASE_DELAY
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(MAX_DELAY);
    // Full jitter: uniform in [0, exp].
    let span_ms = exp.as_millis() as u64;
    let jittered = rand::random::<u64>() % (span_ms + 1);
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_drains_and_refuses() {
        let budget = RetryBudget::new(2);
        assert!(budget.try_acquire());
        assert!(budget.try_acquire());
        assert!(!budget.try_acquire());
    }

    #[test]
    fn release_saturates_at_capacity() {
        let budget = RetryBudget::new(2);
        budget.release();
        budget.release();
        assert_eq!(budget.available(), 2);
        assert!(budget.try_acquire());
        budget.release();
        assert_eq!(budget.available(), 2);
    }

    #[test]
    fn server_hint_takes_precedence() {
        let delay = backoff_delay(0, Some(Duration::from_secs(7)));
        assert_eq!(delay, Duration::from_secs(7) + Duration::from_millis(500));
    }

    #[test]
    fn jittered_delay_stays_within_cap() {
        for attempt in 0..10 {
            let delay = backoff_delay(attempt, None);
            assert!(delay <= MAX_DELAY, "attempt {attempt} exceeded cap: {delay:?}");
        }
    }

    #[test]
    fn early_attempts_stay_under_their_exponential_bound() {
        for _ in 0..50 {
            assert!(backoff_delay(0, None) <= Duration::from_secs(1));
            assert!(backoff_delay(1, None) <= Duration::from_secs(2));
            assert!(backoff_delay(2, None) <= Duration::from_secs(4));
        }
    }
}
