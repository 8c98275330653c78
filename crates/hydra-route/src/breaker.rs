//! Per-provider circuit breaker.
//!
//! Closed → Open when, with at least `min_requests` observed in the current
//! interval, either the consecutive-failure count or the failure ratio
//! crosses its threshold. Open → HalfOpen after `timeout`; HalfOpen admits at
//! most `max_requests` probes, one success closes the circuit, one failure
//! reopens it.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{info, warn};

use hydra_core::GatewayError;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Counter reset window while Closed.
    pub interval: Duration,
    /// Open → HalfOpen delay.
    pub timeout: Duration,
    /// Probe budget while HalfOpen.
    pub max_requests: u32,
    /// Minimum observations before the breaker may trip.
    pub min_requests: u64,
    pub failure_threshold: u64,
    pub failure_ratio: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            max_requests: 1,
            min_requests: 10,
            failure_threshold: 5,
            failure_ratio: 0.6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct ProviderBreaker {
    state: State,
    requests: u64,
    failures: u64,
    consecutive_failures: u64,
    opened_at: Instant,
    interval_start: Instant,
    half_open_inflight: u32,
}

impl ProviderBreaker {
    fn new() -> Self {
        Self {
            state: State::Closed,
            requests: 0,
            failures: 0,
            consecutive_failures: 0,
            opened_at: Instant::now(),
            interval_start: Instant::now(),
            half_open_inflight: 0,
        }
    }

    fn reset_counts(&mut self) {
        self.requests = 0;
        self.failures = 0;
        self.consecutive_failures = 0;
        self.interval_start = Instant::now();
    }
}

/// Errors the provider isn't to blame for don't trip the breaker.
pub type SuccessPredicate = fn(&GatewayError) -> bool;

/// Default: client-side errors (4xx other than 429) and cancellations count
/// as successes for breaker purposes.
pub fn default_is_successful(err: &GatewayError) -> bool {
    match err {
        GatewayError::Cancelled => true,
        GatewayError::Status { status, .. } => (400..500).contains(status) && *status != 429,
        GatewayError::NotImplemented(_) => true,
        _ => false,
    }
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    is_successful: SuccessPredicate,
    providers: DashMap<String, Mutex<ProviderBreaker>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            is_successful: default_is_successful,
            providers: DashMap::new(),
        }
    }

    pub fn with_success_predicate(mut self, predicate: SuccessPredicate) -> Self {
        self.is_successful = predicate;
        self
    }

    fn with_breaker<R>(&self, provider: &str, f: impl FnOnce(&mut ProviderBreaker) -> R) -> R {
        let entry = self
            .providers
            .entry(provider.to_string())
            .or_insert_with(|| Mutex::new(ProviderBreaker::new()));
        let mut breaker = entry.lock().expect("breaker lock poisoned");
        f(&mut breaker)
    }

    /// Is the provider currently rejecting calls?
    pub fn is_open(&self, provider: &str) -> bool {
        self.with_breaker(provider, |b| {
            b.state == State::Open && b.opened_at.elapsed() < self.config.timeout
        })
    }

    /// Admit or reject a call. On admission the caller MUST follow up with
    /// `record`.
    pub fn try_acquire(&self, provider: &str) -> Result<(), GatewayError> {
        let timeout = self.config.timeout;
        let interval = self.config.interval;
        let max_requests = self.config.max_requests;
        self.with_breaker(provider, |b| {
            match b.state {
                State::Closed => {
                    if b.interval_start.elapsed() >= interval {
                        b.reset_counts();
                    }
                    Ok(())
                }
                State::Open => {
                    if b.opened_at.elapsed() >= timeout {
                        info!(provider, "circuit half-open, admitting probe");
                        b.state = State::HalfOpen;
                        b.half_open_inflight = 1;
                        Ok(())
                    } else {
                        Err(GatewayError::CircuitOpen(provider.to_string()))
                    }
                }
                State::HalfOpen => {
                    if b.half_open_inflight < max_requests {
                        b.half_open_inflight += 1;
                        Ok(())
                    } else {
                        Err(GatewayError::CircuitOpen(provider.to_string()))
                    }
                }
            }
        })
    }

    /// Record the outcome of an admitted call.
    pub fn record(&self, provider: &str, outcome: Result<(), &GatewayError>) {
        let success = match outcome {
            Ok(()) => true,
            Err(err) => (self.is_successful)(err),
        };
        let config = self.config.clone();
        self.with_breaker(provider, |b| {
            if b.state == State::HalfOpen {
                b.half_open_inflight = b.half_open_inflight.saturating_sub(1);
            }
            match (b.state, success) {
                (State::HalfOpen, true) => {
                    info!(provider, "probe succeeded, circuit closed");
                    b.state = State::Closed;
                    b.reset_counts();
                }
                (State::HalfOpen, false) => {
                    warn!(provider, "probe failed, circuit reopened");
                    b.state = State::Open;
                    b.opened_at = Instant::now();
                }
                (State::Closed, true) => {
                    b.requests += 1;
                    b.consecutive_failures = 0;
                }
                (State::Closed, false) => {
                    b.requests += 1;
                    b.failures += 1;
                    b.consecutive_failures += 1;
                    let ratio = b.failures as f64 / b.requests.max(1) as f64;
                    if b.requests >= config.min_requests
                        && (b.consecutive_failures >= config.failure_threshold
                            || ratio >= config.failure_ratio)
                    {
                        warn!(
                            provider,
                            failures = b.failures,
                            consecutive = b.consecutive_failures,
                            "circuit opened"
                        );
                        b.state = State::Open;
                        b.opened_at = Instant::now();
                    }
                }
                (State::Open, _) => {}
            }
        });
    }

    /// Run `f` behind the breaker: rejects with `CircuitOpen` when open,
    /// otherwise classifies the outcome and updates state.
    pub async fn execute<T, F, Fut>(&self, provider: &str, f: F) -> Result<T, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, GatewayError>>,
    {
        self.try_acquire(provider)?;
        let result = f().await;
        self.record(provider, result.as_ref().map(|_| ()));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trip_config() -> BreakerConfig {
        BreakerConfig {
            interval: Duration::from_secs(60),
            timeout: Duration::from_millis(50),
            max_requests: 1,
            min_requests: 10,
            failure_threshold: 5,
            failure_ratio: 0.6,
        }
    }

    fn server_error() -> GatewayError {
        GatewayError::Status {
            status: 500,
            body: String::new(),
            retry_after: None,
        }
    }

    #[test]
    fn trips_after_consecutive_failures_past_minimum() {
        let breaker = CircuitBreaker::new(trip_config());
        for _ in 0..10 {
            breaker.try_acquire("p").unwrap();
            breaker.record("p", Err(&server_error()));
        }
        assert!(matches!(
            breaker.try_acquire("p"),
            Err(GatewayError::CircuitOpen(_))
        ));
    }

    #[test]
    fn below_min_requests_never_trips() {
        let breaker = CircuitBreaker::new(trip_config());
        for _ in 0..9 {
            breaker.try_acquire("p").unwrap();
            breaker.record("p", Err(&server_error()));
        }
        assert!(breaker.try_acquire("p").is_ok());
    }

    #[test]
    fn user_errors_do_not_count_as_failures() {
        let breaker = CircuitBreaker::new(trip_config());
        let bad_request = GatewayError::Status {
            status: 400,
            body: String::new(),
            retry_after: None,
        };
        for _ in 0..50 {
            breaker.try_acquire("p").unwrap();
            breaker.record("p", Err(&bad_request));
        }
        assert!(breaker.try_acquire("p").is_ok());
    }

    #[tokio::test]
    async fn half_open_probe_closes_on_success() {
        let breaker = CircuitBreaker::new(trip_config());
        for _ in 0..10 {
            breaker.try_acquire("p").unwrap();
            breaker.record("p", Err(&server_error()));
        }
        assert!(breaker.try_acquire("p").is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        // One probe admitted, a second concurrent one rejected.
        breaker.try_acquire("p").unwrap();
        assert!(breaker.try_acquire("p").is_err());
        breaker.record("p", Ok(()));

        assert!(breaker.try_acquire("p").is_ok());
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(trip_config());
        for _ in 0..10 {
            breaker.try_acquire("p").unwrap();
            breaker.record("p", Err(&server_error()));
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        breaker.try_acquire("p").unwrap();
        breaker.record("p", Err(&server_error()));
        assert!(matches!(
            breaker.try_acquire("p"),
            Err(GatewayError::CircuitOpen(_))
        ));
    }

    #[tokio::test]
    async fn execute_skips_fn_when_open() {
        let breaker = CircuitBreaker::new(trip_config());
        for _ in 0..10 {
            breaker.try_acquire("p").unwrap();
            breaker.record("p", Err(&server_error()));
        }
        let mut called = false;
        let result = breaker
            .execute("p", || {
                called = true;
                async { Ok::<_, GatewayError>(1) }
            })
            .await;
        assert!(matches!(result, Err(GatewayError::CircuitOpen(_))));
        assert!(!called, "fn must not run while the circuit is open");
    }
}
