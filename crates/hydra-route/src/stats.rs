//! Per-(provider, model) outcome stats, used to order providers by score.
//!
//! Sharded like the quota states; every field is atomic so recording an
//! outcome is a handful of relaxed adds on the request's way out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;

use crate::shard::{fnv1a, SHARD_COUNT};

/// Recency bonus decays linearly to zero over this window.
const RECENCY_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
pub struct PairStats {
    success: AtomicU64,
    failure: AtomicU64,
    /// Cumulative latency over successful calls, milliseconds.
    latency_ms_total: AtomicU64,
    /// Unix seconds.
    last_used_at: AtomicI64,
    last_success_at: AtomicI64,
}

impl PairStats {
    pub fn success_count(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failure.load(Ordering::Relaxed)
    }

    pub fn avg_latency_ms(&self) -> u64 {
        match self.success_count() {
            0 => 0,
            n => self.latency_ms_total.load(Ordering::Relaxed) / n,
        }
    }

    fn score(&self, now: i64) -> f64 {
        let success = self.success_count() as f64;
        let failure = self.failure_count() as f64;
        let total = success + failure;
        if total == 0.0 {
            return 0.5;
        }
        let success_rate = success / total;

        let last_success = self.last_success_at.load(Ordering::Relaxed);
        let age = (now - last_success).max(0) as f64;
        let window = RECENCY_WINDOW.as_secs() as f64;
        let recency_bonus = if last_success == 0 || age >= window {
            0.0
        } else {
            1.0 - age / window
        };
        0.9 * success_rate + 0.1 * recency_bonus
    }
}

/// Snapshot row for the observability surface.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsEntry {
    pub success: u64,
    pub failure: u64,
    pub avg_latency_ms: u64,
}

#[derive(Default)]
struct Shard {
    pairs: RwLock<HashMap<String, Arc<PairStats>>>,
}

pub struct ProviderStats {
    shards: Vec<Shard>,
}

impl Default for ProviderStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderStats {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Shard::default()).collect(),
        }
    }

    fn key(provider: &str, model: &str) -> String {
        format!("{provider}:{model}")
    }

    fn pair(&self, key: &str) -> Arc<PairStats> {
        let shard = &self.shards[(fnv1a(key) as usize) % SHARD_COUNT];
        if let Some(stats) = shard.pairs.read().expect("stats lock poisoned").get(key) {
            return Arc::clone(stats);
        }
        let mut pairs = shard.pairs.write().expect("stats lock poisoned");
        Arc::clone(
            pairs
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(PairStats::default())),
        )
    }

    pub fn record_success(&self, provider: &str, model: &str, latency: Duration) {
        let now = Utc::now().timestamp();
        let pair = self.pair(&Self::key(provider, model));
        pair.success.fetch_add(1, Ordering::Relaxed);
        pair.latency_ms_total
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        pair.last_used_at.store(now, Ordering::Relaxed);
        pair.last_success_at.store(now, Ordering::Relaxed);
    }

    pub fn record_failure(&self, provider: &str, model: &str) {
        let pair = self.pair(&Self::key(provider, model));
        pair.failure.fetch_add(1, Ordering::Relaxed);
        pair.last_used_at
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Score for ordering providers; unknown pairs sit at a neutral 0.5.
    pub fn score(&self, provider: &str, model: &str) -> f64 {
        let key = Self::key(provider, model);
        let shard = &self.shards[(fnv1a(&key) as usize) % SHARD_COUNT];
        let pairs = shard.pairs.read().expect("stats lock poisoned");
        match pairs.get(&key) {
            Some(pair) => pair.score(Utc::now().timestamp()),
            None => 0.5,
        }
    }

    /// `(provider:model)` → counters, for hosts to expose.
    pub fn snapshot(&self) -> HashMap<String, StatsEntry> {
        let mut out = HashMap::new();
        for shard in &self.shards {
            for (key, pair) in shard.pairs.read().expect("stats lock poisoned").iter() {
                out.insert(
                    key.clone(),
                    StatsEntry {
                        success: pair.success_count(),
                        failure: pair.failure_count(),
                        avg_latency_ms: pair.avg_latency_ms(),
                    },
                );
            }
        }
        out
    }
}
