//! Shared HTTP clients.
//!
//! One process-wide client carries all direct traffic; credentials with a
//! proxy URL get their own client from an LRU-ish cache (capped, idle-expired,
//! swept periodically) so a thousand proxied accounts don't mean a thousand
//! connection pools living forever.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const POOL_MAX_IDLE_PER_HOST: usize = 100;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP2_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const HTTP2_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(15);

/// Proxy cache bounds.
const CACHE_MAX_ENTRIES: usize = 100;
const CACHE_IDLE_EXPIRY: Duration = Duration::from_secs(30 * 60);
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

fn build_client(proxy: Option<&str>) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .connect_timeout(TLS_HANDSHAKE_TIMEOUT)
        .http2_keep_alive_interval(HTTP2_KEEPALIVE_INTERVAL)
        .http2_keep_alive_timeout(HTTP2_KEEPALIVE_TIMEOUT)
        .http2_keep_alive_while_idle(true)
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .tcp_keepalive(Duration::from_secs(60));
    if let Some(proxy_url) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
    }
    builder.build()
}

/// The process-wide direct (no-proxy) client.
pub fn shared_client() -> reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT
        .get_or_init(|| build_client(None).expect("default client must build"))
        .clone()
}

struct CachedClient {
    client: reqwest::Client,
    /// Unix seconds of last checkout.
    last_used: std::sync::atomic::AtomicI64,
}

/// Proxy URL → client. Misconfigured proxies fall back to the shared client
/// rather than failing the request outright.
#[derive(Default)]
pub struct ClientCache {
    clients: DashMap<String, Arc<CachedClient>>,
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client for `proxy`; `None` returns the shared direct client.
    pub fn client_for(&self, proxy: Option<&str>) -> reqwest::Client {
        let Some(proxy_url) = proxy.filter(|p| !p.is_empty()) else {
            return shared_client();
        };

        if let Some(cached) = self.clients.get(proxy_url) {
            cached
                .last_used
                .store(Utc::now().timestamp(), std::sync::atomic::Ordering::Relaxed);
            return cached.client.clone();
        }

        let client = match build_client(Some(proxy_url)) {
            Ok(client) => client,
            Err(err) => {
                warn!(proxy = %proxy_url, error = %err, "bad proxy config, using direct client");
                return shared_client();
            }
        };

        if self.clients.len() >= CACHE_MAX_ENTRIES {
            self.evict_oldest();
        }
        self.clients.insert(
            proxy_url.to_string(),
            Arc::new(CachedClient {
                client: client.clone(),
                last_used: std::sync::atomic::AtomicI64::new(Utc::now().timestamp()),
            }),
        );
        client
    }

    fn evict_oldest(&self) {
        let oldest = self
            .clients
            .iter()
            .min_by_key(|entry| {
                entry
                    .value()
                    .last_used
                    .load(std::sync::atomic::Ordering::Relaxed)
            })
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.clients.remove(&key);
        }
    }

    /// Drop entries idle past the expiry. Returns how many went.
    pub fn sweep(&self) -> usize {
        let cutoff = Utc::now().timestamp() - CACHE_IDLE_EXPIRY.as_secs() as i64;
        let before = self.clients.len();
        self.clients.retain(|_, cached| {
            cached.last_used.load(std::sync::atomic::Ordering::Relaxed) > cutoff
        });
        before - self.clients.len()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Periodic sweep until the token cancels.
    pub fn spawn_sweeper(self: &Arc<Self>, stop: CancellationToken) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(CACHE_SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tick.tick() => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            debug!(removed, "proxy client cache sweep");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_proxy_returns_shared_client() {
        let cache = ClientCache::new();
        cache.client_for(None);
        cache.client_for(Some(""));
        assert!(cache.is_empty(), "direct traffic never populates the cache");
    }

    #[test]
    fn same_proxy_reuses_cached_client() {
        let cache = ClientCache::new();
        cache.client_for(Some("http://proxy-a:8080"));
        cache.client_for(Some("http://proxy-a:8080"));
        cache.client_for(Some("http://proxy-b:8080"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn cache_stays_bounded() {
        let cache = ClientCache::new();
        for i in 0..CACHE_MAX_ENTRIES + 20 {
            cache.client_for(Some(&format!("http://proxy-{i}:8080")));
        }
        assert!(cache.len() <= CACHE_MAX_ENTRIES);
    }

    #[test]
    fn invalid_proxy_falls_back_to_direct() {
        let cache = ClientCache::new();
        cache.client_for(Some("::not a url::"));
        assert!(cache.is_empty());
    }
}
