//! Usage reporting hooks for the host's metrics and plugins.

use std::sync::Mutex;
use std::time::Duration;

use hydra_protocol::Usage;

/// Outcome of one upstream attempt, published win or lose.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub auth_id: String,
    pub provider: String,
    pub model: String,
    pub success: bool,
    pub http_status: Option<u16>,
    pub error: Option<String>,
    pub retry_after: Option<Duration>,
    pub usage: Option<Usage>,
    pub latency: Duration,
}

/// Injected by the host; the dataplane calls it on every settled attempt.
pub trait UsageReporter: Send + Sync {
    fn publish(&self, record: &RequestRecord);

    fn publish_failure(&self, record: &RequestRecord) {
        self.publish(record);
    }

    /// Idempotent backstop for paths that may or may not have published
    /// already (idle-tripped streams).
    fn ensure_published(&self, record: &RequestRecord) {
        self.publish(record);
    }
}

/// Default reporter: drops everything.
pub struct NoopReporter;

impl UsageReporter for NoopReporter {
    fn publish(&self, _record: &RequestRecord) {}
}

/// Test helper that remembers what was published.
pub struct RecordingReporter {
    pub records: Mutex<Vec<RequestRecord>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }
}

impl Default for RecordingReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageReporter for RecordingReporter {
    fn publish(&self, record: &RequestRecord) {
        self.records
            .lock()
            .expect("reporter lock poisoned")
            .push(record.clone());
    }
}
