//! Gateway error taxonomy.
//!
//! Every failure the dataplane can produce is one of these variants. The
//! manager uses `is_fallback`/`is_retriable` to decide between rotating to
//! the next credential/provider and retrying in place; hosts use `code()` and
//! `http_status()` to render the error to clients.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Upstream status codes worth one local retry against the same target.
const RETRIABLE_STATUSES: &[u16] = &[500];
/// Upstream status codes that should rotate to the next target immediately.
const FALLBACK_STATUSES: &[u16] = &[429, 502, 503, 504];

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("no credential registered for provider {0}")]
    AuthNotFound(String),

    #[error("no usable credential for provider {0}")]
    AuthUnavailable(String),

    #[error("quota exhausted for {provider}")]
    QuotaExhausted {
        provider: String,
        /// Earliest time any of the provider's credentials leaves cooldown.
        retry_after: Option<Duration>,
    },

    #[error("circuit open for provider {0}")]
    CircuitOpen(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("upstream returned {status}: {body}")]
    Status {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("malformed upstream payload: {0}")]
    Parse(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("request cancelled by client")]
    Cancelled,
}

impl GatewayError {
    /// Stable snake_case code, rendered to clients and plugins.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::ProviderNotFound(_) => "provider_not_found",
            GatewayError::AuthNotFound(_) => "auth_not_found",
            GatewayError::AuthUnavailable(_) => "auth_unavailable",
            GatewayError::QuotaExhausted { .. } => "quota_exhausted",
            GatewayError::CircuitOpen(_) => "circuit_open",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::Status { .. } => "status_error",
            GatewayError::Parse(_) => "parse_error",
            GatewayError::NotImplemented(_) => "not_implemented",
            GatewayError::Cancelled => "context_cancelled",
        }
    }

    /// HTTP status a host should answer the client with.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::ProviderNotFound(_) | GatewayError::AuthNotFound(_) => 404,
            GatewayError::AuthUnavailable(_) => 503,
            GatewayError::QuotaExhausted { .. } => 429,
            GatewayError::CircuitOpen(_) => 503,
            GatewayError::Timeout(_) => 504,
            GatewayError::Status { status, .. } => *status,
            GatewayError::Parse(_) => 502,
            GatewayError::NotImplemented(_) => 501,
            GatewayError::Cancelled => 499,
        }
    }

    /// Server-suggested wait before the same target is worth trying again.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::QuotaExhausted { retry_after, .. } => *retry_after,
            GatewayError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Should the manager move on to the next credential/provider right away?
    pub fn is_fallback(&self) -> bool {
        match self {
            GatewayError::QuotaExhausted { .. } | GatewayError::CircuitOpen(_) => true,
            GatewayError::Status { status, .. } => FALLBACK_STATUSES.contains(status),
            GatewayError::Parse(_) => true,
            _ => false,
        }
    }

    /// Is one in-place retry against the same target reasonable?
    pub fn is_retriable(&self) -> bool {
        match self {
            GatewayError::Timeout(_) => true,
            GatewayError::Status { status, .. } => {
                RETRIABLE_STATUSES.contains(status) || FALLBACK_STATUSES.contains(status)
            }
            GatewayError::QuotaExhausted { .. } | GatewayError::CircuitOpen(_) => true,
            _ => false,
        }
    }

    /// Client disconnects are not provider failures and must not feed the
    /// breaker or the stats.
    pub fn counts_as_provider_failure(&self) -> bool {
        !matches!(self, GatewayError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_500_is_retriable_not_fallback() {
        let e = GatewayError::Status {
            status: 500,
            body: String::new(),
            retry_after: None,
        };
        assert!(e.is_retriable());
        assert!(!e.is_fallback());
    }

    #[test]
    fn status_429_rotates() {
        let e = GatewayError::Status {
            status: 429,
            body: String::new(),
            retry_after: Some(Duration::from_secs(30)),
        };
        assert!(e.is_fallback());
        assert_eq!(e.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(e.http_status(), 429);
    }

    #[test]
    fn cancellation_is_not_a_provider_failure() {
        assert!(!GatewayError::Cancelled.counts_as_provider_failure());
        assert!(GatewayError::Timeout(Duration::from_secs(1)).counts_as_provider_failure());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            GatewayError::QuotaExhausted {
                provider: "claude".into(),
                retry_after: None
            }
            .code(),
            "quota_exhausted"
        );
        assert_eq!(GatewayError::Cancelled.code(), "context_cancelled");
    }
}
