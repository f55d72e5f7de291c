//! Error taxonomy for the feed, gateway, and store seams
//!
//! Transient kinds (`FeedError::Unavailable`, `GatewayError::Unavailable`,
//! `GatewayError::Timeout`) are recovered locally: skip the cycle or retry
//! with backoff. `GatewayError::Rejected` is final for the exact order
//! parameters. `StoreError::Corruption` is fatal for the affected symbol
//! only; the record is quarantined, never dropped.

use std::time::Duration;
use thiserror::Error;

/// Market data feed failures. All variants are transient: the monitoring
/// cycle for the affected symbol is skipped and retried on the next tick.
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    #[error("price feed unavailable: {0}")]
    Unavailable(String),
    #[error("malformed ticker response: {0}")]
    Malformed(String),
}

impl FeedError {
    /// Classify a reqwest transport error.
    pub fn from_network_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            FeedError::Unavailable("request timed out".to_string())
        } else if err.is_connect() {
            FeedError::Unavailable("connection failed".to_string())
        } else {
            FeedError::Unavailable(err.to_string())
        }
    }
}

/// Order gateway failures.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The venue refused the order. Final for these exact parameters.
    #[error("order rejected: {0}")]
    Rejected(String),
    /// Transport or venue-side failure; the order may not have reached the
    /// book. Retryable with backoff.
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    /// No response within the configured deadline. The order state is
    /// unknown; retryable, relying on the venue's client-order-id
    /// idempotency.
    #[error("order timed out after {0:?}")]
    Timeout(Duration),
}

impl GatewayError {
    /// Classify a non-success HTTP response from the venue.
    pub fn from_response(status: u16, body: &str) -> Self {
        if status == 429 || status >= 500 {
            return GatewayError::Unavailable(format!("HTTP {}: {}", status, body));
        }
        GatewayError::Rejected(format!("HTTP {}: {}", status, body))
    }

    /// Classify a reqwest transport error.
    pub fn from_network_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Unavailable("request timed out".to_string())
        } else if err.is_connect() {
            GatewayError::Unavailable("connection failed".to_string())
        } else {
            GatewayError::Unavailable(err.to_string())
        }
    }

    /// Whether this error is retryable with exponential backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_) | GatewayError::Timeout(_))
    }
}

/// Position store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A persisted record failed to decode. The row is quarantined in
    /// place and requires operator attention.
    #[error("corrupt position record for {symbol}: {detail}")]
    Corruption { symbol: String, detail: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
