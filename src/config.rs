//! Configuration management for the position lifecycle engine

use crate::retry::RetryConfig;
use anyhow::Result;
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

/// Engine configuration loaded from environment
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to SQLite database
    pub database_path: String,

    /// Exchange REST base URL
    pub exchange_base_url: String,

    /// Trailing stop distance below the high-water mark, in percent
    pub trailing_percent: Decimal,

    /// Minimum seconds between price observations per position
    pub poll_interval_seconds: u64,

    /// Consecutive exit failures before a position is escalated
    pub max_exit_failures: u32,

    /// Deadline for a single order gateway call, in seconds
    pub order_timeout_seconds: u64,

    /// Webhook URL for operator alerts (optional)
    pub alert_webhook_url: Option<String>,

    /// Retry behavior for gateway calls
    pub retry: RetryConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let database_path = env::var("DATABASE_PATH")
            .unwrap_or_else(|_| "trailguard.db".to_string());

        let exchange_base_url = env::var("EXCHANGE_BASE_URL")
            .unwrap_or_else(|_| "https://api.binance.com".to_string());

        let trailing_percent = env::var("TRAILING_PERCENT")
            .ok()
            .and_then(|v| Decimal::from_str(&v).ok())
            .unwrap_or_else(|| Decimal::from(2));

        let poll_interval_seconds = env::var("POLL_INTERVAL_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        let max_exit_failures = env::var("MAX_EXIT_FAILURES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);

        let order_timeout_seconds = env::var("ORDER_TIMEOUT_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let alert_webhook_url = env::var("ALERT_WEBHOOK_URL").ok().filter(|s| !s.is_empty());

        // Validate configuration
        if trailing_percent <= Decimal::ZERO || trailing_percent >= Decimal::ONE_HUNDRED {
            anyhow::bail!(
                "TRAILING_PERCENT must be between 0 and 100, got {}",
                trailing_percent
            );
        }
        if poll_interval_seconds == 0 {
            anyhow::bail!("POLL_INTERVAL_SECONDS must be at least 1");
        }

        Ok(Self {
            database_path,
            exchange_base_url,
            trailing_percent,
            poll_interval_seconds,
            max_exit_failures,
            order_timeout_seconds,
            alert_webhook_url,
            retry: RetryConfig::default(),
        })
    }
}
