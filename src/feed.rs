//! Market data feed seam and REST adapter

use crate::errors::FeedError;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use tracing::debug;

/// Price snapshot source, shared read-mostly by every monitoring task.
#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    /// Current last-trade price for the symbol.
    async fn get_price(&self, symbol: &str) -> Result<Decimal, FeedError>;
}

/// Ticker endpoint adapter for a spot exchange REST API.
pub struct RestFeed {
    client: reqwest::Client,
    base_url: String,
}

/// Raw ticker response
#[derive(Debug, Deserialize)]
struct TickerResponse {
    #[serde(default)]
    symbol: String,
    #[serde(alias = "lastPrice")]
    price: String,
}

impl RestFeed {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, base_url }
    }
}

#[async_trait]
impl MarketDataFeed for RestFeed {
    async fn get_price(&self, symbol: &str) -> Result<Decimal, FeedError> {
        let url = format!(
            "{}/api/v3/ticker/price?symbol={}",
            self.base_url, symbol
        );

        debug!("Fetching ticker from: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FeedError::from_network_error(&e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::Unavailable(format!(
                "ticker {}: HTTP {}: {}",
                symbol, status, body
            )));
        }

        let ticker: TickerResponse = response
            .json()
            .await
            .map_err(|e| FeedError::Malformed(e.to_string()))?;

        if !ticker.symbol.is_empty() && ticker.symbol != symbol {
            return Err(FeedError::Malformed(format!(
                "asked for {}, venue answered for {}",
                symbol, ticker.symbol
            )));
        }

        Decimal::from_str(&ticker.price)
            .map_err(|e| FeedError::Malformed(format!("price {:?}: {}", ticker.price, e)))
    }
}
