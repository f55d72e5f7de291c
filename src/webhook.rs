//! Webhook notifications for operator-visible events
//!
//! Escalations and completed exits are pushed to a configured webhook in
//! addition to the structured log. Delivery failures are logged and never
//! propagate into the trading path.

use crate::types::{Position, TradeRecord};
use reqwest::Client;
use serde_json::json;
use tracing::{error, info};

/// Webhook client for operator alerts
#[derive(Clone)]
pub struct OpsWebhook {
    client: Client,
    webhook_url: String,
}

impl OpsWebhook {
    /// Create a new webhook client
    pub fn new(webhook_url: String) -> Self {
        Self {
            client: Client::new(),
            webhook_url,
        }
    }

    /// Alert that a position needs manual intervention.
    pub async fn send_escalation(&self, position: &Position, reason: &str) {
        let payload = json!({
            "embeds": [{
                "title": format!("⚠️ Manual intervention required: {}", position.symbol),
                "description": reason,
                "color": 0xFF0000,  // Red
                "fields": [
                    {
                        "name": "Status",
                        "value": position.status.to_string(),
                        "inline": true
                    },
                    {
                        "name": "Quantity",
                        "value": position.quantity.to_string(),
                        "inline": true
                    },
                    {
                        "name": "Entry",
                        "value": position.entry_price.to_string(),
                        "inline": true
                    },
                    {
                        "name": "Failed attempts",
                        "value": position.exit_failures.to_string(),
                        "inline": true
                    }
                ],
                "timestamp": chrono::Utc::now().to_rfc3339()
            }]
        });

        self.post(payload, &position.symbol).await;
    }

    /// Alert that a stored record was quarantined as corrupt.
    pub async fn send_corruption(&self, symbol: &str, detail: &str) {
        let payload = json!({
            "embeds": [{
                "title": format!("🚨 Position record quarantined: {}", symbol),
                "description": detail,
                "color": 0xFF0000,  // Red
                "timestamp": chrono::Utc::now().to_rfc3339()
            }]
        });

        self.post(payload, symbol).await;
    }

    /// Report a completed exit with its realized PnL.
    pub async fn send_exit(&self, trade: &TradeRecord) {
        let payload = json!({
            "embeds": [{
                "title": format!("Trailing stop exit: {}", trade.symbol),
                "color": 0x00FF00,  // Green
                "fields": [
                    {
                        "name": "Entry",
                        "value": trade.entry_price.to_string(),
                        "inline": true
                    },
                    {
                        "name": "Exit",
                        "value": trade.exit_price.to_string(),
                        "inline": true
                    },
                    {
                        "name": "Peak",
                        "value": trade.peak_price.to_string(),
                        "inline": true
                    },
                    {
                        "name": "Quantity",
                        "value": trade.quantity.to_string(),
                        "inline": true
                    },
                    {
                        "name": "PnL",
                        "value": format!("{:.2}", trade.pnl),
                        "inline": true
                    }
                ],
                "timestamp": trade.closed_at.to_rfc3339()
            }]
        });

        self.post(payload, &trade.symbol).await;
    }

    async fn post(&self, payload: serde_json::Value, symbol: &str) {
        match self.client.post(&self.webhook_url).json(&payload).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    info!("Webhook alert sent for {}", symbol);
                } else {
                    error!("Webhook delivery failed: {}", response.status());
                }
            }
            Err(e) => {
                error!("Failed to send webhook: {}", e);
            }
        }
    }
}
