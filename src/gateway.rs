//! Order gateway seam and REST adapter
//!
//! Gateway calls carry a caller-generated client order id so a retried
//! submission is idempotent at the venue: a duplicate id is echoed or
//! rejected, never executed twice. A sell for a position already fully
//! sold comes back as `Rejected` (insufficient balance) rather than
//! silently overselling.

use crate::errors::GatewayError;
use crate::types::{OrderReceipt, OrderStatus, Side};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Market order placement against the exchange.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        client_order_id: &str,
    ) -> Result<OrderReceipt, GatewayError>;
}

/// Order endpoint adapter for a spot exchange REST API.
///
/// Every call is bounded by `order_timeout`; a hung venue cannot stall
/// the caller's task past the deadline.
pub struct RestGateway {
    client: reqwest::Client,
    base_url: String,
    order_timeout: Duration,
}

/// Raw order response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: serde_json::Value,
    status: String,
    #[serde(default)]
    fills: Vec<OrderFill>,
}

#[derive(Debug, Deserialize)]
struct OrderFill {
    price: String,
    qty: String,
}

impl RestGateway {
    pub fn new(base_url: String, order_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(order_timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url,
            order_timeout,
        }
    }

    fn parse_receipt(&self, raw: OrderResponse) -> Result<OrderReceipt, GatewayError> {
        let status = match raw.status.as_str() {
            "FILLED" => OrderStatus::Filled,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            other => {
                return Err(GatewayError::Rejected(format!(
                    "unexpected order status {:?}",
                    other
                )))
            }
        };

        let mut filled_quantity = Decimal::ZERO;
        let mut notional = Decimal::ZERO;
        for fill in &raw.fills {
            let price = Decimal::from_str(&fill.price)
                .map_err(|e| GatewayError::Unavailable(format!("fill price: {}", e)))?;
            let qty = Decimal::from_str(&fill.qty)
                .map_err(|e| GatewayError::Unavailable(format!("fill qty: {}", e)))?;
            filled_quantity += qty;
            notional += price * qty;
        }

        if filled_quantity.is_zero() {
            return Err(GatewayError::Rejected("order reported no fills".to_string()));
        }

        // Venues disagree on whether order ids are strings or integers
        let order_id = match raw.order_id.as_str() {
            Some(s) => s.to_string(),
            None => raw.order_id.to_string(),
        };

        Ok(OrderReceipt {
            order_id,
            fill_price: notional / filled_quantity,
            filled_quantity,
            status,
        })
    }
}

#[async_trait]
impl OrderGateway for RestGateway {
    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        client_order_id: &str,
    ) -> Result<OrderReceipt, GatewayError> {
        let url = format!("{}/api/v3/order", self.base_url);
        let body = json!({
            "symbol": symbol,
            "side": side.to_string(),
            "type": "MARKET",
            "quantity": quantity.to_string(),
            "newClientOrderId": client_order_id,
        });

        debug!("Submitting {} {} {} to {}", side, quantity, symbol, url);

        let request = self.client.post(&url).json(&body).send();
        let response = match timeout(self.order_timeout, request).await {
            Ok(result) => result.map_err(|e| GatewayError::from_network_error(&e))?,
            Err(_) => return Err(GatewayError::Timeout(self.order_timeout)),
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_response(status, &body));
        }

        let raw: OrderResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("malformed order response: {}", e)))?;

        let receipt = self.parse_receipt(raw)?;
        info!(
            "Order {} confirmed: {} {} {} at avg {}",
            receipt.order_id, side, receipt.filled_quantity, symbol, receipt.fill_price
        );
        Ok(receipt)
    }
}
