//! Exchange-facing DTOs
//!
//! Response models are deliberately lenient: the exchange emits numbers as
//! strings on some endpoints, and metadata fields like `contract_value` can
//! be mixed strings (`"10 ARC"`). Request bodies are bit-exact per the API.

use super::signal::de_opt_f64;
use crate::types::Side;
use serde::{Deserialize, Serialize};

/// One product row from `GET /v2/products`
#[derive(Debug, Clone, Deserialize)]
pub struct Product {
    pub id: i64,
    pub symbol: String,
    /// Metadata fields that may carry the lot multiplier, in resolution order.
    /// Kept as raw JSON: the exchange mixes numbers and annotated strings.
    #[serde(default)]
    pub lot_size: Option<serde_json::Value>,
    #[serde(default)]
    pub contract_size: Option<serde_json::Value>,
    #[serde(default)]
    pub contract_value: Option<serde_json::Value>,
    #[serde(default)]
    pub contract_unit: Option<serde_json::Value>,
    #[serde(default)]
    pub qty_step: Option<serde_json::Value>,
}

/// One open order from `GET /v2/orders`
#[derive(Debug, Clone, Deserialize)]
pub struct OpenOrder {
    pub id: i64,
    #[serde(default)]
    pub product_id: Option<i64>,
    #[serde(default)]
    pub product_symbol: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub client_order_id: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub size: Option<f64>,
}

/// One position row from `GET /v2/positions`
#[derive(Debug, Clone, Deserialize)]
pub struct PositionRow {
    /// Raw signed size; units (lots vs coins) are inferred downstream
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub size: Option<f64>,
    #[serde(default)]
    pub product_id: Option<i64>,
    #[serde(default)]
    pub product_symbol: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub entry_price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub mark_price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub notional: Option<f64>,
}

impl PositionRow {
    /// Best available price for coin estimation: mark first, then entry
    pub fn reference_price(&self) -> Option<f64> {
        self.mark_price
            .filter(|p| *p > 0.0)
            .or(self.entry_price.filter(|p| *p > 0.0))
    }
}

/// Ticker row from `GET /v2/tickers?symbol=…`
#[derive(Debug, Clone, Deserialize)]
pub struct Ticker {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub mark_price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub spot_price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub close: Option<f64>,
}

impl Ticker {
    /// `mark_price`, then `spot_price`, then `close`
    pub fn best_price(&self) -> Option<f64> {
        self.mark_price
            .filter(|p| *p > 0.0)
            .or(self.spot_price.filter(|p| *p > 0.0))
            .or(self.close.filter(|p| *p > 0.0))
    }
}

// ─── Request bodies ─────────────────────────────────────────────────

/// Body for `POST /v2/orders`
#[derive(Debug, Clone, Serialize)]
pub struct NewOrderRequest {
    pub product_symbol: String,
    pub order_type: &'static str,
    pub side: Side,
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduce_only: Option<bool>,
}

impl NewOrderRequest {
    pub fn market(product_symbol: String, side: Side, size: i64) -> Self {
        Self {
            product_symbol,
            order_type: "market_order",
            side,
            size,
            reduce_only: None,
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = Some(true);
        self
    }
}

/// One leg of `POST /v2/orders/batch`
#[derive(Debug, Clone, Serialize)]
pub struct BatchLegRequest {
    pub limit_price: String,
    pub size: i64,
    pub side: Side,
    pub order_type: &'static str,
    pub reduce_only: bool,
    pub client_order_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mmp: Option<bool>,
}

/// Body for `POST /v2/orders/batch`
#[derive(Debug, Clone, Serialize)]
pub struct BatchOrdersRequest {
    pub product_id: i64,
    pub product_symbol: String,
    pub orders: Vec<BatchLegRequest>,
}

/// Body for `DELETE /v2/orders`
#[derive(Debug, Clone, Serialize)]
pub struct CancelOrderRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    pub product_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_position_row_lenient_size() {
        let row: PositionRow = serde_json::from_value(json!({
            "size": "-5", "product_symbol": "ARCUSD", "entry_price": "2.01"
        }))
        .unwrap();
        assert_eq!(row.size, Some(-5.0));
        assert_eq!(row.reference_price(), Some(2.01));
    }

    #[test]
    fn test_ticker_price_fallback_order() {
        let t: Ticker = serde_json::from_value(json!({"spot_price": "1.5", "close": 1.4})).unwrap();
        assert_eq!(t.best_price(), Some(1.5));
        let t: Ticker = serde_json::from_value(json!({"close": "1.4"})).unwrap();
        assert_eq!(t.best_price(), Some(1.4));
    }

    #[test]
    fn test_new_order_serializes_bit_exact() {
        let order = NewOrderRequest::market("ARCUSD".into(), Side::Buy, 48);
        let v = serde_json::to_value(&order).unwrap();
        assert_eq!(
            v,
            json!({"product_symbol": "ARCUSD", "order_type": "market_order", "side": "buy", "size": 48})
        );
    }

    #[test]
    fn test_cancel_order_omits_missing_id_fields() {
        let cancel = CancelOrderRequest {
            id: Some(12),
            client_order_id: None,
            product_id: 3,
        };
        let v = serde_json::to_value(&cancel).unwrap();
        assert_eq!(v, json!({"id": 12, "product_id": 3}));
    }
}
