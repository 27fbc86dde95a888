use rand::RngCore;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::aggregator::types::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
    LimitMaker,
    StopLoss,
    StopLossLimit,
    TakeProfit,
    TakeProfitLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    PendingCancel,
    Rejected,
    Expired,
    #[serde(other)]
    Unknown,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }
}

/// An order as the venue reports it back (open-order listings, lookups).
#[derive(Debug, Clone)]
pub struct Order {
    pub symbol_alias: String,
    pub order_id: String,
    pub client_order_id: String,
    pub side: Side,
    pub order_type: OrderType,
    pub time_in_force: Option<TimeInForce>,
    pub price: Decimal,
    pub orig_quantity: Decimal,
    pub executed_quantity: Decimal,
    pub cumulative_quote_quantity: Decimal,
    pub status: OrderStatus,
    pub time: i64,
    pub update_time: i64,
}

/// A new-order request before it is translated to a venue's wire format.
#[derive(Debug, Clone)]
pub struct OrderPlan {
    pub symbol: Symbol,
    pub side: Side,
    pub client_order_id: String,
    pub order_type: OrderType,
    pub time_in_force: Option<TimeInForce>,
    pub price: Option<Decimal>,
    pub quantity: Option<Decimal>,
    pub quote_order_qty: Option<Decimal>,
}

impl OrderPlan {
    pub fn limit(symbol: Symbol, side: Side, price: Decimal, quantity: Decimal) -> Self {
        OrderPlan {
            symbol,
            side,
            client_order_id: gen_client_order_id(),
            order_type: OrderType::Limit,
            time_in_force: Some(TimeInForce::Gtc),
            price: Some(price),
            quantity: Some(quantity),
            quote_order_qty: None,
        }
    }

    pub fn market(symbol: Symbol, side: Side, quantity: Decimal) -> Self {
        OrderPlan {
            symbol,
            side,
            client_order_id: gen_client_order_id(),
            order_type: OrderType::Market,
            time_in_force: None,
            price: None,
            quantity: Some(quantity),
            quote_order_qty: None,
        }
    }

    /// Market order sized in quote currency ("spend 100 USDT").
    pub fn market_with_quote_qty(symbol: Symbol, side: Side, quote_qty: Decimal) -> Self {
        OrderPlan {
            symbol,
            side,
            client_order_id: gen_client_order_id(),
            order_type: OrderType::Market,
            time_in_force: None,
            price: None,
            quantity: None,
            quote_order_qty: Some(quote_qty),
        }
    }

    /// Notional value (price * quantity) when both are set.
    pub fn amount(&self) -> Option<Decimal> {
        Some(self.price? * self.quantity?)
    }
}

#[derive(Debug, Clone)]
pub struct CreateOrderResponse {
    pub order_id: String,
    pub client_order_id: String,
}

/// Random 32-hex-char client order id, accepted by all supported venues.
pub fn gen_client_order_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::types::Asset;
    use std::str::FromStr;

    #[test]
    fn client_order_ids_are_unique_hex() {
        let a = gen_client_order_id();
        let b = gen_client_order_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn limit_plan_amount() {
        let plan = OrderPlan::limit(
            Symbol::new(Asset::new("ETH")),
            Side::Buy,
            Decimal::from_str("2000.5").unwrap(),
            Decimal::from_str("2").unwrap(),
        );
        assert_eq!(plan.amount(), Some(Decimal::from_str("4001.0").unwrap()));
        assert_eq!(plan.time_in_force, Some(TimeInForce::Gtc));
    }

    #[test]
    fn market_plan_has_no_amount() {
        let plan = OrderPlan::market(
            Symbol::new(Asset::new("ETH")),
            Side::Sell,
            Decimal::ONE,
        );
        assert_eq!(plan.amount(), None);
        assert!(plan.time_in_force.is_none());
    }

    #[test]
    fn order_status_decodes_unknown_variants() {
        let status: OrderStatus = serde_json::from_str("\"FILLED\"").unwrap();
        assert_eq!(status, OrderStatus::Filled);
        let status: OrderStatus = serde_json::from_str("\"SOME_FUTURE_STATE\"").unwrap();
        assert_eq!(status, OrderStatus::Unknown);
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
    }
}
