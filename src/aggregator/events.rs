use rust_decimal::Decimal;

use super::account::Balance;
use super::types::{Asset, Exchange};
use crate::trading::{OrderStatus, OrderType, Side, TimeInForce};

/// Order lifecycle notification from a venue's user-data stream, normalized
/// across venues.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub symbol_alias: String,
    pub client_order_id: String,
    pub side: Side,
    pub order_type: OrderType,
    pub time_in_force: Option<TimeInForce>,
    pub volume: Decimal,
    pub price: Decimal,
    pub status: OrderStatus,
    pub order_id: String,
    pub filled_volume: Decimal,
    pub filled_quote_volume: Decimal,
    pub latest_price: Decimal,
    pub transaction_time: i64,
    pub is_maker: bool,
    pub create_time: i64,
}

/// Everything a venue's private stream can tell us, tagged with the venue and
/// the event timestamp (ms).
#[derive(Debug, Clone)]
pub enum UserDataEvent {
    /// Full balance snapshot for the touched assets.
    AccountPosition {
        exchange: Exchange,
        time: u64,
        updates: Vec<Balance>,
    },
    /// Single-asset delta (deposits, withdrawals, dust conversion).
    BalanceDelta {
        exchange: Exchange,
        time: u64,
        asset: Asset,
        delta: Decimal,
    },
    Order {
        exchange: Exchange,
        time: u64,
        update: Box<OrderUpdate>,
    },
}

impl UserDataEvent {
    pub fn time(&self) -> u64 {
        match self {
            UserDataEvent::AccountPosition { time, .. } => *time,
            UserDataEvent::BalanceDelta { time, .. } => *time,
            UserDataEvent::Order { time, .. } => *time,
        }
    }

    pub fn exchange(&self) -> Exchange {
        match self {
            UserDataEvent::AccountPosition { exchange, .. } => *exchange,
            UserDataEvent::BalanceDelta { exchange, .. } => *exchange,
            UserDataEvent::Order { exchange, .. } => *exchange,
        }
    }
}
