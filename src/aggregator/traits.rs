use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::account::Account;
use super::events::UserDataEvent;
use super::types::{DepthInfo, Exchange, Symbol, SymbolBasicInfo};
use crate::error::AggregatorError;
use crate::trading::{CreateOrderResponse, Order, OrderPlan, OrderStatus};

/// Static venue metadata.
#[async_trait]
pub trait BaseInfoApi: Send + Sync {
    /// Venue server time in milliseconds.
    async fn server_time(&self) -> Result<i64, AggregatorError>;

    async fn symbol_basic_info(
        &self,
        symbol: &Symbol,
    ) -> Result<SymbolBasicInfo, AggregatorError>;
}

/// Public market data.
#[async_trait]
pub trait MarketApi: Send + Sync {
    /// One-shot snapshot of the top `limit` levels (0 means the default).
    async fn fetch_depth(
        &self,
        symbol: Symbol,
        limit: usize,
    ) -> Result<DepthInfo, AggregatorError>;

    /// Streams depth snapshots until `shutdown` is cancelled or the stream
    /// dies. Venues without a streaming transport return
    /// `UnsupportedOperation`.
    async fn ws_watch_market_depth(
        &self,
        shutdown: CancellationToken,
        out: mpsc::Sender<DepthInfo>,
        limit: usize,
        symbols: Vec<Symbol>,
    ) -> Result<(), AggregatorError>;

    fn is_watching(&self) -> bool;
}

/// Private account data.
#[async_trait]
pub trait AccountApi: Send + Sync {
    async fn account_info(&self) -> Result<Arc<Account>, AggregatorError>;

    /// Balance of `asset` as of stream start, cached from the first
    /// `account_info` call.
    async fn balance_at_start(
        &self,
        asset: &super::types::Asset,
    ) -> Result<super::account::Balance, AggregatorError>;

    /// Streams user-data events (balances, order updates) until cancelled or
    /// the stream dies.
    async fn ws_watch_user_data(
        &self,
        shutdown: CancellationToken,
        out: mpsc::Sender<UserDataEvent>,
    ) -> Result<(), AggregatorError>;
}

/// Order entry. Implementations gate mutating calls on system health.
#[async_trait]
pub trait OrderApi: Send + Sync {
    async fn list_open_orders(&self, symbol: &Symbol) -> Result<Vec<Order>, AggregatorError>;

    async fn create_order(
        &self,
        plan: &OrderPlan,
    ) -> Result<CreateOrderResponse, AggregatorError>;

    async fn get_order(
        &self,
        symbol: &Symbol,
        order_id: &str,
    ) -> Result<Order, AggregatorError>;

    async fn cancel_order(
        &self,
        symbol: &Symbol,
        order_id: &str,
    ) -> Result<OrderStatus, AggregatorError>;
}

/// One venue adapter: which surfaces it implements and handles to them.
/// Market data is mandatory; everything else is optional per venue.
pub trait ExchangeManager: Send + Sync {
    fn exchange(&self) -> Exchange;

    fn base_info(&self) -> Option<Arc<dyn BaseInfoApi>> {
        None
    }

    fn market(&self) -> Arc<dyn MarketApi>;

    fn account(&self) -> Option<Arc<dyn AccountApi>> {
        None
    }

    fn orders(&self) -> Option<Arc<dyn OrderApi>> {
        None
    }
}
