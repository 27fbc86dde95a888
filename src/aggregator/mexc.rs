use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::account::{Account, Balance};
use super::alert::AlertDispatcher;
use super::events::{OrderUpdate, UserDataEvent};
use super::health::{ExchangeFeature, HealthChecker, HealthState};
use super::market::{FetchDepthFn, MarketManager};
use super::metrics::Metrics;
use super::traits::{AccountApi, ExchangeManager, MarketApi, OrderApi};
use super::types::{Asset, DepthInfo, Exchange, PriceLevel, Symbol};
use super::websocket::{MessageHandler, WsSession};
use crate::config::AggregatorConfig;
use crate::error::AggregatorError;
use crate::http::RestClient;
use crate::trading::{
    CreateOrderResponse, Order, OrderPlan, OrderStatus, OrderType, Side, TimeInForce,
};

const REST_URL: &str = "https://api.mexc.com";
const WS_URL: &str = "wss://wbs.mexc.com/ws";
const API_KEY_HEADER: &str = "X-MEXC-APIKEY";
const ACCOUNT_CHANNEL: &str = "spot@private.account.v3.api";
const ORDERS_CHANNEL: &str = "spot@private.orders.v3.api";
// MEXC expires an untouched listen key after 60 minutes.
const LISTEN_KEY_KEEPALIVE: Duration = Duration::from_secs(25 * 60);

fn symbol_alias(symbol: &Symbol) -> String {
    format!("{}{}", symbol.base, symbol.quote)
}

/// MEXC exposes a Binance-compatible REST surface. There is no public depth
/// stream here; market data is snapshot-only and depth watching reports
/// `UnsupportedOperation`.
pub struct MexcPlugin {
    market: Arc<MexcMarket>,
    account: Option<Arc<MexcAccount>>,
    orders: Option<Arc<MexcOrders>>,
}

impl MexcPlugin {
    pub fn new(
        config: &AggregatorConfig,
        health: HealthChecker,
        metrics: Arc<Metrics>,
        alerts: AlertDispatcher,
    ) -> Result<Self, AggregatorError> {
        let rest = RestClient::new(
            REST_URL,
            API_KEY_HEADER,
            config.mexc.clone(),
            config.timeout_ms,
        )?;

        let market = Arc::new(MexcMarket::new(rest.clone(), Arc::clone(&metrics)));
        let (account, orders) = if config.mexc.is_some() {
            let account = Arc::new(MexcAccount {
                rest: rest.clone(),
                health: health.clone(),
                metrics: Arc::clone(&metrics),
                alerts,
                start_account: tokio::sync::Mutex::new(None),
            });
            let orders = Arc::new(MexcOrders {
                rest,
                health,
                metrics,
            });
            (Some(account), Some(orders))
        } else {
            (None, None)
        };

        Ok(MexcPlugin {
            market,
            account,
            orders,
        })
    }
}

impl ExchangeManager for MexcPlugin {
    fn exchange(&self) -> Exchange {
        Exchange::Mexc
    }

    fn market(&self) -> Arc<dyn MarketApi> {
        Arc::clone(&self.market) as Arc<dyn MarketApi>
    }

    fn account(&self) -> Option<Arc<dyn AccountApi>> {
        self.account
            .as_ref()
            .map(|a| Arc::clone(a) as Arc<dyn AccountApi>)
    }

    fn orders(&self) -> Option<Arc<dyn OrderApi>> {
        self.orders
            .as_ref()
            .map(|o| Arc::clone(o) as Arc<dyn OrderApi>)
    }
}

// ---------------------------------------------------------------------------
// Market data (snapshot only)

#[derive(Debug, Deserialize)]
struct RestDepth {
    #[serde(rename = "lastUpdateId")]
    last_update_id: i64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

struct MexcMarket {
    manager: MarketManager,
}

impl MexcMarket {
    fn new(rest: RestClient, metrics: Arc<Metrics>) -> Self {
        let fetch: FetchDepthFn = Arc::new(move |symbol: Symbol, limit: usize| {
            let rest = rest.clone();
            let metrics = Arc::clone(&metrics);
            Box::pin(async move {
                let params = [
                    ("symbol", symbol_alias(&symbol)),
                    ("limit", limit.to_string()),
                ];
                let frame: RestDepth = match rest.get_public("/api/v3/depth", &params).await {
                    Ok(frame) => frame,
                    Err(err) => return DepthInfo::with_err(symbol, err),
                };
                let levels = |raw: &[[String; 2]]| {
                    raw.iter()
                        .map(|[p, q]| PriceLevel::from_strings(p, q))
                        .collect::<Result<Vec<_>, _>>()
                };
                match (levels(&frame.bids), levels(&frame.asks)) {
                    (Ok(bids), Ok(asks)) => {
                        metrics.depth_update_total.get(Exchange::Mexc).inc();
                        DepthInfo::new(symbol, frame.last_update_id, bids, asks)
                    }
                    (Err(err), _) | (_, Err(err)) => DepthInfo::with_err(symbol, err),
                }
            })
        });
        MexcMarket {
            manager: MarketManager::new(fetch, None),
        }
    }
}

#[async_trait]
impl MarketApi for MexcMarket {
    async fn fetch_depth(
        &self,
        symbol: Symbol,
        limit: usize,
    ) -> Result<DepthInfo, AggregatorError> {
        self.manager.fetch_depth(symbol, limit).await
    }

    async fn ws_watch_market_depth(
        &self,
        shutdown: CancellationToken,
        out: mpsc::Sender<DepthInfo>,
        limit: usize,
        symbols: Vec<Symbol>,
    ) -> Result<(), AggregatorError> {
        self.manager
            .ws_watch_market_depth(shutdown, out, limit, symbols)
            .await
    }

    fn is_watching(&self) -> bool {
        self.manager.is_watching()
    }
}

// ---------------------------------------------------------------------------
// User data

#[derive(Debug, Serialize)]
struct SubscriptionRequest {
    method: &'static str,
    params: Vec<&'static str>,
}

#[derive(Debug, Deserialize)]
struct ListenKeyResponse {
    #[serde(rename = "listenKey")]
    listen_key: String,
}

/// Private-stream envelope. Control messages (subscription acks, pongs) carry
/// no channel and are skipped.
#[derive(Debug, Deserialize)]
struct PrivateFrame {
    #[serde(rename = "c")]
    channel: Option<String>,
    #[serde(rename = "t", default)]
    time: u64,
    #[serde(rename = "s")]
    symbol: Option<String>,
    #[serde(rename = "d")]
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AccountPayload {
    #[serde(rename = "a")]
    asset: String,
    #[serde(rename = "f")]
    free: Decimal,
    #[serde(rename = "l")]
    locked: Decimal,
}

#[derive(Debug, Deserialize)]
struct OrderPayload {
    #[serde(rename = "i")]
    order_id: String,
    #[serde(rename = "c", default)]
    client_order_id: String,
    #[serde(rename = "S")]
    side: u8,
    #[serde(rename = "o")]
    order_type: u8,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "v")]
    quantity: Decimal,
    #[serde(rename = "s")]
    status: u8,
    #[serde(rename = "cv", default)]
    filled_quantity: Decimal,
    #[serde(rename = "ca", default)]
    filled_amount: Decimal,
    #[serde(rename = "ap", default)]
    avg_price: Decimal,
    #[serde(rename = "O", default)]
    create_time: i64,
    #[serde(rename = "m", default)]
    is_maker: bool,
}

fn decode_side(raw: u8) -> Result<Side, AggregatorError> {
    match raw {
        1 => Ok(Side::Buy),
        2 => Ok(Side::Sell),
        other => Err(AggregatorError::ExchangeError(format!(
            "unknown order side {other}"
        ))),
    }
}

fn decode_order_type(raw: u8) -> (OrderType, Option<TimeInForce>) {
    match raw {
        1 => (OrderType::Limit, Some(TimeInForce::Gtc)),
        2 => (OrderType::LimitMaker, None),
        3 => (OrderType::Limit, Some(TimeInForce::Ioc)),
        4 => (OrderType::Limit, Some(TimeInForce::Fok)),
        5 => (OrderType::Market, None),
        _ => (OrderType::Limit, None),
    }
}

fn decode_status(raw: u8) -> OrderStatus {
    match raw {
        1 => OrderStatus::New,
        2 => OrderStatus::Filled,
        3 => OrderStatus::PartiallyFilled,
        4 => OrderStatus::Canceled,
        5 => OrderStatus::PendingCancel,
        _ => OrderStatus::Unknown,
    }
}

impl OrderPayload {
    fn into_update(self, symbol_alias: String) -> Result<OrderUpdate, AggregatorError> {
        let side = decode_side(self.side)?;
        let (order_type, time_in_force) = decode_order_type(self.order_type);
        Ok(OrderUpdate {
            symbol_alias,
            client_order_id: self.client_order_id,
            side,
            order_type,
            time_in_force,
            volume: self.quantity,
            price: self.price,
            status: decode_status(self.status),
            order_id: self.order_id,
            filled_volume: self.filled_quantity,
            filled_quote_volume: self.filled_amount,
            latest_price: self.avg_price,
            transaction_time: self.create_time,
            is_maker: self.is_maker,
            create_time: self.create_time,
        })
    }
}

struct MexcAccount {
    rest: RestClient,
    health: HealthChecker,
    metrics: Arc<Metrics>,
    alerts: AlertDispatcher,
    start_account: tokio::sync::Mutex<Option<Arc<Account>>>,
}

impl MexcAccount {
    async fn listen_key(&self) -> Result<String, AggregatorError> {
        let res: ListenKeyResponse = self
            .rest
            .call_signed(reqwest::Method::POST, "/api/v3/userDataStream", &[])
            .await?;
        Ok(res.listen_key)
    }
}

type RefreshFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), AggregatorError>> + Send + Sync>;

/// Refreshes the listen key on every tick until `shutdown` is cancelled.
/// A failed refresh alerts and keeps ticking; the stream may still outlive it.
fn spawn_listen_key_keepalive(
    interval: Duration,
    shutdown: CancellationToken,
    refresh: RefreshFn,
    alerts: AlertDispatcher,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => return,
            }
            match refresh().await {
                Ok(()) => info!("MEXC listen key refreshed"),
                Err(err) => {
                    alerts.notify_now(
                        Some(err),
                        "failed to refresh MEXC listen key",
                        "MEXC user data",
                    );
                }
            }
        }
    });
}

fn decode_private_frame(
    payload: &[u8],
    metrics: &Metrics,
) -> Result<Option<UserDataEvent>, AggregatorError> {
    let frame: PrivateFrame = serde_json::from_slice(payload)
        .map_err(|e| AggregatorError::ExchangeError(format!("user data frame: {e}")))?;
    let Some(channel) = frame.channel else {
        return Ok(None);
    };
    let Some(data) = frame.data else {
        return Ok(None);
    };

    let now = chrono::Utc::now().timestamp_millis();
    metrics
        .user_data_watch_latency
        .get(Exchange::Mexc)
        .observe_ms(now - frame.time as i64);

    if channel.starts_with(ACCOUNT_CHANNEL) {
        let payload: AccountPayload = serde_json::from_value(data)
            .map_err(|e| AggregatorError::ExchangeError(format!("account payload: {e}")))?;
        return Ok(Some(UserDataEvent::AccountPosition {
            exchange: Exchange::Mexc,
            time: frame.time,
            updates: vec![Balance {
                asset: Asset::new(&payload.asset),
                free: payload.free,
                locked: payload.locked,
            }],
        }));
    }
    if channel.starts_with(ORDERS_CHANNEL) {
        let payload: OrderPayload = serde_json::from_value(data)
            .map_err(|e| AggregatorError::ExchangeError(format!("order payload: {e}")))?;
        let alias = frame.symbol.unwrap_or_default();
        return Ok(Some(UserDataEvent::Order {
            exchange: Exchange::Mexc,
            time: frame.time,
            update: Box::new(payload.into_update(alias)?),
        }));
    }
    Ok(None)
}

#[async_trait]
impl AccountApi for MexcAccount {
    async fn account_info(&self) -> Result<Arc<Account>, AggregatorError> {
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RestAccount {
            can_trade: bool,
            can_withdraw: bool,
            can_deposit: bool,
            #[serde(default)]
            update_time: u64,
            balances: Vec<RestBalance>,
        }
        #[derive(Debug, Deserialize)]
        struct RestBalance {
            asset: String,
            free: Decimal,
            locked: Decimal,
        }

        let raw: RestAccount = self
            .rest
            .call_signed(reqwest::Method::GET, "/api/v3/account", &[])
            .await?;
        let balances = raw
            .balances
            .into_iter()
            .map(|b| Balance {
                asset: Asset::new(&b.asset),
                free: b.free,
                locked: b.locked,
            })
            .collect();
        let mut account = Account::new(raw.update_time, balances);
        account.can_trade = raw.can_trade;
        account.can_withdraw = raw.can_withdraw;
        account.can_deposit = raw.can_deposit;
        Ok(Arc::new(account))
    }

    async fn balance_at_start(&self, asset: &Asset) -> Result<Balance, AggregatorError> {
        let mut cached = self.start_account.lock().await;
        if cached.is_none() {
            *cached = Some(self.account_info().await?);
        }
        let account = cached.as_ref().map(Arc::clone);
        drop(cached);
        match account {
            Some(account) => Ok(account.balance(asset)),
            None => Err(AggregatorError::AssetNotFound(asset.to_string())),
        }
    }

    async fn ws_watch_user_data(
        &self,
        shutdown: CancellationToken,
        out: mpsc::Sender<UserDataEvent>,
    ) -> Result<(), AggregatorError> {
        let listen_key = self.listen_key().await?;
        let endpoint = format!("{}?listenKey={}", WS_URL, listen_key);

        let refresh_rest = self.rest.clone();
        let refresh: RefreshFn = Arc::new(move || {
            let rest = refresh_rest.clone();
            let listen_key = listen_key.clone();
            Box::pin(async move {
                let params = [("listenKey", listen_key)];
                rest.call_signed::<serde_json::Value>(
                    reqwest::Method::PUT,
                    "/api/v3/userDataStream",
                    &params,
                )
                .await?;
                Ok(())
            })
        });
        spawn_listen_key_keepalive(
            LISTEN_KEY_KEEPALIVE,
            shutdown.clone(),
            refresh,
            self.alerts.clone(),
        );

        let (err_tx, mut err_rx) = mpsc::channel::<AggregatorError>(1);
        let metrics = Arc::clone(&self.metrics);
        let handler: MessageHandler = Arc::new(move |payload: Vec<u8>| {
            let out = out.clone();
            let err_tx = err_tx.clone();
            let metrics = Arc::clone(&metrics);
            Box::pin(async move {
                match decode_private_frame(&payload, &metrics) {
                    Ok(Some(event)) => {
                        let _ = out.send(event).await;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        let _ = err_tx.try_send(err);
                    }
                }
            })
        });

        let session = WsSession::connect(&endpoint, handler, self.alerts.clone()).await?;
        session
            .write(&SubscriptionRequest {
                method: "SUBSCRIPTION",
                params: vec![ACCOUNT_CHANNEL, ORDERS_CHANNEL],
            })
            .await;
        self.health
            .declare(ExchangeFeature::MexcUserDataWatch, HealthState::Healthy);
        info!("MEXC user data watch connected");

        let result = tokio::select! {
            _ = session.wait_closed() => {
                Err(AggregatorError::WebsocketError("user data stream closed".into()))
            }
            _ = shutdown.cancelled() => {
                session.close(Some(AggregatorError::Cancelled)).await;
                Ok(())
            }
            Some(err) = err_rx.recv() => {
                error!(%err, "MEXC user data frame rejected");
                session.close(Some(err.clone())).await;
                Err(err)
            }
        };
        self.health
            .declare(ExchangeFeature::MexcUserDataWatch, HealthState::Unhealthy);
        result
    }
}

// ---------------------------------------------------------------------------
// Order entry (Binance-compatible REST shapes)

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestNewOrder {
    order_id: String,
    #[serde(default)]
    client_order_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestOrder {
    symbol: String,
    order_id: String,
    #[serde(default)]
    client_order_id: String,
    price: Decimal,
    orig_qty: Decimal,
    executed_qty: Decimal,
    cummulative_quote_qty: Decimal,
    status: OrderStatus,
    time_in_force: Option<TimeInForce>,
    #[serde(rename = "type")]
    order_type: OrderType,
    side: Side,
    #[serde(default)]
    time: i64,
    #[serde(default)]
    update_time: i64,
}

impl RestOrder {
    fn into_order(self) -> Order {
        Order {
            symbol_alias: self.symbol,
            order_id: self.order_id,
            client_order_id: self.client_order_id,
            side: self.side,
            order_type: self.order_type,
            time_in_force: self.time_in_force,
            price: self.price,
            orig_quantity: self.orig_qty,
            executed_quantity: self.executed_qty,
            cumulative_quote_quantity: self.cummulative_quote_qty,
            status: self.status,
            time: self.time,
            update_time: self.update_time,
        }
    }
}

struct MexcOrders {
    rest: RestClient,
    health: HealthChecker,
    metrics: Arc<Metrics>,
}

#[async_trait]
impl OrderApi for MexcOrders {
    async fn list_open_orders(&self, symbol: &Symbol) -> Result<Vec<Order>, AggregatorError> {
        let params = [("symbol", symbol_alias(symbol))];
        let orders: Vec<RestOrder> = self
            .rest
            .call_signed(reqwest::Method::GET, "/api/v3/openOrders", &params)
            .await?;
        Ok(orders.into_iter().map(RestOrder::into_order).collect())
    }

    async fn create_order(
        &self,
        plan: &OrderPlan,
    ) -> Result<CreateOrderResponse, AggregatorError> {
        if !self.health.is_all_features_healthy() {
            return Err(AggregatorError::SystemUnhealthy);
        }

        let side = match plan.side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let order_type = match plan.order_type {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
            OrderType::LimitMaker => "LIMIT_MAKER",
            other => {
                return Err(AggregatorError::ExchangeError(format!(
                    "order type {other:?} not supported on MEXC"
                )))
            }
        };

        let mut params = vec![
            ("symbol", symbol_alias(&plan.symbol)),
            ("side", side.to_string()),
            ("type", order_type.to_string()),
            ("newClientOrderId", plan.client_order_id.clone()),
        ];
        if let Some(price) = plan.price {
            params.push(("price", price.to_string()));
        }
        if let Some(quantity) = plan.quantity {
            params.push(("quantity", quantity.to_string()));
        }
        if let Some(quote_qty) = plan.quote_order_qty {
            params.push(("quoteOrderQty", quote_qty.to_string()));
        }

        let started = std::time::Instant::now();
        let res: RestNewOrder = self
            .rest
            .call_signed(reqwest::Method::POST, "/api/v3/order", &params)
            .await?;
        self.metrics
            .order_create_latency
            .get(Exchange::Mexc)
            .observe_ms(started.elapsed().as_millis() as i64);
        info!(
            order_id = %res.order_id,
            client_order_id = %res.client_order_id,
            "MEXC order created"
        );
        Ok(CreateOrderResponse {
            order_id: res.order_id,
            client_order_id: res.client_order_id,
        })
    }

    async fn get_order(
        &self,
        symbol: &Symbol,
        order_id: &str,
    ) -> Result<Order, AggregatorError> {
        let params = [
            ("symbol", symbol_alias(symbol)),
            ("orderId", order_id.to_string()),
        ];
        let order: RestOrder = self
            .rest
            .call_signed(reqwest::Method::GET, "/api/v3/order", &params)
            .await?;
        Ok(order.into_order())
    }

    async fn cancel_order(
        &self,
        symbol: &Symbol,
        order_id: &str,
    ) -> Result<OrderStatus, AggregatorError> {
        #[derive(Debug, Deserialize)]
        struct RestCancel {
            status: OrderStatus,
        }
        let params = [
            ("symbol", symbol_alias(symbol)),
            ("orderId", order_id.to_string()),
        ];
        let res: RestCancel = self
            .rest
            .call_signed(reqwest::Method::DELETE, "/api/v3/order", &params)
            .await?;
        warn!(order_id, status = ?res.status, "MEXC order cancelled");
        Ok(res.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn rest_depth_parses_binance_compatible_shape() {
        let raw = r#"{
            "lastUpdateId": 1909891,
            "bids": [["1621.50", "0.01"]],
            "asks": [["1621.60", "0.02"], ["1621.70", "1.00"]]
        }"#;
        let depth: RestDepth = serde_json::from_str(raw).unwrap();
        assert_eq!(depth.last_update_id, 1909891);
        assert_eq!(depth.asks.len(), 2);
    }

    #[test]
    fn account_frame_decodes_to_position_event() {
        let raw = r#"{
            "c": "spot@private.account.v3.api",
            "d": {
                "a": "USDT",
                "c": 1678185928428,
                "f": "302.185113007893322435",
                "fd": "-4.990689704",
                "l": "4.990689704",
                "ld": "4.990689704",
                "o": "ENTRUST_PLACE"
            },
            "t": 1678185928435
        }"#;
        let metrics = Metrics::default();
        let event = decode_private_frame(raw.as_bytes(), &metrics)
            .unwrap()
            .unwrap();
        let UserDataEvent::AccountPosition { time, updates, .. } = event else {
            panic!("expected account position");
        };
        assert_eq!(time, 1678185928435);
        assert_eq!(updates[0].asset, Asset::new("USDT"));
        assert_eq!(
            updates[0].locked,
            Decimal::from_str("4.990689704").unwrap()
        );
        assert_eq!(metrics.user_data_watch_latency.get(Exchange::Mexc).count(), 1);
    }

    #[test]
    fn order_frame_decodes_sides_and_statuses() {
        let raw = r#"{
            "c": "spot@private.orders.v3.api",
            "s": "ETHUSDT",
            "d": {
                "i": "e03a5c7441e44ed899466a7140b71391",
                "c": "myid42",
                "S": 1,
                "o": 1,
                "p": "1682.32",
                "v": "0.003",
                "s": 2,
                "cv": "0.003",
                "ca": "5.04696",
                "ap": "1682.32",
                "O": 1661938138000,
                "m": true
            },
            "t": 1661938138193
        }"#;
        let metrics = Metrics::default();
        let event = decode_private_frame(raw.as_bytes(), &metrics)
            .unwrap()
            .unwrap();
        let UserDataEvent::Order { update, .. } = event else {
            panic!("expected order event");
        };
        assert_eq!(update.symbol_alias, "ETHUSDT");
        assert_eq!(update.side, Side::Buy);
        assert_eq!(update.status, OrderStatus::Filled);
        assert_eq!(update.order_type, OrderType::Limit);
        assert_eq!(update.time_in_force, Some(TimeInForce::Gtc));
        assert!(update.is_maker);
    }

    #[test]
    fn control_frames_are_skipped() {
        let metrics = Metrics::default();
        let ack = r#"{"id":0,"code":0,"msg":"spot@private.account.v3.api"}"#;
        assert!(decode_private_frame(ack.as_bytes(), &metrics)
            .unwrap()
            .is_none());
        let pong = r#"{"id":0,"code":0,"msg":"PONG"}"#;
        assert!(decode_private_frame(pong.as_bytes(), &metrics)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn listen_key_keepalive_refreshes_until_cancelled() {
        use std::sync::atomic::{AtomicU64, Ordering};

        let calls = Arc::new(AtomicU64::new(0));
        let shutdown = CancellationToken::new();
        let counter = Arc::clone(&calls);
        let refresh: RefreshFn = Arc::new(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        spawn_listen_key_keepalive(
            Duration::from_millis(20),
            shutdown.clone(),
            refresh,
            AlertDispatcher::default(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(calls.load(Ordering::SeqCst) >= 2);

        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let after_cancel = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_cancel);
    }

    #[tokio::test]
    async fn create_order_is_gated_before_any_network_call() {
        use crate::config::Credentials;
        use crate::trading::OrderPlan;

        let health = HealthChecker::new(ExchangeFeature::all_features());
        let metrics = Arc::new(Metrics::default());
        let orders = MexcOrders {
            rest: RestClient::new(REST_URL, API_KEY_HEADER, Some(Credentials::new("k", "s")), 1000)
                .unwrap(),
            health,
            metrics: Arc::clone(&metrics),
        };
        let plan = OrderPlan::limit(
            Symbol::new(Asset::new("ETH")),
            Side::Buy,
            Decimal::from(2000),
            Decimal::ONE,
        );
        let err = orders.create_order(&plan).await.unwrap_err();
        assert!(matches!(err, AggregatorError::SystemUnhealthy));
        // The gate fires before placement, so no latency is recorded.
        assert_eq!(metrics.order_create_latency.get(Exchange::Mexc).count(), 0);
    }

    #[test]
    fn unknown_side_is_a_parse_error() {
        let raw = r#"{
            "c": "spot@private.orders.v3.api",
            "s": "ETHUSDT",
            "d": {"i": "1", "S": 7, "o": 1, "p": "1", "v": "1", "s": 1},
            "t": 1
        }"#;
        let metrics = Metrics::default();
        let err = decode_private_frame(raw.as_bytes(), &metrics).unwrap_err();
        assert!(matches!(err, AggregatorError::ExchangeError(_)));
    }
}
