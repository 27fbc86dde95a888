use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::account::{Account, Balance};
use super::alert::AlertDispatcher;
use super::events::{OrderUpdate, UserDataEvent};
use super::health::{ExchangeFeature, HealthChecker, HealthState};
use super::market::{FetchDepthFn, MarketManager, WatchDepthFn};
use super::metrics::Metrics;
use super::traits::{AccountApi, BaseInfoApi, ExchangeManager, MarketApi, OrderApi};
use super::types::{Asset, DepthInfo, Exchange, PriceLevel, Symbol, SymbolBasicInfo};
use super::websocket::{MessageHandler, WsSession};
use crate::config::AggregatorConfig;
use crate::error::AggregatorError;
use crate::http::RestClient;
use crate::trading::{
    CreateOrderResponse, Order, OrderPlan, OrderStatus, OrderType, Side, TimeInForce,
};

const REST_URL: &str = "https://api.binance.com";
const TESTNET_REST_URL: &str = "https://testnet.binance.vision";
const WS_URL: &str = "wss://stream.binance.com:9443";
const TESTNET_WS_URL: &str = "wss://stream.testnet.binance.vision";
const API_KEY_HEADER: &str = "X-MBX-APIKEY";
// Binance expires an untouched listen key after 60 minutes.
const LISTEN_KEY_KEEPALIVE: Duration = Duration::from_secs(25 * 60);

fn symbol_alias(symbol: &Symbol) -> String {
    format!("{}{}", symbol.base, symbol.quote)
}

fn depth_stream_name(symbol: &Symbol, limit: usize) -> String {
    format!(
        "{}@depth{}@100ms",
        symbol_alias(symbol).to_lowercase(),
        limit
    )
}

/// Wires the Binance surfaces together. Account and order entry are present
/// only when credentials are configured; market data always is.
pub struct BinancePlugin {
    base_info: Arc<BinanceBaseInfo>,
    market: Arc<BinanceMarket>,
    account: Option<Arc<BinanceAccount>>,
    orders: Option<Arc<BinanceOrders>>,
}

impl BinancePlugin {
    pub fn new(
        config: &AggregatorConfig,
        health: HealthChecker,
        metrics: Arc<Metrics>,
        alerts: AlertDispatcher,
    ) -> Result<Self, AggregatorError> {
        let (rest_url, ws_url) = if config.testnet {
            (TESTNET_REST_URL, TESTNET_WS_URL)
        } else {
            (REST_URL, WS_URL)
        };
        let rest = RestClient::new(
            rest_url,
            API_KEY_HEADER,
            config.binance.clone(),
            config.timeout_ms,
        )?;

        let base_info = Arc::new(BinanceBaseInfo { rest: rest.clone() });
        let market = Arc::new(BinanceMarket::new(
            rest.clone(),
            ws_url.to_string(),
            health.clone(),
            Arc::clone(&metrics),
            alerts.clone(),
        ));
        let (account, orders) = if config.binance.is_some() {
            let account = Arc::new(BinanceAccount {
                rest: rest.clone(),
                ws_url: ws_url.to_string(),
                health: health.clone(),
                metrics: Arc::clone(&metrics),
                alerts,
                start_account: tokio::sync::Mutex::new(None),
            });
            let orders = Arc::new(BinanceOrders {
                rest,
                health,
                metrics,
            });
            (Some(account), Some(orders))
        } else {
            (None, None)
        };

        Ok(BinancePlugin {
            base_info,
            market,
            account,
            orders,
        })
    }
}

impl ExchangeManager for BinancePlugin {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn base_info(&self) -> Option<Arc<dyn BaseInfoApi>> {
        Some(Arc::clone(&self.base_info) as Arc<dyn BaseInfoApi>)
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
// Market data

#[derive(Debug, Deserialize)]
struct DepthFrame {
    #[serde(rename = "lastUpdateId")]
    last_update_id: i64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct CombinedDepthFrame {
    stream: String,
    data: DepthFrame,
}

impl DepthFrame {
    fn into_depth_info(self, symbol: Symbol) -> Result<DepthInfo, AggregatorError> {
        let bids = parse_levels(&self.bids)?;
        let asks = parse_levels(&self.asks)?;
        Ok(DepthInfo::new(symbol, self.last_update_id, bids, asks))
    }
}

fn parse_levels(raw: &[[String; 2]]) -> Result<Vec<PriceLevel>, AggregatorError> {
    raw.iter()
        .map(|[price, qty]| PriceLevel::from_strings(price, qty))
        .collect()
}

struct BinanceMarket {
    manager: MarketManager,
}

impl BinanceMarket {
    fn new(
        rest: RestClient,
        ws_url: String,
        health: HealthChecker,
        metrics: Arc<Metrics>,
        alerts: AlertDispatcher,
    ) -> Self {
        let fetch_rest = rest.clone();
        let fetch: FetchDepthFn = Arc::new(move |symbol: Symbol, limit: usize| {
            let rest = fetch_rest.clone();
            Box::pin(async move {
                let params = [
                    ("symbol", symbol_alias(&symbol)),
                    ("limit", limit.to_string()),
                ];
                let frame: DepthFrame = match rest.get_public("/api/v3/depth", &params).await {
                    Ok(frame) => frame,
                    Err(err) => return DepthInfo::with_err(symbol, err),
                };
                match frame.into_depth_info(symbol.clone()) {
                    Ok(info) => info,
                    Err(err) => DepthInfo::with_err(symbol, err),
                }
            })
        });

        let watch: WatchDepthFn = Arc::new(
            move |shutdown: CancellationToken,
                  out: mpsc::Sender<DepthInfo>,
                  limit: usize,
                  symbols: Vec<Symbol>| {
                let ws_url = ws_url.clone();
                let health = health.clone();
                let metrics = Arc::clone(&metrics);
                let alerts = alerts.clone();
                Box::pin(async move {
                    watch_depth(ws_url, health, metrics, alerts, shutdown, out, limit, symbols)
                        .await
                })
            },
        );

        BinanceMarket {
            manager: MarketManager::new(fetch, Some(watch)),
        }
    }
}

#[async_trait]
impl MarketApi for BinanceMarket {
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

#[allow(clippy::too_many_arguments)]
async fn watch_depth(
    ws_url: String,
    health: HealthChecker,
    metrics: Arc<Metrics>,
    alerts: AlertDispatcher,
    shutdown: CancellationToken,
    out: mpsc::Sender<DepthInfo>,
    limit: usize,
    symbols: Vec<Symbol>,
) -> Result<(), AggregatorError> {
    if symbols.is_empty() {
        return Err(AggregatorError::ExchangeError(
            "no symbols to watch".into(),
        ));
    }

    // Single stream for one symbol, combined endpoint for several.
    let combined = symbols.len() > 1;
    let endpoint = if combined {
        let streams: Vec<String> = symbols.iter().map(|s| depth_stream_name(s, limit)).collect();
        format!("{}/stream?streams={}", ws_url, streams.join("/"))
    } else {
        format!("{}/ws/{}", ws_url, depth_stream_name(&symbols[0], limit))
    };
    let by_stream: HashMap<String, Symbol> = symbols
        .iter()
        .map(|s| (depth_stream_name(s, limit), s.clone()))
        .collect();
    let single = symbols[0].clone();

    let (err_tx, mut err_rx) = mpsc::channel::<AggregatorError>(1);
    let handler_metrics = Arc::clone(&metrics);
    let handler: MessageHandler = Arc::new(move |payload: Vec<u8>| {
        let out = out.clone();
        let err_tx = err_tx.clone();
        let by_stream = by_stream.clone();
        let single = single.clone();
        let metrics = Arc::clone(&handler_metrics);
        Box::pin(async move {
            let parsed = if combined {
                serde_json::from_slice::<CombinedDepthFrame>(&payload)
                    .map_err(|e| AggregatorError::ExchangeError(format!("depth frame: {e}")))
                    .and_then(|frame| {
                        let symbol = by_stream.get(&frame.stream).cloned().ok_or_else(|| {
                            AggregatorError::ExchangeError(format!(
                                "unexpected stream {:?}",
                                frame.stream
                            ))
                        })?;
                        frame.data.into_depth_info(symbol)
                    })
            } else {
                serde_json::from_slice::<DepthFrame>(&payload)
                    .map_err(|e| AggregatorError::ExchangeError(format!("depth frame: {e}")))
                    .and_then(|frame| frame.into_depth_info(single))
            };
            match parsed {
                Ok(info) => {
                    metrics.depth_update_total.get(Exchange::Binance).inc();
                    let _ = out.send(info).await;
                }
                Err(err) => {
                    let _ = err_tx.try_send(err);
                }
            }
        })
    });

    let session = WsSession::connect(&endpoint, handler, alerts).await?;
    health.declare(ExchangeFeature::BinanceMarketDepthWatch, HealthState::Healthy);
    info!(endpoint, "binance depth watch connected");

    let result = tokio::select! {
        _ = session.wait_closed() => {
            Err(AggregatorError::WebsocketError("depth stream closed".into()))
        }
        _ = shutdown.cancelled() => {
            session.close(Some(AggregatorError::Cancelled)).await;
            Ok(())
        }
        Some(err) = err_rx.recv() => {
            error!(%err, "binance depth frame rejected");
            session.close(Some(err.clone())).await;
            Err(err)
        }
    };
    health.declare(
        ExchangeFeature::BinanceMarketDepthWatch,
        HealthState::Unhealthy,
    );
    result
}

// ---------------------------------------------------------------------------
// Account and user data

#[derive(Debug, Deserialize)]
struct RestBalance {
    asset: String,
    free: Decimal,
    locked: Decimal,
}

impl RestBalance {
    fn into_balance(self) -> Balance {
        Balance {
            asset: Asset::new(&self.asset),
            free: self.free,
            locked: self.locked,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestAccount {
    maker_commission: i64,
    taker_commission: i64,
    can_trade: bool,
    can_withdraw: bool,
    can_deposit: bool,
    update_time: u64,
    balances: Vec<RestBalance>,
}

#[derive(Debug, Deserialize)]
struct ListenKeyResponse {
    #[serde(rename = "listenKey")]
    listen_key: String,
}

#[derive(Debug, Deserialize)]
struct EventBalance {
    #[serde(rename = "a")]
    asset: String,
    #[serde(rename = "f")]
    free: Decimal,
    #[serde(rename = "l")]
    locked: Decimal,
}

/// User-data stream frames, discriminated by the `e` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
enum UserDataFrame {
    #[serde(rename = "outboundAccountPosition")]
    AccountPosition {
        #[serde(rename = "E")]
        event_time: u64,
        #[serde(rename = "u")]
        update_time: u64,
        #[serde(rename = "B")]
        balances: Vec<EventBalance>,
    },
    #[serde(rename = "balanceUpdate")]
    BalanceDelta {
        #[serde(rename = "E")]
        event_time: u64,
        #[serde(rename = "a")]
        asset: String,
        #[serde(rename = "d")]
        delta: Decimal,
        #[serde(rename = "T")]
        clear_time: u64,
    },
    #[serde(rename = "executionReport")]
    ExecutionReport(Box<ExecutionReport>),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ExecutionReport {
    #[serde(rename = "E")]
    event_time: u64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    client_order_id: String,
    #[serde(rename = "S")]
    side: Side,
    #[serde(rename = "o")]
    order_type: OrderType,
    #[serde(rename = "f")]
    time_in_force: Option<TimeInForce>,
    #[serde(rename = "q")]
    quantity: Decimal,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "X")]
    status: OrderStatus,
    #[serde(rename = "i")]
    order_id: i64,
    #[serde(rename = "z")]
    filled_quantity: Decimal,
    #[serde(rename = "Z")]
    filled_quote_quantity: Decimal,
    #[serde(rename = "L")]
    latest_price: Decimal,
    #[serde(rename = "T")]
    transaction_time: i64,
    #[serde(rename = "m")]
    is_maker: bool,
    #[serde(rename = "O")]
    create_time: i64,
}

impl ExecutionReport {
    fn into_update(self) -> OrderUpdate {
        OrderUpdate {
            symbol_alias: self.symbol,
            client_order_id: self.client_order_id,
            side: self.side,
            order_type: self.order_type,
            time_in_force: self.time_in_force,
            volume: self.quantity,
            price: self.price,
            status: self.status,
            order_id: self.order_id.to_string(),
            filled_volume: self.filled_quantity,
            filled_quote_volume: self.filled_quote_quantity,
            latest_price: self.latest_price,
            transaction_time: self.transaction_time,
            is_maker: self.is_maker,
            create_time: self.create_time,
        }
    }
}

struct BinanceAccount {
    rest: RestClient,
    ws_url: String,
    health: HealthChecker,
    metrics: Arc<Metrics>,
    alerts: AlertDispatcher,
    start_account: tokio::sync::Mutex<Option<Arc<Account>>>,
}

impl BinanceAccount {
    async fn listen_key(&self) -> Result<String, AggregatorError> {
        let res: ListenKeyResponse = self
            .rest
            .call_with_key(reqwest::Method::POST, "/api/v3/userDataStream", &[])
            .await?;
        Ok(res.listen_key)
    }

    fn spawn_listen_key_keepalive(&self, listen_key: String, shutdown: CancellationToken) {
        let rest = self.rest.clone();
        let alerts = self.alerts.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LISTEN_KEY_KEEPALIVE);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => return,
                }
                let params = [("listenKey", listen_key.clone())];
                let res: Result<serde_json::Value, _> = rest
                    .call_with_key(reqwest::Method::PUT, "/api/v3/userDataStream", &params)
                    .await;
                match res {
                    Ok(_) => info!("binance listen key refreshed"),
                    Err(err) => {
                        alerts.notify_now(
                            Some(err),
                            "failed to refresh binance listen key",
                            "binance user data",
                        );
                    }
                }
            }
        });
    }
}

#[async_trait]
impl AccountApi for BinanceAccount {
    async fn account_info(&self) -> Result<Arc<Account>, AggregatorError> {
        let raw: RestAccount = self
            .rest
            .call_signed(reqwest::Method::GET, "/api/v3/account", &[])
            .await?;
        let balances = raw.balances.into_iter().map(RestBalance::into_balance);
        let mut account = Account::new(raw.update_time, balances.collect());
        // Commission fields arrive in basis points.
        account.maker_commission = Decimal::from(raw.maker_commission) / Decimal::from(10_000);
        account.taker_commission = Decimal::from(raw.taker_commission) / Decimal::from(10_000);
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
        self.spawn_listen_key_keepalive(listen_key.clone(), shutdown.clone());
        let endpoint = format!("{}/ws/{}", self.ws_url, listen_key);

        let (err_tx, mut err_rx) = mpsc::channel::<AggregatorError>(1);
        let metrics = Arc::clone(&self.metrics);
        let handler: MessageHandler = Arc::new(move |payload: Vec<u8>| {
            let out = out.clone();
            let err_tx = err_tx.clone();
            let metrics = Arc::clone(&metrics);
            Box::pin(async move {
                let frame = match serde_json::from_slice::<UserDataFrame>(&payload) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = err_tx.try_send(AggregatorError::ExchangeError(format!(
                            "user data frame: {e}"
                        )));
                        return;
                    }
                };
                let event = match frame {
                    UserDataFrame::AccountPosition {
                        event_time,
                        update_time,
                        balances,
                    } => {
                        observe_latency(&metrics, event_time);
                        UserDataEvent::AccountPosition {
                            exchange: Exchange::Binance,
                            time: update_time,
                            updates: balances
                                .into_iter()
                                .map(|b| Balance {
                                    asset: Asset::new(&b.asset),
                                    free: b.free,
                                    locked: b.locked,
                                })
                                .collect(),
                        }
                    }
                    UserDataFrame::BalanceDelta {
                        event_time,
                        asset,
                        delta,
                        clear_time,
                    } => {
                        observe_latency(&metrics, event_time);
                        UserDataEvent::BalanceDelta {
                            exchange: Exchange::Binance,
                            time: clear_time,
                            asset: Asset::new(&asset),
                            delta,
                        }
                    }
                    UserDataFrame::ExecutionReport(report) => {
                        observe_latency(&metrics, report.event_time);
                        UserDataEvent::Order {
                            exchange: Exchange::Binance,
                            time: report.event_time,
                            update: Box::new(report.into_update()),
                        }
                    }
                    UserDataFrame::Other => return,
                };
                let _ = out.send(event).await;
            })
        });

        let session = WsSession::connect(&endpoint, handler, self.alerts.clone()).await?;
        self.health
            .declare(ExchangeFeature::BinanceUserDataWatch, HealthState::Healthy);
        info!("binance user data watch connected");

        let result = tokio::select! {
            _ = session.wait_closed() => {
                Err(AggregatorError::WebsocketError("user data stream closed".into()))
            }
            _ = shutdown.cancelled() => {
                session.close(Some(AggregatorError::Cancelled)).await;
                Ok(())
            }
            Some(err) = err_rx.recv() => {
                error!(%err, "binance user data frame rejected");
                session.close(Some(err.clone())).await;
                Err(err)
            }
        };
        self.health.declare(
            ExchangeFeature::BinanceUserDataWatch,
            HealthState::Unhealthy,
        );
        result
    }
}

fn observe_latency(metrics: &Metrics, event_time_ms: u64) {
    let now = chrono::Utc::now().timestamp_millis();
    metrics
        .user_data_watch_latency
        .get(Exchange::Binance)
        .observe_ms(now - event_time_ms as i64);
}

// ---------------------------------------------------------------------------
// Order entry

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestNewOrder {
    order_id: i64,
    client_order_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestOrder {
    symbol: String,
    order_id: i64,
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
            order_id: self.order_id.to_string(),
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

#[derive(Debug, Deserialize)]
struct RestCancel {
    status: OrderStatus,
}

struct BinanceOrders {
    rest: RestClient,
    health: HealthChecker,
    metrics: Arc<Metrics>,
}

fn side_param(side: Side) -> &'static str {
    match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

fn order_type_param(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Limit => "LIMIT",
        OrderType::Market => "MARKET",
        OrderType::LimitMaker => "LIMIT_MAKER",
        OrderType::StopLoss => "STOP_LOSS",
        OrderType::StopLossLimit => "STOP_LOSS_LIMIT",
        OrderType::TakeProfit => "TAKE_PROFIT",
        OrderType::TakeProfitLimit => "TAKE_PROFIT_LIMIT",
    }
}

fn time_in_force_param(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::Gtc => "GTC",
        TimeInForce::Ioc => "IOC",
        TimeInForce::Fok => "FOK",
    }
}

#[async_trait]
impl OrderApi for BinanceOrders {
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
        // Orders are refused while any watched stream is down.
        if !self.health.is_all_features_healthy() {
            return Err(AggregatorError::SystemUnhealthy);
        }

        let mut params = vec![
            ("symbol", symbol_alias(&plan.symbol)),
            ("side", side_param(plan.side).to_string()),
            ("type", order_type_param(plan.order_type).to_string()),
            ("newClientOrderId", plan.client_order_id.clone()),
        ];
        if let Some(tif) = plan.time_in_force {
            params.push(("timeInForce", time_in_force_param(tif).to_string()));
        }
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
            .get(Exchange::Binance)
            .observe_ms(started.elapsed().as_millis() as i64);
        info!(
            order_id = res.order_id,
            client_order_id = %res.client_order_id,
            "binance order created"
        );
        Ok(CreateOrderResponse {
            order_id: res.order_id.to_string(),
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
        let params = [
            ("symbol", symbol_alias(symbol)),
            ("orderId", order_id.to_string()),
        ];
        let res: RestCancel = self
            .rest
            .call_signed(reqwest::Method::DELETE, "/api/v3/order", &params)
            .await?;
        warn!(order_id, status = ?res.status, "binance order cancelled");
        Ok(res.status)
    }
}

// ---------------------------------------------------------------------------
// Base info

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestServerTime {
    server_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "filterType")]
enum RestFilter {
    #[serde(rename = "PRICE_FILTER", rename_all = "camelCase")]
    Price {
        min_price: Decimal,
        max_price: Decimal,
        tick_size: Decimal,
    },
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize {
        min_qty: Decimal,
        max_qty: Decimal,
        step_size: Decimal,
    },
    #[serde(rename = "NOTIONAL", rename_all = "camelCase")]
    Notional { min_notional: Decimal },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestSymbolInfo {
    symbol: String,
    base_asset: String,
    quote_asset: String,
    filters: Vec<RestFilter>,
}

#[derive(Debug, Deserialize)]
struct RestExchangeInfo {
    symbols: Vec<RestSymbolInfo>,
}

struct BinanceBaseInfo {
    rest: RestClient,
}

#[async_trait]
impl BaseInfoApi for BinanceBaseInfo {
    async fn server_time(&self) -> Result<i64, AggregatorError> {
        let res: RestServerTime = self.rest.get_public("/api/v3/time", &[]).await?;
        Ok(res.server_time)
    }

    async fn symbol_basic_info(
        &self,
        symbol: &Symbol,
    ) -> Result<SymbolBasicInfo, AggregatorError> {
        let params = [("symbol", symbol_alias(symbol))];
        let res: RestExchangeInfo = self
            .rest
            .get_public("/api/v3/exchangeInfo", &params)
            .await?;
        let raw = res
            .symbols
            .into_iter()
            .next()
            .ok_or_else(|| AggregatorError::SymbolNotSupported(symbol.clone()))?;

        let mut info = SymbolBasicInfo {
            symbol: raw.symbol,
            base_asset: raw.base_asset,
            quote_asset: raw.quote_asset,
            ..SymbolBasicInfo::default()
        };
        for filter in raw.filters {
            match filter {
                RestFilter::Price {
                    min_price,
                    max_price,
                    tick_size,
                } => {
                    info.min_price = min_price;
                    info.max_price = max_price;
                    info.tick_size = tick_size;
                }
                RestFilter::LotSize {
                    min_qty,
                    max_qty,
                    step_size,
                } => {
                    info.min_quantity = min_qty;
                    info.max_quantity = max_qty;
                    info.step_size = step_size;
                }
                RestFilter::Notional { min_notional } => {
                    info.min_notional = min_notional;
                }
                RestFilter::Other => {}
            }
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn symbol_alias_concatenates_pair() {
        let s = Symbol::new(Asset::new("eth"));
        assert_eq!(symbol_alias(&s), "ETHUSDT");
        assert_eq!(depth_stream_name(&s, 10), "ethusdt@depth10@100ms");
    }

    #[test]
    fn single_depth_frame_parses() {
        let raw = r#"{
            "lastUpdateId": 160,
            "bids": [["0.0024", "10"], ["0.0022", "5"]],
            "asks": [["0.0026", "100"]]
        }"#;
        let frame: DepthFrame = serde_json::from_str(raw).unwrap();
        let info = frame
            .into_depth_info(Symbol::new(Asset::new("ETH")))
            .unwrap();
        assert_eq!(info.last_update_id, 160);
        assert_eq!(info.bids.len(), 2);
        assert_eq!(
            info.top_ask().unwrap().price,
            Decimal::from_str("0.0026").unwrap()
        );
    }

    #[test]
    fn combined_depth_frame_parses() {
        let raw = r#"{
            "stream": "ethusdt@depth10@100ms",
            "data": {
                "lastUpdateId": 42,
                "bids": [["2000.10", "1.5"]],
                "asks": [["2000.20", "0.3"]]
            }
        }"#;
        let frame: CombinedDepthFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.stream, "ethusdt@depth10@100ms");
        assert_eq!(frame.data.last_update_id, 42);
    }

    #[test]
    fn malformed_level_is_rejected() {
        let raw = r#"{
            "lastUpdateId": 1,
            "bids": [["not-a-number", "1"]],
            "asks": []
        }"#;
        let frame: DepthFrame = serde_json::from_str(raw).unwrap();
        let err = frame
            .into_depth_info(Symbol::new(Asset::new("ETH")))
            .unwrap_err();
        assert!(matches!(err, AggregatorError::LevelParse(_)));
    }

    #[test]
    fn execution_report_parses() {
        let raw = r#"{
            "e": "executionReport",
            "E": 1499405658658,
            "s": "ETHUSDT",
            "c": "abc123",
            "S": "BUY",
            "o": "LIMIT",
            "f": "GTC",
            "q": "1.00000000",
            "p": "2000.00000000",
            "X": "NEW",
            "i": 4293153,
            "l": "0.00000000",
            "z": "0.00000000",
            "Z": "0.00000000",
            "L": "0.00000000",
            "n": "0",
            "T": 1499405658657,
            "t": -1,
            "m": false,
            "O": 1499405658657
        }"#;
        let frame: UserDataFrame = serde_json::from_str(raw).unwrap();
        let UserDataFrame::ExecutionReport(report) = frame else {
            panic!("expected execution report");
        };
        let update = report.into_update();
        assert_eq!(update.symbol_alias, "ETHUSDT");
        assert_eq!(update.side, Side::Buy);
        assert_eq!(update.status, OrderStatus::New);
        assert_eq!(update.order_id, "4293153");
        assert!(!update.is_maker);
    }

    #[test]
    fn account_position_frame_parses() {
        let raw = r#"{
            "e": "outboundAccountPosition",
            "E": 1564034571105,
            "u": 1564034571073,
            "B": [{"a": "ETH", "f": "10000.000000", "l": "0.000000"}]
        }"#;
        let frame: UserDataFrame = serde_json::from_str(raw).unwrap();
        let UserDataFrame::AccountPosition {
            update_time,
            balances,
            ..
        } = frame
        else {
            panic!("expected account position");
        };
        assert_eq!(update_time, 1564034571073);
        assert_eq!(balances.len(), 1);
        assert_eq!(balances[0].asset, "ETH");
    }

    #[tokio::test]
    async fn create_order_is_gated_before_any_network_call() {
        use crate::config::Credentials;

        let health = HealthChecker::new(ExchangeFeature::all_features());
        let metrics = Arc::new(Metrics::default());
        let orders = BinanceOrders {
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
        assert_eq!(
            metrics.order_create_latency.get(Exchange::Binance).count(),
            0
        );
    }

    #[test]
    fn unknown_user_data_frame_is_ignored() {
        let raw = r#"{"e": "listStatus", "E": 1}"#;
        let frame: UserDataFrame = serde_json::from_str(raw).unwrap();
        assert!(matches!(frame, UserDataFrame::Other));
    }
}
