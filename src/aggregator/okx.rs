use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::alert::AlertDispatcher;
use super::market::{FetchDepthFn, MarketManager, WatchDepthFn};
use super::metrics::Metrics;
use super::traits::{ExchangeManager, MarketApi};
use super::types::{DepthInfo, Exchange, PriceLevel, Symbol};
use super::websocket::{MessageHandler, WsSession};
use crate::config::AggregatorConfig;
use crate::error::AggregatorError;
use crate::http::RestClient;

const REST_URL: &str = "https://www.okx.com";
const WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
const BOOKS_CHANNEL: &str = "books5";

fn instrument_id(symbol: &Symbol) -> String {
    format!("{}-{}", symbol.base, symbol.quote)
}

/// Market-data-only OKX adapter. No private surfaces are wired up.
pub struct OkxPlugin {
    market: Arc<OkxMarket>,
}

impl OkxPlugin {
    pub fn new(
        config: &AggregatorConfig,
        metrics: Arc<Metrics>,
        alerts: AlertDispatcher,
    ) -> Result<Self, AggregatorError> {
        // OKX public endpoints are keyless.
        let rest = RestClient::new(REST_URL, "OK-ACCESS-KEY", None, config.timeout_ms)?;
        Ok(OkxPlugin {
            market: Arc::new(OkxMarket::new(rest, metrics, alerts)),
        })
    }
}

impl ExchangeManager for OkxPlugin {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
    }

    fn market(&self) -> Arc<dyn MarketApi> {
        Arc::clone(&self.market) as Arc<dyn MarketApi>
    }
}

/// OKX book levels come as `[price, size, liquidated orders, order count]`.
#[derive(Debug, Deserialize)]
struct BookSnapshot {
    asks: Vec<[String; 4]>,
    bids: Vec<[String; 4]>,
    ts: String,
    #[serde(rename = "seqId", default)]
    seq_id: i64,
}

#[derive(Debug, Deserialize)]
struct RestBooks {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Vec<BookSnapshot>,
}

#[derive(Debug, Serialize)]
struct SubscribeArg {
    channel: &'static str,
    #[serde(rename = "instId")]
    inst_id: String,
}

#[derive(Debug, Serialize)]
struct SubscribeRequest {
    op: &'static str,
    args: Vec<SubscribeArg>,
}

#[derive(Debug, Deserialize)]
struct PushArg {
    #[serde(rename = "instId")]
    inst_id: String,
}

/// books5 push; `event` frames (subscribe acks, errors) carry no data.
#[derive(Debug, Deserialize)]
struct PushFrame {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    arg: Option<PushArg>,
    #[serde(default)]
    data: Vec<BookSnapshot>,
}

impl BookSnapshot {
    fn into_depth_info(self, symbol: Symbol, limit: usize) -> Result<DepthInfo, AggregatorError> {
        let time: i64 = self
            .ts
            .parse()
            .map_err(|e| AggregatorError::ExchangeError(format!("book timestamp: {e}")))?;
        let levels = |raw: Vec<[String; 4]>| {
            raw.into_iter()
                .take(limit)
                .map(|level| PriceLevel::from_strings(&level[0], &level[1]))
                .collect::<Result<Vec<_>, _>>()
        };
        let asks = levels(self.asks)?;
        let bids = levels(self.bids)?;
        let mut info = DepthInfo::new(symbol, self.seq_id, bids, asks);
        info.time = time;
        Ok(info)
    }
}

struct OkxMarket {
    manager: MarketManager,
}

impl OkxMarket {
    fn new(rest: RestClient, metrics: Arc<Metrics>, alerts: AlertDispatcher) -> Self {
        let fetch: FetchDepthFn = Arc::new(move |symbol: Symbol, limit: usize| {
            let rest = rest.clone();
            Box::pin(async move {
                let params = [
                    ("instId", instrument_id(&symbol)),
                    ("sz", limit.to_string()),
                ];
                let res: RestBooks = match rest.get_public("/api/v5/market/books", &params).await
                {
                    Ok(res) => res,
                    Err(err) => return DepthInfo::with_err(symbol, err),
                };
                if res.code != "0" {
                    return DepthInfo::with_err(
                        symbol,
                        AggregatorError::ApiError(format!("okx {}: {}", res.code, res.msg)),
                    );
                }
                let Some(snapshot) = res.data.into_iter().next() else {
                    return DepthInfo::with_err(
                        symbol.clone(),
                        AggregatorError::SymbolNotSupported(symbol),
                    );
                };
                match snapshot.into_depth_info(symbol.clone(), limit) {
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
                let metrics = Arc::clone(&metrics);
                let alerts = alerts.clone();
                Box::pin(async move {
                    watch_books(metrics, alerts, shutdown, out, limit, symbols).await
                })
            },
        );

        OkxMarket {
            manager: MarketManager::new(fetch, Some(watch)),
        }
    }
}

async fn watch_books(
    metrics: Arc<Metrics>,
    alerts: AlertDispatcher,
    shutdown: CancellationToken,
    out: mpsc::Sender<DepthInfo>,
    limit: usize,
    symbols: Vec<Symbol>,
) -> Result<(), AggregatorError> {
    if symbols.is_empty() {
        return Err(AggregatorError::ExchangeError("no symbols to watch".into()));
    }
    let by_inst: std::collections::HashMap<String, Symbol> = symbols
        .iter()
        .map(|s| (instrument_id(s), s.clone()))
        .collect();
    let by_inst = Arc::new(by_inst);

    let (err_tx, mut err_rx) = mpsc::channel::<AggregatorError>(1);
    let handler_map = Arc::clone(&by_inst);
    let handler: MessageHandler = Arc::new(move |payload: Vec<u8>| {
        let out = out.clone();
        let err_tx = err_tx.clone();
        let by_inst = Arc::clone(&handler_map);
        let metrics = Arc::clone(&metrics);
        Box::pin(async move {
            let frame = match serde_json::from_slice::<PushFrame>(&payload) {
                Ok(frame) => frame,
                Err(e) => {
                    let _ = err_tx
                        .try_send(AggregatorError::ExchangeError(format!("books frame: {e}")));
                    return;
                }
            };
            if let Some(event) = frame.event {
                if event == "error" {
                    let _ = err_tx.try_send(AggregatorError::ExchangeError(format!(
                        "okx subscription error: {}",
                        frame.msg.unwrap_or_default()
                    )));
                }
                return;
            }
            let Some(arg) = frame.arg else { return };
            let Some(symbol) = by_inst.get(&arg.inst_id).cloned() else {
                return;
            };
            for snapshot in frame.data {
                match snapshot.into_depth_info(symbol.clone(), limit) {
                    Ok(info) => {
                        metrics.depth_update_total.get(Exchange::Okx).inc();
                        let _ = out.send(info).await;
                    }
                    Err(err) => {
                        let _ = err_tx.try_send(err);
                        return;
                    }
                }
            }
        })
    });

    let session = WsSession::connect(WS_URL, handler, alerts).await?;
    session
        .write(&SubscribeRequest {
            op: "subscribe",
            args: by_inst
                .keys()
                .map(|inst| SubscribeArg {
                    channel: BOOKS_CHANNEL,
                    inst_id: inst.clone(),
                })
                .collect(),
        })
        .await;
    info!(symbols = by_inst.len(), "okx books watch connected");

    tokio::select! {
        _ = session.wait_closed() => {
            Err(AggregatorError::WebsocketError("books stream closed".into()))
        }
        _ = shutdown.cancelled() => {
            session.close(Some(AggregatorError::Cancelled)).await;
            Ok(())
        }
        Some(err) = err_rx.recv() => {
            error!(%err, "okx books frame rejected");
            session.close(Some(err.clone())).await;
            Err(err)
        }
    }
}

#[async_trait]
impl MarketApi for OkxMarket {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::types::Asset;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    #[test]
    fn instrument_id_is_dashed() {
        assert_eq!(instrument_id(&Symbol::new(Asset::new("eth"))), "ETH-USDT");
    }

    #[test]
    fn books5_push_parses() {
        let raw = r#"{
            "arg": {"channel": "books5", "instId": "ETH-USDT"},
            "data": [{
                "asks": [["1621.61", "12.3", "0", "4"], ["1621.7", "1", "0", "1"]],
                "bids": [["1621.6", "5.5", "0", "2"]],
                "ts": "1597026383085",
                "seqId": 123456
            }]
        }"#;
        let frame: PushFrame = serde_json::from_str(raw).unwrap();
        assert!(frame.event.is_none());
        let snapshot = frame.data.into_iter().next().unwrap();
        let info = snapshot
            .into_depth_info(Symbol::new(Asset::new("ETH")), 5)
            .unwrap();
        assert_eq!(info.time, 1597026383085);
        assert_eq!(info.last_update_id, 123456);
        assert_eq!(
            info.top_ask().unwrap().price,
            Decimal::from_str("1621.61").unwrap()
        );
        assert_eq!(info.asks.len(), 2);
    }

    #[test]
    fn limit_truncates_levels() {
        let snapshot = BookSnapshot {
            asks: vec![
                ["1".into(), "1".into(), "0".into(), "1".into()],
                ["2".into(), "1".into(), "0".into(), "1".into()],
            ],
            bids: vec![["0.5".into(), "1".into(), "0".into(), "1".into()]],
            ts: "1".into(),
            seq_id: 1,
        };
        let info = snapshot
            .into_depth_info(Symbol::new(Asset::new("ETH")), 1)
            .unwrap();
        assert_eq!(info.asks.len(), 1);
        assert_eq!(info.bids.len(), 1);
    }

    #[test]
    fn subscribe_ack_is_ignored_and_error_detected() {
        let ack = r#"{"event": "subscribe", "arg": {"channel": "books5", "instId": "ETH-USDT"}}"#;
        let frame: PushFrame = serde_json::from_str(ack).unwrap();
        assert_eq!(frame.event.as_deref(), Some("subscribe"));
        assert!(frame.data.is_empty());

        let err = r#"{"event": "error", "code": "60012", "msg": "Invalid request"}"#;
        let frame: PushFrame = serde_json::from_str(err).unwrap();
        assert_eq!(frame.event.as_deref(), Some("error"));
        assert_eq!(frame.msg.as_deref(), Some("Invalid request"));
    }
}
