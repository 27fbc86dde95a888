use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::market::{FetchDepthFn, MarketManager};
use super::metrics::Metrics;
use super::traits::{ExchangeManager, MarketApi};
use super::types::{DepthInfo, Exchange, PriceLevel, Symbol};
use crate::config::AggregatorConfig;
use crate::error::AggregatorError;
use crate::http::RestClient;

const REST_URL: &str = "https://api.coinex.com";
// Levels within this price distance are merged server-side.
const MERGE_STEP: &str = "0.001";

fn market_alias(symbol: &Symbol) -> String {
    format!("{}{}", symbol.base, symbol.quote).to_lowercase()
}

/// Snapshot-only CoinEx adapter; depth watching is unsupported.
pub struct CoinExPlugin {
    market: Arc<CoinExMarket>,
}

impl CoinExPlugin {
    pub fn new(config: &AggregatorConfig, metrics: Arc<Metrics>) -> Result<Self, AggregatorError> {
        let rest = RestClient::new(REST_URL, "AccessId", None, config.timeout_ms)?;
        Ok(CoinExPlugin {
            market: Arc::new(CoinExMarket::new(rest, metrics)),
        })
    }
}

impl ExchangeManager for CoinExPlugin {
    fn exchange(&self) -> Exchange {
        Exchange::CoinEx
    }

    fn market(&self) -> Arc<dyn MarketApi> {
        Arc::clone(&self.market) as Arc<dyn MarketApi>
    }
}

#[derive(Debug, Deserialize)]
struct RestDepthData {
    #[serde(default)]
    time: i64,
    asks: Vec<[String; 2]>,
    bids: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct RestDepth {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<RestDepthData>,
}

struct CoinExMarket {
    manager: MarketManager,
}

impl CoinExMarket {
    fn new(rest: RestClient, metrics: Arc<Metrics>) -> Self {
        let fetch: FetchDepthFn = Arc::new(move |symbol: Symbol, limit: usize| {
            let rest = rest.clone();
            let metrics = Arc::clone(&metrics);
            Box::pin(async move {
                let params = [
                    ("market", market_alias(&symbol)),
                    ("merge", MERGE_STEP.to_string()),
                    ("limit", limit.to_string()),
                ];
                let res: RestDepth = match rest.get_public("/v1/market/depth", &params).await {
                    Ok(res) => res,
                    Err(err) => return DepthInfo::with_err(symbol, err),
                };
                if res.code != 0 {
                    return DepthInfo::with_err(
                        symbol,
                        AggregatorError::ApiError(format!(
                            "coinEx {}: {}",
                            res.code, res.message
                        )),
                    );
                }
                let Some(data) = res.data else {
                    return DepthInfo::with_err(
                        symbol.clone(),
                        AggregatorError::SymbolNotSupported(symbol),
                    );
                };
                let levels = |raw: &[[String; 2]]| {
                    raw.iter()
                        .map(|[p, q]| PriceLevel::from_strings(p, q))
                        .collect::<Result<Vec<_>, _>>()
                };
                match (levels(&data.bids), levels(&data.asks)) {
                    (Ok(bids), Ok(asks)) => {
                        metrics.depth_update_total.get(Exchange::CoinEx).inc();
                        let mut info = DepthInfo::new(symbol, 0, bids, asks);
                        if data.time > 0 {
                            info.time = data.time;
                        }
                        info
                    }
                    (Err(err), _) | (_, Err(err)) => DepthInfo::with_err(symbol, err),
                }
            })
        });
        CoinExMarket {
            manager: MarketManager::new(fetch, None),
        }
    }
}

#[async_trait]
impl MarketApi for CoinExMarket {
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

    #[test]
    fn market_alias_is_lowercase_concat() {
        assert_eq!(market_alias(&Symbol::new(Asset::new("ETH"))), "ethusdt");
    }

    #[test]
    fn depth_response_parses() {
        let raw = r#"{
            "code": 0,
            "data": {
                "last": "1621.55",
                "time": 1585849406742,
                "asks": [["1621.60", "0.84"]],
                "bids": [["1621.50", "1.12"]]
            },
            "message": "Ok"
        }"#;
        let res: RestDepth = serde_json::from_str(raw).unwrap();
        assert_eq!(res.code, 0);
        let data = res.data.unwrap();
        assert_eq!(data.time, 1585849406742);
        assert_eq!(data.asks.len(), 1);
    }

    #[test]
    fn error_response_parses() {
        let raw = r#"{"code": 4, "data": null, "message": "market not exists"}"#;
        let res: RestDepth = serde_json::from_str(raw).unwrap();
        assert_eq!(res.code, 4);
        assert!(res.data.is_none());
    }
}
