use crate::aggregator::types::Asset;

/// API credentials for one venue. Loading them from disk or environment is
/// the caller's concern.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub testnet: bool,
    pub timeout_ms: u64,
    pub depth_limit: usize,
    /// Base assets compared by the monitor service (quote asset is USDT).
    pub watch_assets: Vec<Asset>,
    pub binance: Option<Credentials>,
    pub mexc: Option<Credentials>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            testnet: false,
            timeout_ms: 5000,
            depth_limit: 10,
            watch_assets: vec![Asset::new("ETH")],
            binance: None,
            mexc: None,
        }
    }
}
