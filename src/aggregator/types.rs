use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::AggregatorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exchange {
    Binance,
    Mexc,
    Okx,
    CoinEx,
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exchange::Binance => write!(f, "binance"),
            Exchange::Mexc => write!(f, "MEXC"),
            Exchange::Okx => write!(f, "okx"),
            Exchange::CoinEx => write!(f, "coinEx"),
        }
    }
}

/// Case-normalized asset token, e.g. "ETH", "USDT".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Asset(String);

impl Asset {
    pub fn new(s: &str) -> Self {
        Asset(s.to_uppercase())
    }

    pub fn usdt() -> Self {
        Asset("USDT".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A trading pair, compared by value. Each venue maps this to its own wire
/// alias ("ETHUSDT", "ETH-USDT", ...) in its adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    pub base: Asset,
    pub quote: Asset,
}

impl Symbol {
    /// Pair against the default quote asset (USDT).
    pub fn new(base: Asset) -> Self {
        Symbol {
            base,
            quote: Asset::usdt(),
        }
    }

    pub fn with_quote(base: Asset, quote: Asset) -> Self {
        Symbol { base, quote }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

/// One price/quantity pair of an order book. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Ask is a role alias for [`PriceLevel`] (best-ask context).
pub type Ask = PriceLevel;
/// Bid is a role alias for [`PriceLevel`] (best-bid context).
pub type Bid = PriceLevel;

impl PriceLevel {
    /// Parses a level from the venue's string pair. Either side failing to
    /// parse is a hard error and no level is produced.
    pub fn from_strings(price: &str, quantity: &str) -> Result<Self, AggregatorError> {
        let price = Decimal::from_str(price)
            .map_err(|e| AggregatorError::LevelParse(format!("price {price:?}: {e}")))?;
        let quantity = Decimal::from_str(quantity)
            .map_err(|e| AggregatorError::LevelParse(format!("quantity {quantity:?}: {e}")))?;
        Ok(PriceLevel { price, quantity })
    }
}

/// Full replacement snapshot of (the top of) one venue's book for one symbol.
///
/// `err` must be checked before the levels are trusted; an errored snapshot
/// carries no levels.
#[derive(Debug, Clone)]
pub struct DepthInfo {
    pub symbol: Symbol,
    pub time: i64,
    pub last_update_id: i64,
    /// Best-first (highest price first).
    pub bids: Vec<Bid>,
    /// Best-first (lowest price first).
    pub asks: Vec<Ask>,
    pub err: Option<AggregatorError>,
}

impl DepthInfo {
    pub fn new(symbol: Symbol, last_update_id: i64, bids: Vec<Bid>, asks: Vec<Ask>) -> Self {
        DepthInfo {
            symbol,
            time: chrono::Utc::now().timestamp_millis(),
            last_update_id,
            bids,
            asks,
            err: None,
        }
    }

    pub fn with_err(symbol: Symbol, err: AggregatorError) -> Self {
        DepthInfo {
            symbol,
            time: chrono::Utc::now().timestamp_millis(),
            last_update_id: 0,
            bids: Vec::new(),
            asks: Vec::new(),
            err: Some(err),
        }
    }

    pub fn top_ask(&self) -> Result<&Ask, AggregatorError> {
        self.asks.first().ok_or(AggregatorError::EmptyBook("asks"))
    }

    pub fn top_bid(&self) -> Result<&Bid, AggregatorError> {
        self.bids.first().ok_or(AggregatorError::EmptyBook("bids"))
    }

    pub fn top(&self) -> Result<(&Ask, &Bid), AggregatorError> {
        Ok((self.top_ask()?, self.top_bid()?))
    }

    /// Ask/bid at 1-based depth `n`, erroring when either side is shallower.
    pub fn top_n(&self, n: usize) -> Result<(&Ask, &Bid), AggregatorError> {
        if n == 0 || self.asks.len() < n || self.bids.len() < n {
            return Err(AggregatorError::EmptyBook("levels"));
        }
        Ok((&self.asks[n - 1], &self.bids[n - 1]))
    }
}

/// Per-symbol trading constraints reported by the venue.
#[derive(Debug, Clone, Default)]
pub struct SymbolBasicInfo {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub min_price: Decimal,
    pub max_price: Decimal,
    pub tick_size: Decimal,
    pub min_quantity: Decimal,
    pub max_quantity: Decimal,
    pub step_size: Decimal,
    pub min_notional: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_level_parses_valid_decimal_pairs() {
        let cases = [
            ("30225.77", "2.132868"),
            ("0.003", "0.001"),
            ("-1.5", "3"),
            ("100", "1"),
        ];
        for (p, q) in cases {
            let level = PriceLevel::from_strings(p, q).unwrap();
            assert_eq!(level.price, Decimal::from_str(p).unwrap());
            assert_eq!(level.quantity, Decimal::from_str(q).unwrap());
        }
    }

    #[test]
    fn price_level_rejects_bad_input() {
        for (p, q) in [
            ("abc", "1"),
            ("1", "abc"),
            ("", "1"),
            ("1", ""),
            ("1e5", "1"), // scientific notation is not a wire format we accept
        ] {
            assert!(
                matches!(
                    PriceLevel::from_strings(p, q),
                    Err(AggregatorError::LevelParse(_))
                ),
                "expected parse failure for ({p:?}, {q:?})"
            );
        }
    }

    #[test]
    fn depth_info_top_accessors() {
        let symbol = Symbol::new(Asset::new("eth"));
        let info = DepthInfo::new(
            symbol.clone(),
            7,
            vec![PriceLevel::from_strings("100", "1").unwrap()],
            vec![PriceLevel::from_strings("101", "1").unwrap()],
        );
        let (ask, bid) = info.top().unwrap();
        assert_eq!(ask.price, Decimal::from(101));
        assert_eq!(bid.price, Decimal::from(100));
        assert!(info.top_n(2).is_err());

        let empty = DepthInfo::new(symbol, 0, vec![], vec![]);
        assert!(matches!(
            empty.top_ask(),
            Err(AggregatorError::EmptyBook("asks"))
        ));
    }

    #[test]
    fn asset_and_symbol_normalization() {
        assert_eq!(Asset::new("eth"), Asset::new("ETH"));
        let s = Symbol::new(Asset::new("eth"));
        assert_eq!(s.quote, Asset::usdt());
        assert_eq!(s.to_string(), "ETH/USDT");
    }
}
