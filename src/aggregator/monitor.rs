use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::traits::MarketApi;
use super::types::{Asset, DepthInfo, Exchange, Symbol};
use crate::error::AggregatorError;

const PER_ASSET_INTERVAL: Duration = Duration::from_millis(500);

/// Top-of-book comparison of one symbol across two venues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthComparison {
    pub symbol: Symbol,
    /// target best ask / reference best ask.
    pub ask_ratio: Decimal,
    /// target best bid / reference best bid.
    pub bid_ratio: Decimal,
    pub ask_difference: Decimal,
    pub bid_difference: Decimal,
    /// reference best bid - target best ask; positive means the target's ask
    /// sits below the reference's bid.
    pub cross_spread: Decimal,
}

/// Compares two snapshots of the same symbol by their best levels.
pub fn compare_with_reference(
    reference: &DepthInfo,
    target: &DepthInfo,
) -> Result<DepthComparison, AggregatorError> {
    let (ref_ask, ref_bid) = reference.top()?;
    let (target_ask, target_bid) = target.top()?;
    if ref_ask.price.is_zero() || ref_bid.price.is_zero() {
        return Err(AggregatorError::EmptyBook("reference top"));
    }
    Ok(DepthComparison {
        symbol: reference.symbol.clone(),
        ask_ratio: target_ask.price / ref_ask.price,
        bid_ratio: target_bid.price / ref_bid.price,
        ask_difference: target_ask.price - ref_ask.price,
        bid_difference: target_bid.price - ref_bid.price,
        cross_spread: ref_bid.price - target_ask.price,
    })
}

/// Periodically snapshots each watched asset on two venues and logs how the
/// target's top of book tracks the reference's.
pub struct MonitorService {
    reference: Arc<dyn MarketApi>,
    reference_exchange: Exchange,
    target: Arc<dyn MarketApi>,
    target_exchange: Exchange,
    assets: Vec<Asset>,
    depth_limit: usize,
}

impl MonitorService {
    pub fn new(
        reference: Arc<dyn MarketApi>,
        reference_exchange: Exchange,
        target: Arc<dyn MarketApi>,
        target_exchange: Exchange,
        assets: Vec<Asset>,
        depth_limit: usize,
    ) -> Self {
        MonitorService {
            reference,
            reference_exchange,
            target,
            target_exchange,
            assets,
            depth_limit,
        }
    }

    /// Runs until `shutdown` is cancelled. Per-symbol failures are logged and
    /// skipped; the loop keeps going.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        anyhow::ensure!(!self.assets.is_empty(), "no assets to monitor");
        let period = PER_ASSET_INTERVAL * self.assets.len() as u32;
        let mut ticker = tokio::time::interval(period);
        info!(
            reference = %self.reference_exchange,
            target = %self.target_exchange,
            assets = self.assets.len(),
            ?period,
            "monitor service started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => {
                    info!("monitor service stopped");
                    return Ok(());
                }
            }
            for asset in &self.assets {
                let symbol = Symbol::new(asset.clone());
                self.compare_symbol(symbol).await;
            }
        }
    }

    async fn compare_symbol(&self, symbol: Symbol) {
        let (reference, target) = tokio::join!(
            self.reference.fetch_depth(symbol.clone(), self.depth_limit),
            self.target.fetch_depth(symbol.clone(), self.depth_limit),
        );
        let reference = match reference {
            Ok(info) => info,
            Err(err) => {
                warn!(%symbol, exchange = %self.reference_exchange, %err, "reference depth unavailable");
                return;
            }
        };
        let target = match target {
            Ok(info) => info,
            Err(err) => {
                warn!(%symbol, exchange = %self.target_exchange, %err, "target depth unavailable");
                return;
            }
        };
        match compare_with_reference(&reference, &target) {
            Ok(cmp) => {
                info!(
                    %symbol,
                    reference = %self.reference_exchange,
                    target = %self.target_exchange,
                    ask_ratio = %cmp.ask_ratio,
                    bid_ratio = %cmp.bid_ratio,
                    ask_diff = %cmp.ask_difference,
                    bid_diff = %cmp.bid_difference,
                    cross_spread = %cmp.cross_spread,
                    "depth comparison"
                );
            }
            Err(err) => {
                warn!(%symbol, %err, "depth comparison skipped");
            }
        }
    }
}
