pub mod account;
pub mod alert;
pub mod binance;
pub mod coinex;
pub mod events;
pub mod health;
pub mod market;
pub mod metrics;
pub mod mexc;
pub mod monitor;
pub mod okx;
pub mod traits;
pub mod types;
pub mod websocket;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use tracing::info;

use self::alert::AlertDispatcher;
use self::binance::BinancePlugin;
use self::coinex::CoinExPlugin;
use self::health::{ExchangeFeature, HealthChecker};
use self::metrics::Metrics;
use self::mexc::MexcPlugin;
use self::monitor::MonitorService;
use self::okx::OkxPlugin;
use self::traits::ExchangeManager;
use self::types::Exchange;
use crate::config::AggregatorConfig;
use crate::error::AggregatorError;

/// Ranking for venues nobody tuned; lower ranks ahead.
pub const DEFAULT_PLUGIN_RANKING: u32 = 500;
const PRIMARY_PLUGIN_RANKING: u32 = 300;

/// One registered venue adapter and its selection priority.
#[derive(Clone)]
pub struct ExchangePlugin {
    pub exchange: Exchange,
    pub ranking: u32,
    pub manager: Arc<dyn ExchangeManager>,
}

/// Explicit plugin registry; adapters are handed in at construction rather
/// than discovered through globals.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<ExchangePlugin>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        PluginRegistry::default()
    }

    /// Registers an adapter, replacing any earlier registration for the same
    /// venue.
    pub fn register(&mut self, manager: Arc<dyn ExchangeManager>, ranking: u32) {
        let exchange = manager.exchange();
        self.plugins.retain(|p| p.exchange != exchange);
        info!(%exchange, ranking, "exchange plugin registered");
        self.plugins.push(ExchangePlugin {
            exchange,
            ranking,
            manager,
        });
    }

    pub fn by_exchange(&self, exchange: Exchange) -> Option<&ExchangePlugin> {
        self.plugins.iter().find(|p| p.exchange == exchange)
    }

    /// Plugins in priority order (lowest ranking first).
    pub fn iter_ranked(&self) -> Vec<&ExchangePlugin> {
        let mut ranked: Vec<&ExchangePlugin> = self.plugins.iter().collect();
        ranked.sort_by_key(|p| p.ranking);
        ranked
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// Composition root: builds the shared health checker, metrics and alert
/// dispatcher, and registers every venue adapter.
pub struct DepthAggregator {
    config: AggregatorConfig,
    registry: PluginRegistry,
    health: HealthChecker,
    metrics: Arc<Metrics>,
    alerts: AlertDispatcher,
}

impl DepthAggregator {
    pub fn new(config: AggregatorConfig) -> Result<Self, AggregatorError> {
        Self::with_alerts(config, AlertDispatcher::default())
    }

    pub fn with_alerts(
        config: AggregatorConfig,
        alerts: AlertDispatcher,
    ) -> Result<Self, AggregatorError> {
        let health = HealthChecker::new(ExchangeFeature::all_features());
        let metrics = Arc::new(Metrics::default());

        let mut registry = PluginRegistry::new();
        registry.register(
            Arc::new(BinancePlugin::new(
                &config,
                health.clone(),
                Arc::clone(&metrics),
                alerts.clone(),
            )?),
            PRIMARY_PLUGIN_RANKING,
        );
        registry.register(
            Arc::new(MexcPlugin::new(
                &config,
                health.clone(),
                Arc::clone(&metrics),
                alerts.clone(),
            )?),
            PRIMARY_PLUGIN_RANKING,
        );
        registry.register(
            Arc::new(OkxPlugin::new(&config, Arc::clone(&metrics), alerts.clone())?),
            DEFAULT_PLUGIN_RANKING,
        );
        registry.register(
            Arc::new(CoinExPlugin::new(&config, Arc::clone(&metrics))?),
            DEFAULT_PLUGIN_RANKING,
        );

        Ok(DepthAggregator {
            config,
            registry,
            health,
            metrics,
            alerts,
        })
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn health(&self) -> &HealthChecker {
        &self.health
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn alerts(&self) -> &AlertDispatcher {
        &self.alerts
    }

    /// Monitor comparing `target`'s top of book against `reference`'s, over
    /// the configured watch assets.
    pub fn monitor(
        &self,
        reference: Exchange,
        target: Exchange,
    ) -> Result<MonitorService, AggregatorError> {
        let reference_market = self
            .registry
            .by_exchange(reference)
            .ok_or_else(|| AggregatorError::ExchangeError(format!("{reference} not registered")))?
            .manager
            .market();
        let target_market = self
            .registry
            .by_exchange(target)
            .ok_or_else(|| AggregatorError::ExchangeError(format!("{target} not registered")))?
            .manager
            .market();
        Ok(MonitorService::new(
            reference_market,
            reference,
            target_market,
            target,
            self.config.watch_assets.clone(),
            self.config.depth_limit,
        ))
    }
}
