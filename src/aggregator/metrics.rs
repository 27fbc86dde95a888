use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use super::types::Exchange;

/// Increment-only counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Running count/total pair for latency observations in milliseconds.
#[derive(Debug, Default)]
pub struct LatencySummary {
    count: AtomicU64,
    total_ms: AtomicI64,
}

impl LatencySummary {
    pub fn observe_ms(&self, latency_ms: i64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean_ms(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.total_ms.load(Ordering::Relaxed) as f64 / count as f64
    }
}

#[derive(Debug, Default)]
pub struct PerExchange<T: Default>([T; 4]);

impl<T: Default> PerExchange<T> {
    pub fn get(&self, exchange: Exchange) -> &T {
        let idx = match exchange {
            Exchange::Binance => 0,
            Exchange::Mexc => 1,
            Exchange::Okx => 2,
            Exchange::CoinEx => 3,
        };
        &self.0[idx]
    }
}

/// Observability side effects only; nothing in the core reads these back for
/// control flow.
#[derive(Debug, Default)]
pub struct Metrics {
    pub depth_update_total: PerExchange<Counter>,
    pub user_data_watch_latency: PerExchange<LatencySummary>,
    pub order_create_latency: PerExchange<LatencySummary>,
}
