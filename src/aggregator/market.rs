use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::types::{DepthInfo, Symbol};
use crate::error::AggregatorError;

/// Levels per book side when the caller passes `0`.
pub const DEFAULT_DEPTH_LIMIT: usize = 10;

/// One-shot depth snapshot (REST). Transport errors come back inside the
/// snapshot's `err` field, which [`MarketManager::fetch_depth`] unwraps.
pub type FetchDepthFn =
    Arc<dyn Fn(Symbol, usize) -> BoxFuture<'static, DepthInfo> + Send + Sync>;

/// Streaming depth subscription. Runs until the token is cancelled or the
/// underlying session dies; snapshots flow out through the channel.
pub type WatchDepthFn = Arc<
    dyn Fn(
            CancellationToken,
            mpsc::Sender<DepthInfo>,
            usize,
            Vec<Symbol>,
        ) -> BoxFuture<'static, Result<(), AggregatorError>>
        + Send
        + Sync,
>;

#[derive(Debug, Default)]
struct WatchState {
    watching: bool,
    symbols: Vec<Symbol>,
    depth_limit: usize,
}

/// Venue-agnostic market access. Each adapter supplies its fetch closure and,
/// when the venue supports it, a streaming closure; everything else here is
/// shared bookkeeping.
#[derive(Clone)]
pub struct MarketManager {
    fetch_depth_fn: FetchDepthFn,
    watch_depth_fn: Option<WatchDepthFn>,
    state: Arc<Mutex<WatchState>>,
}

/// Resets the watching flag on every exit path out of the watch future,
/// including panics and cancellation.
struct WatchGuard {
    state: Arc<Mutex<WatchState>>,
}

impl WatchGuard {
    fn begin(state: &Arc<Mutex<WatchState>>, symbols: &[Symbol], depth_limit: usize) -> Self {
        let mut guard = state.lock().unwrap();
        guard.watching = true;
        guard.symbols = symbols.to_vec();
        guard.depth_limit = depth_limit;
        WatchGuard {
            state: Arc::clone(state),
        }
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        let mut guard = self.state.lock().unwrap();
        guard.watching = false;
        guard.symbols.clear();
        guard.depth_limit = 0;
    }
}

impl MarketManager {
    pub fn new(fetch_depth_fn: FetchDepthFn, watch_depth_fn: Option<WatchDepthFn>) -> Self {
        MarketManager {
            fetch_depth_fn,
            watch_depth_fn,
            state: Arc::new(Mutex::new(WatchState::default())),
        }
    }

    /// Snapshot of the top `limit` levels (0 means [`DEFAULT_DEPTH_LIMIT`]).
    /// A snapshot carrying an error is surfaced as `Err`, never returned.
    pub async fn fetch_depth(
        &self,
        symbol: Symbol,
        limit: usize,
    ) -> Result<DepthInfo, AggregatorError> {
        let limit = if limit == 0 { DEFAULT_DEPTH_LIMIT } else { limit };
        let info = (self.fetch_depth_fn)(symbol, limit).await;
        if let Some(err) = info.err {
            return Err(err);
        }
        Ok(info)
    }

    /// Streams depth snapshots until cancelled or the stream dies. Fails with
    /// `UnsupportedOperation` before touching any state when the venue has no
    /// streaming transport.
    pub async fn ws_watch_market_depth(
        &self,
        shutdown: CancellationToken,
        out: mpsc::Sender<DepthInfo>,
        limit: usize,
        symbols: Vec<Symbol>,
    ) -> Result<(), AggregatorError> {
        let watch_fn = self
            .watch_depth_fn
            .as_ref()
            .ok_or(AggregatorError::UnsupportedOperation("ws_watch_market_depth"))?
            .clone();
        let limit = if limit == 0 { DEFAULT_DEPTH_LIMIT } else { limit };

        let _guard = WatchGuard::begin(&self.state, &symbols, limit);
        info!(?symbols, limit, "starting market depth watch");
        let result = watch_fn(shutdown, out, limit, symbols).await;
        info!("market depth watch stopped");
        result
    }

    pub fn is_watching(&self) -> bool {
        self.state.lock().unwrap().watching
    }

    pub fn watching_symbols(&self) -> Vec<Symbol> {
        self.state.lock().unwrap().symbols.clone()
    }

    /// Effective per-side level count of the running watch; 0 when idle.
    pub fn watching_depth_limit(&self) -> usize {
        self.state.lock().unwrap().depth_limit
    }
}
