use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

const DECLARE_QUEUE_CAPACITY: usize = 64;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const REPORT_CHANNEL_CAPACITY: usize = 16;

/// The long-running capabilities whose health the checker tracks. The gating
/// set for "all healthy" is whatever the constructor was given, so adding a
/// feature here cannot silently widen or narrow the order gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeFeature {
    BinanceUserDataWatch,
    BinanceMarketDepthWatch,
    MexcUserDataWatch,
    MexcMarketDepthWatch,
}

impl ExchangeFeature {
    pub fn all_features() -> Vec<ExchangeFeature> {
        vec![
            ExchangeFeature::BinanceUserDataWatch,
            ExchangeFeature::BinanceMarketDepthWatch,
            ExchangeFeature::MexcUserDataWatch,
            ExchangeFeature::MexcMarketDepthWatch,
        ]
    }
}

impl fmt::Display for ExchangeFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeFeature::BinanceUserDataWatch => write!(f, "binance user data watch"),
            ExchangeFeature::BinanceMarketDepthWatch => write!(f, "binance market depth watch"),
            ExchangeFeature::MexcUserDataWatch => write!(f, "MEXC user data watch"),
            ExchangeFeature::MexcMarketDepthWatch => write!(f, "MEXC market depth watch"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

/// Published to subscribers whenever the system-wide verdict may have moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    pub state: HealthState,
    pub time: DateTime<Utc>,
}

struct HealthEvent {
    feature: ExchangeFeature,
    state: HealthState,
}

/// Serializes health declarations through a single task so state transitions
/// and report publication never interleave.
#[derive(Clone)]
pub struct HealthChecker {
    states: Arc<RwLock<HashMap<ExchangeFeature, HealthState>>>,
    gating: Arc<Vec<ExchangeFeature>>,
    tx: mpsc::Sender<HealthEvent>,
    reports: broadcast::Sender<HealthReport>,
}

impl HealthChecker {
    /// `gating` is the conjunction set: the system is healthy only when every
    /// listed feature is healthy. Features start unhealthy.
    pub fn new(gating: Vec<ExchangeFeature>) -> Self {
        let mut initial = HashMap::new();
        for feature in &gating {
            initial.insert(*feature, HealthState::Unhealthy);
        }
        let states = Arc::new(RwLock::new(initial));
        let gating = Arc::new(gating);
        let (tx, mut rx) = mpsc::channel::<HealthEvent>(DECLARE_QUEUE_CAPACITY);
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);

        let checker = HealthChecker {
            states: Arc::clone(&states),
            gating: Arc::clone(&gating),
            tx,
            reports: reports.clone(),
        };

        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        let Some(event) = event else { return };
                        Self::handle(&states, &gating, &reports, event);
                    }
                    _ = heartbeat.tick() => {
                        info!("health checker heartbeat");
                    }
                }
            }
        });
        checker
    }

    /// Fire-and-forget declaration; ordering per caller is preserved by the
    /// queue. Never blocks the declaring task.
    pub fn declare(&self, feature: ExchangeFeature, state: HealthState) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(HealthEvent { feature, state }).await;
        });
    }

    pub fn is_all_features_healthy(&self) -> bool {
        let states = self.states.read().unwrap();
        self.gating
            .iter()
            .all(|f| states.get(f) == Some(&HealthState::Healthy))
    }

    pub fn feature_state(&self, feature: ExchangeFeature) -> Option<HealthState> {
        self.states.read().unwrap().get(&feature).copied()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthReport> {
        self.reports.subscribe()
    }

    fn handle(
        states: &RwLock<HashMap<ExchangeFeature, HealthState>>,
        gating: &[ExchangeFeature],
        reports: &broadcast::Sender<HealthReport>,
        event: HealthEvent,
    ) {
        let all_healthy = {
            let mut map = states.write().unwrap();
            map.insert(event.feature, event.state);
            gating
                .iter()
                .all(|f| map.get(f) == Some(&HealthState::Healthy))
        };

        match event.state {
            HealthState::Unhealthy => {
                warn!(feature = %event.feature, "feature declared unhealthy");
                let _ = reports.send(HealthReport {
                    state: HealthState::Unhealthy,
                    time: Utc::now(),
                });
            }
            HealthState::Healthy => {
                info!(feature = %event.feature, "feature declared healthy");
                // A single recovery is only reportable once the whole
                // conjunction holds.
                if all_healthy {
                    let _ = reports.send(HealthReport {
                        state: HealthState::Healthy,
                        time: Utc::now(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_for_state(
        checker: &HealthChecker,
        feature: ExchangeFeature,
        want: HealthState,
    ) {
        for _ in 0..200 {
            if checker.feature_state(feature) == Some(want) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("feature {feature} never reached {want:?}");
    }

    #[tokio::test]
    async fn healthy_report_only_when_conjunction_holds() {
        let gating = vec![
            ExchangeFeature::BinanceUserDataWatch,
            ExchangeFeature::BinanceMarketDepthWatch,
            ExchangeFeature::MexcUserDataWatch,
        ];
        let checker = HealthChecker::new(gating);
        let mut reports = checker.subscribe();
        assert!(!checker.is_all_features_healthy());

        checker.declare(ExchangeFeature::BinanceUserDataWatch, HealthState::Healthy);
        wait_for_state(
            &checker,
            ExchangeFeature::BinanceUserDataWatch,
            HealthState::Healthy,
        )
        .await;
        checker.declare(
            ExchangeFeature::BinanceMarketDepthWatch,
            HealthState::Healthy,
        );
        wait_for_state(
            &checker,
            ExchangeFeature::BinanceMarketDepthWatch,
            HealthState::Healthy,
        )
        .await;
        // Two of three healthy must not publish a healthy report.
        assert!(matches!(
            reports.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert!(!checker.is_all_features_healthy());

        checker.declare(ExchangeFeature::MexcUserDataWatch, HealthState::Healthy);
        let report = tokio::time::timeout(Duration::from_secs(1), reports.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.state, HealthState::Healthy);
        assert!(checker.is_all_features_healthy());
    }

    #[tokio::test]
    async fn unhealthy_report_publishes_unconditionally() {
        let checker = HealthChecker::new(vec![ExchangeFeature::MexcMarketDepthWatch]);
        let mut reports = checker.subscribe();

        checker.declare(
            ExchangeFeature::MexcMarketDepthWatch,
            HealthState::Unhealthy,
        );
        let report = tokio::time::timeout(Duration::from_secs(1), reports.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.state, HealthState::Unhealthy);
        assert!(!checker.is_all_features_healthy());
    }

    #[tokio::test]
    async fn mexc_depth_watch_participates_in_gating() {
        // MexcMarketDepthWatch is deliberately part of the default gating set.
        let checker = HealthChecker::new(ExchangeFeature::all_features());
        for feature in ExchangeFeature::all_features() {
            checker.declare(feature, HealthState::Healthy);
            wait_for_state(&checker, feature, HealthState::Healthy).await;
        }
        assert!(checker.is_all_features_healthy());

        checker.declare(
            ExchangeFeature::MexcMarketDepthWatch,
            HealthState::Unhealthy,
        );
        wait_for_state(
            &checker,
            ExchangeFeature::MexcMarketDepthWatch,
            HealthState::Unhealthy,
        )
        .await;
        assert!(!checker.is_all_features_healthy());
    }
}
