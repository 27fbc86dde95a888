use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::error::AggregatorError;

const ALERT_QUEUE_CAPACITY: usize = 256;

/// Destination for operator alerts. The shipped sink logs; a Telegram or
/// pager transport plugs in behind the same trait.
pub trait AlertSink: Send + Sync {
    fn notify(&self, err: Option<&AggregatorError>, message: &str, context: &str);
}

pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, err: Option<&AggregatorError>, message: &str, context: &str) {
        match err {
            Some(err) => warn!(%err, context, "{message}"),
            None => warn!(context, "{message}"),
        }
    }
}

#[derive(Debug)]
struct Alert {
    err: Option<AggregatorError>,
    message: String,
    context: String,
}

/// Fire-and-forget alert dispatch over a bounded queue. A full queue drops
/// the alert and counts the drop instead of spawning without bound under a
/// sustained outage.
#[derive(Clone)]
pub struct AlertDispatcher {
    tx: mpsc::Sender<Alert>,
    dropped: Arc<AtomicU64>,
}

impl AlertDispatcher {
    /// Spawns the worker task; call from within a runtime.
    pub fn new(sink: Arc<dyn AlertSink>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Alert>(ALERT_QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(alert) = rx.recv().await {
                sink.notify(alert.err.as_ref(), &alert.message, &alert.context);
            }
        });
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Never blocks and never fails the caller; delivery is best-effort.
    pub fn notify_now(&self, err: Option<AggregatorError>, message: &str, context: &str) {
        let alert = Alert {
            err,
            message: message.to_string(),
            context: context.to_string(),
        };
        if self.tx.try_send(alert).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped, "alert queue full, dropping alert");
        }
    }

    pub fn dropped_alerts(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for AlertDispatcher {
    fn default() -> Self {
        Self::new(Arc::new(LogAlertSink))
    }
}
