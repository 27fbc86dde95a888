use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;

use crate::aggregator::alert::{AlertDispatcher, AlertSink};
use crate::aggregator::types::{Asset, Exchange, Symbol};
use crate::aggregator::websocket::{MessageHandler, WsSession};
use crate::aggregator::DepthAggregator;
use crate::config::AggregatorConfig;
use crate::error::AggregatorError;

struct CountingSink {
    count: AtomicU64,
    reasons: Mutex<Vec<Option<AggregatorError>>>,
}

impl CountingSink {
    fn new() -> Arc<Self> {
        Arc::new(CountingSink {
            count: AtomicU64::new(0),
            reasons: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }
}

impl AlertSink for CountingSink {
    fn notify(&self, err: Option<&AggregatorError>, _message: &str, _context: &str) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.reasons.lock().unwrap().push(err.cloned());
    }
}

fn noop_handler() -> MessageHandler {
    Arc::new(|_payload| Box::pin(async {}))
}

/// Server that accepts one connection and keeps reading frames, so client
/// pings get answered with pongs by the protocol layer.
async fn spawn_reading_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });
    addr
}

/// Server that accepts the handshake and then never reads, so pings are
/// never answered.
async fn spawn_silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
    });
    addr
}

async fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[tokio::test]
async fn concurrent_close_emits_single_alert() {
    crate::init_logging();
    let addr = spawn_reading_server().await;
    let sink = CountingSink::new();
    let alerts = AlertDispatcher::new(Arc::clone(&sink) as Arc<dyn AlertSink>);

    let session = WsSession::connect(&format!("ws://{addr}"), noop_handler(), alerts)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            session.close(None).await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(session.is_closed());
    session.wait_closed().await;
    assert!(
        wait_for(|| sink.count() == 1, Duration::from_secs(1)).await,
        "expected exactly one close alert, got {}",
        sink.count()
    );
}

#[tokio::test]
async fn missed_pongs_close_the_session() {
    crate::init_logging();
    let addr = spawn_silent_server().await;
    let sink = CountingSink::new();
    let alerts = AlertDispatcher::new(Arc::clone(&sink) as Arc<dyn AlertSink>);

    let interval = Duration::from_millis(100);
    let session = WsSession::connect_with_interval(
        &format!("ws://{addr}"),
        noop_handler(),
        alerts,
        interval,
    )
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(5), session.wait_closed())
        .await
        .expect("session should close after missed pongs");
    assert!(session.is_closed());

    assert!(wait_for(|| sink.count() == 1, Duration::from_secs(1)).await);
    let reasons = sink.reasons.lock().unwrap();
    assert!(matches!(
        reasons[0],
        Some(AggregatorError::KeepaliveTimeout)
    ));
}

#[tokio::test]
async fn write_after_close_is_a_no_op() {
    let addr = spawn_reading_server().await;
    let session = WsSession::connect(
        &format!("ws://{addr}"),
        noop_handler(),
        AlertDispatcher::default(),
    )
    .await
    .unwrap();

    session.close(None).await;
    // Must neither panic nor reopen the session.
    session
        .write(&serde_json::json!({"method": "SUBSCRIPTION"}))
        .await;
    assert!(session.is_closed());
}

#[tokio::test]
async fn handler_sees_frames_in_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        for i in 0..5 {
            ws.send(Message::Text(format!("frame-{i}"))).await.unwrap();
        }
        while let Some(Ok(_)) = ws.next().await {}
    });

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let handler_seen = Arc::clone(&seen);
    let handler: MessageHandler = Arc::new(move |payload| {
        let seen = Arc::clone(&handler_seen);
        Box::pin(async move {
            seen.lock()
                .unwrap()
                .push(String::from_utf8_lossy(&payload).into_owned());
        })
    });

    let _session = WsSession::connect(
        &format!("ws://{addr}"),
        handler,
        AlertDispatcher::default(),
    )
    .await
    .unwrap();

    assert!(
        wait_for(|| seen.lock().unwrap().len() == 5, Duration::from_secs(2)).await,
        "frames not delivered"
    );
    let seen = seen.lock().unwrap();
    let expected: Vec<String> = (0..5).map(|i| format!("frame-{i}")).collect();
    assert_eq!(*seen, expected);
}

#[tokio::test]
async fn invalid_endpoint_is_rejected_before_dialing() {
    let err = WsSession::connect("not a url", noop_handler(), AlertDispatcher::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AggregatorError::WebsocketError(_)));
}

#[tokio::test]
async fn aggregator_registers_all_venues() {
    let aggregator = DepthAggregator::new(AggregatorConfig::default()).unwrap();
    let registry = aggregator.registry();
    assert_eq!(registry.len(), 4);

    // Primary venues rank ahead of the defaults.
    let ranked = registry.iter_ranked();
    let head: Vec<Exchange> = ranked.iter().take(2).map(|p| p.exchange).collect();
    assert!(head.contains(&Exchange::Binance));
    assert!(head.contains(&Exchange::Mexc));

    // No credentials configured: market data only on the trading venues.
    let binance = registry.by_exchange(Exchange::Binance).unwrap();
    assert!(binance.manager.account().is_none());
    assert!(binance.manager.orders().is_none());

    // MEXC has no depth stream; watching must fail fast without state churn.
    let mexc = registry.by_exchange(Exchange::Mexc).unwrap().manager.market();
    let (tx, _rx) = mpsc::channel(1);
    let err = mexc
        .ws_watch_market_depth(
            CancellationToken::new(),
            tx,
            0,
            vec![Symbol::new(Asset::new("ETH"))],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AggregatorError::UnsupportedOperation(_)));
    assert!(!mexc.is_watching());

    // Both monitor endpoints resolve from the registry.
    assert!(aggregator.monitor(Exchange::Binance, Exchange::Mexc).is_ok());
    assert!(!aggregator.health().is_all_features_healthy());
}
