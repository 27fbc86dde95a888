use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, warn};
use url::Url;

use super::alert::AlertDispatcher;
use crate::error::AggregatorError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Interval between keepalive pings; also the pong deadline per tick.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(45);
const WRITE_DEADLINE: Duration = Duration::from_secs(5);
const MAX_MISSED_PONGS: u32 = 2;

/// Raw frame handler. Invoked from the read loop strictly in frame-arrival
/// order and awaited inline, so a slow handler delays the next read.
pub type MessageHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// One managed WebSocket connection: dial, read loop, keepalive, write and
/// idempotent close. A closed session is terminal; owners reconnect by
/// constructing a new session.
#[derive(Clone)]
pub struct WsSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for WsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSession")
            .field("endpoint", &self.inner.endpoint)
            .finish_non_exhaustive()
    }
}

struct SessionInner {
    endpoint: String,
    sink: Mutex<WsSink>,
    // Close-once guard: the first caller flips the flag and performs the
    // actual shutdown; everyone else returns immediately.
    closed: StdMutex<bool>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    last_pong: StdMutex<Instant>,
    alerts: AlertDispatcher,
}

impl WsSession {
    pub async fn connect(
        endpoint: &str,
        handler: MessageHandler,
        alerts: AlertDispatcher,
    ) -> Result<Self, AggregatorError> {
        Self::connect_with_interval(endpoint, handler, alerts, KEEPALIVE_INTERVAL).await
    }

    /// Same as [`WsSession::connect`] with an injectable keepalive interval.
    pub async fn connect_with_interval(
        endpoint: &str,
        handler: MessageHandler,
        alerts: AlertDispatcher,
        keepalive_interval: Duration,
    ) -> Result<Self, AggregatorError> {
        Url::parse(endpoint).map_err(AggregatorError::ws)?;

        let (stream, _response) =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(endpoint))
                .await
                .map_err(|_| AggregatorError::WebsocketError("handshake timed out".into()))?
                .map_err(AggregatorError::ws)?;
        let (sink, source) = stream.split();

        let (done_tx, done_rx) = watch::channel(false);
        let session = WsSession {
            inner: Arc::new(SessionInner {
                endpoint: endpoint.to_string(),
                sink: Mutex::new(sink),
                closed: StdMutex::new(false),
                done_tx,
                done_rx,
                last_pong: StdMutex::new(Instant::now()),
                alerts,
            }),
        };
        session.spawn_read_loop(source, handler);
        session.spawn_keepalive(keepalive_interval);
        Ok(session)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Idempotent close. Only the first call closes the socket, fires the
    /// done signal and emits the alert.
    pub async fn close(&self, reason: Option<AggregatorError>) {
        self.inner.close(reason).await;
    }

    /// Serializes `msg` to JSON and sends it. Silent no-op once the session
    /// is closed; a failed send triggers the regular close path.
    pub async fn write<T: Serialize>(&self, msg: &T) {
        if self.is_closed() {
            return;
        }
        let text = match serde_json::to_string(msg) {
            Ok(text) => text,
            Err(err) => {
                error!(%err, "failed to serialize websocket message");
                return;
            }
        };
        if let Err(err) = self.inner.send(Message::Text(text)).await {
            error!(%err, "websocket error when writing message");
            self.inner.close(Some(AggregatorError::ws(err))).await;
        }
    }

    /// Receiver that flips to `true` exactly once, on close.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.inner.done_rx.clone()
    }

    pub async fn wait_closed(&self) {
        let mut done = self.done();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    fn spawn_read_loop(&self, mut source: WsSource, handler: MessageHandler) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                if inner.is_closed() {
                    return;
                }
                match source.next().await {
                    Some(Ok(Message::Text(text))) => handler(text.into_bytes()).await,
                    Some(Ok(Message::Binary(payload))) => handler(payload).await,
                    Some(Ok(Message::Pong(_))) => {
                        *inner.last_pong.lock().unwrap() = Instant::now();
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        // Server-initiated ping, answer in-line.
                        let _ = inner.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "websocket closed by peer");
                        inner
                            .close(Some(AggregatorError::WebsocketError(
                                "closed by peer".into(),
                            )))
                            .await;
                        return;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(err)) => {
                        error!(%err, "websocket error when reading message");
                        inner.close(Some(AggregatorError::ws(err))).await;
                        return;
                    }
                    None => {
                        inner
                            .close(Some(AggregatorError::WebsocketError(
                                "stream ended".into(),
                            )))
                            .await;
                        return;
                    }
                }
            }
        });
    }

    fn spawn_keepalive(&self, interval: Duration) {
        let inner = Arc::clone(&self.inner);
        let mut done = self.done();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            let mut missed_pongs = 0u32;
            loop {
                if inner.is_closed() {
                    return;
                }
                match tokio::time::timeout(WRITE_DEADLINE, inner.send(Message::Ping(Vec::new())))
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        error!(%err, "websocket error when writing ping");
                        inner.close(Some(AggregatorError::ws(err))).await;
                        return;
                    }
                    Err(_) => {
                        inner
                            .close(Some(AggregatorError::WebsocketError(
                                "ping write deadline exceeded".into(),
                            )))
                            .await;
                        return;
                    }
                }

                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = done.changed() => return,
                }

                if inner.last_pong.lock().unwrap().elapsed() > interval {
                    missed_pongs += 1;
                    warn!(cnt = missed_pongs, "websocket ping/pong timeout");
                    if missed_pongs >= MAX_MISSED_PONGS {
                        inner.close(Some(AggregatorError::KeepaliveTimeout)).await;
                        return;
                    }
                } else {
                    missed_pongs = 0;
                }
            }
        });
    }
}

impl SessionInner {
    fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }

    async fn send(
        &self,
        msg: Message,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let mut sink = self.sink.lock().await;
        sink.send(msg).await
    }

    async fn close(&self, reason: Option<AggregatorError>) {
        {
            let mut closed = self.closed.lock().unwrap();
            if *closed {
                return;
            }
            *closed = true;
        }

        let _ = tokio::time::timeout(WRITE_DEADLINE, self.send(Message::Close(None))).await;
        let _ = self.done_tx.send(true);
        self.alerts
            .notify_now(reason, "websocket closed", &self.endpoint);
    }
}
