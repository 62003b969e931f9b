//! The single persistent WebSocket: connect, observe open/close/error, send.
//!
//! Socket I/O runs in one spawned task per socket instance. The task reports
//! what it observes as [`TransportEvent`]s on a channel that the owner drains
//! with [`ConnectionManager::next_event`], so nothing the socket does reaches
//! caller code except through the owner. Every instance carries an epoch;
//! events from an instance closed locally are discarded. A socket that died on
//! its own still delivers its final events, even after a reconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

/// Socket state as seen by callers. Only `Open` is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Disconnected,
    Connecting,
    Open,
}

/// What a socket task observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Frame(String),
    Closed,
    Failed(String),
}

/// Why the socket could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("WebSocket not connected")]
    NotConnected,
    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("connection failed: {0}")]
    ConnectFailed(String),
    #[error("timed out after {0:?} waiting for the connection")]
    Timeout(Duration),
}

struct Envelope {
    epoch: u64,
    event: TransportEvent,
}

/// Publishes state changes for one socket instance, unless it was superseded.
struct StateGate {
    epoch: u64,
    current: Arc<AtomicU64>,
    state: Arc<watch::Sender<SocketState>>,
    events: mpsc::UnboundedSender<Envelope>,
}

impl StateGate {
    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.epoch
    }

    fn publish(&self, state: SocketState) {
        self.state.send_if_modified(|s| {
            if self.is_current() && *s != state {
                *s = state;
                true
            } else {
                false
            }
        });
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(Envelope {
            epoch: self.epoch,
            event,
        });
    }

    /// `Open` is published before `Opened` is queued so that a reader of the
    /// event may send at once. A terminal event is queued before
    /// `Disconnected`, so whoever observes the state can already drain it.
    fn report(&self, state: SocketState, event: TransportEvent) {
        if state == SocketState::Open {
            self.publish(state);
            self.emit(event);
        } else {
            self.emit(event);
            self.publish(state);
        }
    }
}

/// Owns the socket handle and the `ready` signal.
pub struct ConnectionManager {
    url: Url,
    epoch: Arc<AtomicU64>,
    accept_from: u64,
    state_tx: Arc<watch::Sender<SocketState>>,
    state_rx: watch::Receiver<SocketState>,
    events_tx: mpsc::UnboundedSender<Envelope>,
    events_rx: mpsc::UnboundedReceiver<Envelope>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// `url` is the full endpoint, token included (see [`endpoint_url`]).
    pub fn new(url: Url) -> Self {
        let (state_tx, state_rx) = watch::channel(SocketState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            url,
            epoch: Arc::new(AtomicU64::new(0)),
            accept_from: 0,
            state_tx: Arc::new(state_tx),
            state_rx,
            events_tx,
            events_rx,
            outbound: None,
            task: None,
        }
    }

    /// Current socket state.
    pub fn state(&self) -> SocketState {
        *self.state_rx.borrow()
    }

    /// True only while the socket is open.
    pub fn is_ready(&self) -> bool {
        self.state() == SocketState::Open
    }

    /// Observable socket state; `Open` means ready.
    pub fn subscribe(&self) -> watch::Receiver<SocketState> {
        self.state_rx.clone()
    }

    /// Open a socket unless one is already open or connecting. Must be called
    /// inside a tokio runtime.
    pub fn connect(&mut self) {
        if matches!(self.state(), SocketState::Open | SocketState::Connecting) {
            debug!("connect skipped: socket already {:?}", self.state());
            return;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.state_tx.send_replace(SocketState::Connecting);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.outbound = Some(outbound_tx);
        let gate = StateGate {
            epoch,
            current: self.epoch.clone(),
            state: self.state_tx.clone(),
            events: self.events_tx.clone(),
        };
        info!(epoch, "connecting to {}", redact_token(&self.url));
        let url = self.url.to_string();
        self.task = Some(tokio::spawn(run_socket(url, gate, outbound_rx)));
    }

    /// Wait until a pending connect resolves. Returns immediately when open.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), ConnectionError> {
        let mut rx = self.state_rx.clone();
        let settled = rx.wait_for(|s| *s != SocketState::Connecting);
        let settled = tokio::time::timeout(timeout, settled)
            .await
            .map_err(|_| ConnectionError::Timeout(timeout))?
            .map(|s| *s)
            .map_err(|_| ConnectionError::NotConnected)?;
        match settled {
            SocketState::Open => Ok(()),
            _ => Err(ConnectionError::ConnectFailed(format!(
                "could not open {}",
                redact_token(&self.url)
            ))),
        }
    }

    /// Queue one text frame on the open socket. Nothing is buffered for a
    /// socket that is not open.
    pub fn send(&self, frame: String) -> Result<(), ConnectionError> {
        if !self.is_ready() {
            return Err(ConnectionError::NotConnected);
        }
        let outbound = self.outbound.as_ref().ok_or(ConnectionError::NotConnected)?;
        outbound
            .send(Message::Text(frame))
            .map_err(|_| ConnectionError::NotConnected)
    }

    /// Next event from the current socket. Pending forever while no socket
    /// produces events.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            let envelope = self.events_rx.recv().await?;
            if envelope.epoch >= self.accept_from {
                return Some(envelope.event);
            }
            debug!(epoch = envelope.epoch, "discarding event from a closed socket");
        }
    }

    /// An already queued event, without waiting.
    pub fn try_next_event(&mut self) -> Option<TransportEvent> {
        while let Ok(envelope) = self.events_rx.try_recv() {
            if envelope.epoch >= self.accept_from {
                return Some(envelope.event);
            }
        }
        None
    }

    /// Release the socket. Events it already produced are never delivered.
    /// Dropping the outbound channel lets the socket task send a close frame.
    pub fn close(&mut self) {
        self.accept_from = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.outbound = None;
        self.task = None;
        self.state_tx.send_replace(SocketState::Disconnected);
        while self.events_rx.try_recv().is_ok() {}
        debug!("connection closed locally");
    }
}

async fn run_socket(
    url: String,
    gate: StateGate,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!("WebSocket connect failed: {}", e);
            gate.report(SocketState::Disconnected, TransportEvent::Failed(e.to_string()));
            return;
        }
    };
    info!(epoch = gate.epoch, "WebSocket open");
    gate.report(SocketState::Open, TransportEvent::Opened);

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => gate.emit(TransportEvent::Frame(text)),
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("WebSocket closed by server");
                    gate.report(SocketState::Disconnected, TransportEvent::Closed);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    let failure = TransportEvent::Failed(e.to_string());
                    gate.report(SocketState::Disconnected, failure);
                    return;
                }
            },
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        error!("WebSocket send failed: {}", e);
                        let failure = TransportEvent::Failed(e.to_string());
                        gate.report(SocketState::Disconnected, failure);
                        return;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    return;
                }
            },
        }
    }
}

/// Parse `base` and set the auth token as its single `token` query parameter.
/// An empty token leaves the URL as parsed.
pub fn endpoint_url(base: &str, token: Option<&str>) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(base)?;
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .into_owned()
            .filter(|(key, _)| key != "token")
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair("token", token);
    }
    Ok(url)
}

/// The endpoint with any `token` value masked, for logs and errors.
fn redact_token(url: &Url) -> String {
    if !url.query_pairs().any(|(key, _)| key == "token") {
        return url.to_string();
    }
    let masked: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| {
            let value = if key == "token" { "***".into() } else { value.into_owned() };
            (key.into_owned(), value)
        })
        .collect();
    let mut redacted = url.clone();
    redacted.query_pairs_mut().clear().extend_pairs(masked);
    redacted.to_string()
}
