//! The chat engine: one connection, one registry, one handler table.
//!
//! The owner drives the engine with [`ChatEngine::process_next`]; callbacks
//! run inside that call, never concurrently with it.

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::backoff::Backoff;
use crate::config::{AbandonPolicy, Config, ConnectionSection};
use crate::connection::{ConnectionError, ConnectionManager, SocketState, TransportEvent};
use crate::ids::{RequestIdSource, UuidRequestIds};
use crate::messages::{self, ClientEvent, EncodeError};
use crate::registry::{PendingRequest, RegistryError};
use crate::router::{Handlers, StreamRouter};

const CONNECTION_LOST: &str = "connection lost";

/// Why an outbound event was not sent. All variants are caller bugs or a
/// connection that is not ready; none of them touched the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Duplicate(#[from] RegistryError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Client side of the chat protocol: owns the socket, the pending requests
/// and the callbacks they are reported through.
pub struct ChatEngine {
    connection: ConnectionManager,
    router: StreamRouter,
    ids: Box<dyn RequestIdSource>,
    settings: ConnectionSection,
    backoff: Backoff,
}

impl ChatEngine {
    /// Create an engine for `endpoint` (token already applied). Does not
    /// connect; fails only on a malformed URL.
    pub fn init(
        endpoint: &str,
        handlers: Handlers,
        settings: ConnectionSection,
    ) -> Result<Self, ConnectionError> {
        let endpoint = Url::parse(endpoint)?;
        Ok(Self::with_endpoint(endpoint, handlers, settings))
    }

    /// Create an engine from a loaded config: server endpoint plus token and
    /// connection settings.
    pub fn from_config(config: &Config, handlers: Handlers) -> Result<Self, ConnectionError> {
        let endpoint = config.server.endpoint()?;
        Ok(Self::with_endpoint(endpoint, handlers, config.connection.clone()))
    }

    fn with_endpoint(endpoint: Url, handlers: Handlers, settings: ConnectionSection) -> Self {
        let backoff = Backoff::from_settings(&settings);
        Self {
            connection: ConnectionManager::new(endpoint),
            router: StreamRouter::new(handlers),
            ids: Box::new(UuidRequestIds),
            settings,
            backoff,
        }
    }

    /// Replace the default UUID request ids.
    pub fn with_id_source(mut self, ids: impl RequestIdSource + 'static) -> Self {
        self.ids = Box::new(ids);
        self
    }

    /// Override the reconnect schedule derived from the settings.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// A fresh request id from the configured source.
    pub fn next_request_id(&mut self) -> String {
        self.ids.next_id()
    }

    /// True while the socket is open and `send` may be called.
    pub fn is_ready(&self) -> bool {
        self.connection.is_ready()
    }

    /// Observable connection state; `Open` means ready.
    pub fn ready(&self) -> watch::Receiver<SocketState> {
        self.connection.subscribe()
    }

    /// Start connecting. No-op while open or connecting.
    pub fn connect(&mut self) {
        self.connection.connect();
    }

    /// Connect and wait for the socket to open, within the connect timeout.
    pub async fn open(&mut self) -> Result<(), ConnectionError> {
        if self.is_ready() {
            return Ok(());
        }
        // The previous socket's last events must not be mistaken for the new one's.
        while let Some(event) = self.connection.try_next_event() {
            self.handle_event(event);
        }
        self.connection.connect();
        let timeout = self.settings.connect_timeout();
        match tokio::time::timeout(timeout, self.await_open()).await {
            Ok(result) => result,
            Err(_) => {
                self.connection.close();
                Err(ConnectionError::Timeout(timeout))
            }
        }
    }

    /// Retry [`ChatEngine::open`] with exponential backoff. Pending requests are
    /// not resent.
    pub async fn reconnect(&mut self) -> Result<(), ConnectionError> {
        let backoff = self.backoff;
        let mut last = ConnectionError::NotConnected;
        for (attempt, delay) in backoff.attempts() {
            info!(
                "Reconnection attempt {} of {}, waiting {:?}",
                attempt, backoff.max_retries, delay
            );
            tokio::time::sleep(delay).await;
            match self.open().await {
                Ok(()) => {
                    info!("Reconnected on attempt {}", attempt);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Reconnection attempt {} failed: {}", attempt, e);
                    last = e;
                }
            }
        }
        warn!("Failed to reconnect after {} attempts", backoff.max_retries);
        Err(last)
    }

    /// Encode, register and send. On any failure the registry is unchanged.
    pub fn send(&mut self, event: ClientEvent) -> Result<(), SendError> {
        let frame = messages::encode(&event)?;
        if !self.connection.is_ready() {
            return Err(ConnectionError::NotConnected.into());
        }
        let (request_id, conversation_id) = match &event {
            ClientEvent::UserMessage(m) => (m.request_id.as_str(), m.conversation_id),
        };
        self.router.begin(request_id, conversation_id)?;
        if let Err(e) = self.connection.send(frame) {
            self.router.dispose(request_id);
            return Err(e.into());
        }
        debug!(%request_id, "user_message sent");
        Ok(())
    }

    /// The in-flight state of a pending request.
    pub fn pending(&self, request_id: &str) -> Option<&PendingRequest> {
        self.router.registry().get(request_id)
    }

    /// Whether `request_id` is still awaiting a terminal event.
    pub fn is_pending(&self, request_id: &str) -> bool {
        self.router.registry().contains(request_id)
    }

    /// Number of requests still awaiting a terminal event.
    pub fn pending_count(&self) -> usize {
        self.router.registry().len()
    }

    /// Forget a request locally (page teardown, caller timeout). The server is
    /// not told; its late frames are dropped.
    pub fn dispose(&mut self, request_id: &str) -> bool {
        self.router.dispose(request_id)
    }

    /// Wait for the next transport event and dispatch it. Returns `false` once
    /// the event channel is gone.
    pub async fn process_next(&mut self) -> bool {
        match self.connection.next_event().await {
            Some(event) => {
                self.handle_event(event);
                true
            }
            None => false,
        }
    }

    /// Dispatch one transport event synchronously.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => info!("connection ready"),
            TransportEvent::Frame(text) => match messages::decode(&text) {
                Ok(event) => self.router.dispatch(event),
                Err(e) => warn!("dropping malformed frame: {} - {}", e, text),
            },
            TransportEvent::Closed => {
                self.router.transport_error("WebSocket closed");
                self.apply_abandon_policy();
            }
            TransportEvent::Failed(detail) => {
                debug!("transport failure: {}", detail);
                self.router.transport_error("WebSocket error");
                self.apply_abandon_policy();
            }
        }
    }

    /// Close the socket. Pending requests follow the abandon policy.
    pub fn disconnect(&mut self) {
        self.connection.close();
        self.apply_abandon_policy();
    }

    /// Tear the engine down. No callback fires after this; requests that were
    /// still pending are returned.
    pub fn shutdown(mut self) -> Vec<PendingRequest> {
        self.connection.close();
        let leftover = self.router.dispose_all();
        info!(pending = leftover.len(), "engine shut down");
        leftover
    }

    async fn await_open(&mut self) -> Result<(), ConnectionError> {
        loop {
            match self.connection.next_event().await {
                Some(TransportEvent::Opened) => {
                    info!("connection ready");
                    return Ok(());
                }
                Some(TransportEvent::Failed(detail)) => {
                    return Err(ConnectionError::ConnectFailed(detail));
                }
                Some(TransportEvent::Closed) => {
                    return Err(ConnectionError::ConnectFailed("closed during handshake".into()));
                }
                Some(other) => self.handle_event(other),
                None => return Err(ConnectionError::NotConnected),
            }
        }
    }

    fn apply_abandon_policy(&mut self) {
        match self.settings.abandon_policy {
            AbandonPolicy::FailPending => {
                let failed = self.router.abandon_all(CONNECTION_LOST).len();
                if failed > 0 {
                    warn!(failed, "failed pending requests after connection loss");
                }
            }
            AbandonPolicy::KeepPending => {
                let pending = self.router.registry().len();
                if pending > 0 {
                    debug!(pending, "keeping pending requests after connection loss");
                }
            }
        }
    }
}

impl std::fmt::Debug for ChatEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatEngine")
            .field("state", &self.connection.state())
            .field("pending", &self.router.registry().len())
            .field("settings", &self.settings)
            .finish()
    }
}
