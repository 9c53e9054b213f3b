//! Relay client: one persistent, self-healing connection to the relay.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use agent_relay_core::{AgentContext, CancellationToken};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use crate::{
    RelayError,
    config::RelayClientConfig,
    protocol::{BrowserMessage, RelayMessage},
};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// What a session subscriber observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A relay message for the subscribed session.
    Message(RelayMessage),
    /// The connection dropped; no further messages will arrive.
    Disconnected,
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

/// Outbound queue of one live socket. `epoch` tells sockets apart across
/// reconnects.
struct Link {
    epoch: u64,
    tx: mpsc::UnboundedSender<Message>,
}

struct ClientInner {
    config: RelayClientConfig,
    outbound: Mutex<Option<Link>>,
    next_epoch: AtomicU64,
    connected: watch::Sender<bool>,
    /// `None` until the relay sent its first handler list on this connection.
    handlers: watch::Sender<Option<Vec<String>>>,
    subscribers: Mutex<HashMap<String, Subscriber>>,
    next_subscriber: AtomicU64,
    /// Cancelled by `disconnect`; stops the reconnect loop.
    lifetime: Mutex<Option<CancellationToken>>,
    connecting: tokio::sync::Mutex<()>,
}

/// Client end of the relay protocol.
///
/// Cheap to clone. After the first successful [`connect`](Self::connect),
/// an unexpected close is followed by reconnect attempts at a fixed interval
/// until [`disconnect`](Self::disconnect).
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<ClientInner>,
}

impl RelayClient {
    #[must_use]
    pub fn new(config: RelayClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                outbound: Mutex::new(None),
                next_epoch: AtomicU64::new(1),
                connected: watch::Sender::new(false),
                handlers: watch::Sender::new(None),
                subscribers: Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(1),
                lifetime: Mutex::new(None),
                connecting: tokio::sync::Mutex::new(()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RelayClientConfig {
        &self.inner.config
    }

    /// Connect if not already connected.
    ///
    /// # Errors
    /// Returns error if the relay cannot be reached.
    pub async fn connect(&self) -> Result<(), RelayError> {
        let _guard = self.inner.connecting.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        if let Some(previous) = self.inner.lifetime.lock().take() {
            previous.cancel();
        }

        let stream = self.open().await?;
        let lifetime = CancellationToken::new();
        *self.inner.lifetime.lock() = Some(lifetime.clone());
        // Mark connected before returning so callers can send right away.
        let (epoch, outbound) = self.attach();
        tokio::spawn(self.clone().supervise(stream, epoch, outbound, lifetime));
        Ok(())
    }

    /// Close the connection and stop reconnecting.
    ///
    /// The client reports disconnected as soon as this returns.
    pub fn disconnect(&self) {
        let Some(lifetime) = self.inner.lifetime.lock().take() else {
            return;
        };
        tracing::info!(url = %self.inner.config.url, "Disconnecting from relay");
        lifetime.cancel();
        let epoch = self.inner.outbound.lock().as_ref().map(|link| link.epoch);
        if let Some(epoch) = epoch {
            self.detach(epoch);
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Connection state changes.
    #[must_use]
    pub fn subscribe_connection(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    /// Handler list changes. `None` until the relay sent a list.
    #[must_use]
    pub fn subscribe_handlers(&self) -> watch::Receiver<Option<Vec<String>>> {
        self.inner.handlers.subscribe()
    }

    /// Last handler list received, empty if none yet.
    #[must_use]
    pub fn handlers(&self) -> Vec<String> {
        self.inner.handlers.borrow().clone().unwrap_or_default()
    }

    /// Receive every message for `session_id` until the subscription drops.
    ///
    /// A newer subscription for the same session replaces this one.
    #[must_use]
    pub fn subscribe_session(&self, session_id: &str) -> SessionSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .insert(session_id.to_string(), Subscriber { id, tx });
        SessionSubscription {
            inner: Arc::clone(&self.inner),
            session_id: session_id.to_string(),
            id,
            rx,
        }
    }

    /// Queue a message for the relay.
    ///
    /// # Errors
    /// Returns error if not connected or the message cannot be serialized.
    pub fn send(&self, msg: &BrowserMessage) -> Result<(), RelayError> {
        let json = serde_json::to_string(msg)?;
        let outbound = self.inner.outbound.lock();
        let link = outbound.as_ref().ok_or(RelayError::NotConnected)?;
        link.tx
            .send(Message::Text(json.into()))
            .map_err(|_| RelayError::Closed)
    }

    /// # Errors
    /// Returns error if not connected.
    pub fn send_agent_request(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
        context: AgentContext,
    ) -> Result<(), RelayError> {
        self.send(&BrowserMessage::AgentRequest {
            agent_id: agent_id.to_string(),
            session_id: session_id.map(str::to_string),
            context,
        })
    }

    /// # Errors
    /// Returns error if not connected.
    pub fn abort_agent(&self, agent_id: &str, session_id: &str) -> Result<(), RelayError> {
        self.send(&BrowserMessage::AgentAbort {
            agent_id: agent_id.to_string(),
            session_id: session_id.to_string(),
        })
    }

    /// # Errors
    /// Returns error if not connected.
    pub fn undo_agent(&self, agent_id: &str) -> Result<(), RelayError> {
        self.send(&BrowserMessage::AgentUndo {
            agent_id: agent_id.to_string(),
        })
    }

    /// # Errors
    /// Returns error if not connected.
    pub fn redo_agent(&self, agent_id: &str) -> Result<(), RelayError> {
        self.send(&BrowserMessage::AgentRedo {
            agent_id: agent_id.to_string(),
        })
    }

    async fn open(&self) -> Result<WsStream, RelayError> {
        let url = &self.inner.config.url;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| RelayError::Connect {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        tracing::info!(%url, "Connected to relay");
        Ok(stream)
    }

    /// Install a fresh outbound queue and flip to connected.
    fn attach(&self) -> (u64, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let epoch = self.inner.next_epoch.fetch_add(1, Ordering::Relaxed);
        *self.inner.outbound.lock() = Some(Link { epoch, tx });
        self.inner.connected.send_replace(true);
        (epoch, rx)
    }

    async fn supervise(
        self,
        mut stream: WsStream,
        mut epoch: u64,
        mut outbound: mpsc::UnboundedReceiver<Message>,
        lifetime: CancellationToken,
    ) {
        loop {
            self.pump(stream, outbound, &lifetime).await;
            self.detach(epoch);
            if lifetime.is_cancelled() {
                return;
            }

            tracing::warn!(url = %self.inner.config.url, "Relay connection lost, reconnecting");
            stream = loop {
                tokio::select! {
                    () = lifetime.cancelled() => return,
                    () = tokio::time::sleep(self.inner.config.reconnect_interval()) => {}
                }
                match self.open().await {
                    Ok(stream) => break stream,
                    Err(e) => tracing::debug!("Reconnect failed: {e}"),
                }
            };
            // Serialized with `connect` so a superseded loop never installs its socket.
            let guard = self.inner.connecting.lock().await;
            if lifetime.is_cancelled() {
                return;
            }
            (epoch, outbound) = self.attach();
            drop(guard);
        }
    }

    async fn pump(
        &self,
        stream: WsStream,
        mut outbound: mpsc::UnboundedReceiver<Message>,
        lifetime: &CancellationToken,
    ) {
        let (mut sink, mut source) = stream.split();
        loop {
            tokio::select! {
                () = lifetime.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
                msg = outbound.recv() => {
                    let Some(msg) = msg else { return };
                    if let Err(e) = sink.send(msg).await {
                        tracing::debug!("Relay send failed: {e}");
                        return;
                    }
                }
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.on_frame(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("Relay read failed: {e}");
                        return;
                    }
                },
            }
        }
    }

    fn on_frame(&self, text: &str) {
        let msg: RelayMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Ignoring malformed relay frame: {e}");
                return;
            }
        };

        match &msg {
            RelayMessage::Handlers { handlers } => {
                tracing::debug!(?handlers, "Handler list updated");
                self.inner.handlers.send_replace(Some(handlers.clone()));
            }
            RelayMessage::Health => tracing::debug!("Relay health echo"),
            RelayMessage::AgentStatus { session_id, .. }
            | RelayMessage::AgentDone { session_id, .. }
            | RelayMessage::AgentError { session_id, .. } => {
                let subscribers = self.inner.subscribers.lock();
                match subscribers.get(session_id) {
                    Some(sub) => {
                        let _ = sub.tx.send(SessionEvent::Message(msg.clone()));
                    }
                    None => tracing::debug!(%session_id, "Message for unsubscribed session"),
                }
            }
        }
    }

    /// Flip to disconnected and tell every session subscriber.
    ///
    /// No-op unless `epoch` is still the live socket; a stale socket must not
    /// tear down a newer one.
    fn detach(&self, epoch: u64) {
        {
            let mut outbound = self.inner.outbound.lock();
            if !outbound.as_ref().is_some_and(|link| link.epoch == epoch) {
                return;
            }
            *outbound = None;
        }
        self.inner.connected.send_replace(false);
        self.inner.handlers.send_replace(None);
        for sub in self.inner.subscribers.lock().values() {
            let _ = sub.tx.send(SessionEvent::Disconnected);
        }
    }
}

/// Messages for one session. Unsubscribes on drop.
pub struct SessionSubscription {
    inner: Arc<ClientInner>,
    session_id: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionSubscription {
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next event; `None` once replaced by a newer subscription.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Next already-delivered event, without waiting.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for SessionSubscription {
    fn drop(&mut self) {
        let mut subscribers = self.inner.subscribers.lock();
        if subscribers
            .get(&self.session_id)
            .is_some_and(|sub| sub.id == self.id)
        {
            subscribers.remove(&self.session_id);
        }
    }
}
