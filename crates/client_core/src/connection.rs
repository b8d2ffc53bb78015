//! Push-connection registry: one resilient logical connection per session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::domain::SessionKey;
use shared::error::EngineError;
use shared::protocol::{ClientAction, PushEvent};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

pub(crate) const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);
pub(crate) const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(10);
const FRAME_CHANNEL_CAPACITY: usize = 1024;
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Decoded inbound frame. Payloads that fail to parse as the typed envelope
/// pass through raw instead of being dropped.
#[derive(Debug, Clone)]
pub enum PushFrame {
    Event(PushEvent),
    Raw(String),
}

/// Duplex text channel to one provider push socket.
pub struct PushSocket {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn open(&self, session: &SessionKey) -> Result<PushSocket>;
}

/// Production transport: a websocket carrying the session key as a query
/// parameter, split into forwarding tasks so the connection manager only
/// sees channels.
pub struct WsPushTransport {
    base: Url,
}

impl WsPushTransport {
    pub fn new(base: Url) -> Self {
        Self { base }
    }
}

#[async_trait]
impl PushTransport for WsPushTransport {
    async fn open(&self, session: &SessionKey) -> Result<PushSocket> {
        let mut url = self.base.clone();
        url.query_pairs_mut().append_pair("session", session.as_str());

        let (stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect push websocket: {url}"))?;
        let (mut sink, mut source) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<String>(FRAME_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        Ok(PushSocket {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

struct ConnectionInner {
    state: ConnectionState,
    attempts: u32,
    manual_close: bool,
    outbound: Option<mpsc::Sender<String>>,
}

pub struct ManagedConnection {
    session: SessionKey,
    inner: Mutex<ConnectionInner>,
    frames: broadcast::Sender<PushFrame>,
    status_tx: watch::Sender<ConnectionState>,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedConnection {
    fn new(session: SessionKey) -> Arc<Self> {
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        let (status_tx, _) = watch::channel(ConnectionState::Idle);
        Arc::new(Self {
            session,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Idle,
                attempts: 0,
                manual_close: false,
                outbound: None,
            }),
            frames,
            status_tx,
            run_task: Mutex::new(None),
        })
    }

    pub fn session(&self) -> &SessionKey {
        &self.session
    }

    /// Dropping the receiver unsubscribes; a lagging or panicking consumer
    /// cannot block delivery to the remaining receivers.
    pub fn subscribe(&self) -> broadcast::Receiver<PushFrame> {
        self.frames.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.status_tx.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn attempts(&self) -> u32 {
        self.inner.lock().await.attempts
    }

    /// Write an outbound action to the open socket.
    pub async fn send(&self, action: &ClientAction) -> Result<()> {
        let outbound = {
            let guard = self.inner.lock().await;
            match (&guard.state, &guard.outbound) {
                (ConnectionState::Open, Some(outbound)) => outbound.clone(),
                _ => return Err(EngineError::NotConnected(self.session.clone()).into()),
            }
        };
        let payload = serde_json::to_string(action)?;
        outbound
            .send(payload)
            .await
            .map_err(|_| EngineError::NotConnected(self.session.clone()).into())
    }

    fn publish_state(&self, state: ConnectionState) {
        self.status_tx.send_replace(state);
    }

    /// Deliberate shutdown. While `Connecting`, the in-flight attempt is left
    /// alone; the run loop drops the socket the moment it opens, so there is
    /// no close-before-established race. In every other state the run loop
    /// is stopped outright (it may be parked on the socket or sleeping out a
    /// backoff delay).
    pub(crate) async fn begin_manual_close(&self) {
        {
            let mut guard = self.inner.lock().await;
            guard.manual_close = true;
            if guard.state == ConnectionState::Connecting {
                return;
            }
            // Dropping the writer tears the socket down.
            guard.outbound = None;
            guard.state = ConnectionState::Closed;
        }
        if let Some(task) = self.run_task.lock().await.take() {
            task.abort();
        }
        self.publish_state(ConnectionState::Closed);
    }

    async fn run(self: Arc<Self>, transport: Arc<dyn PushTransport>) {
        loop {
            {
                let mut guard = self.inner.lock().await;
                if guard.manual_close {
                    guard.state = ConnectionState::Closed;
                    drop(guard);
                    self.publish_state(ConnectionState::Closed);
                    return;
                }
                guard.state = ConnectionState::Connecting;
            }
            self.publish_state(ConnectionState::Connecting);

            match transport.open(&self.session).await {
                Ok(socket) => {
                    let PushSocket {
                        outbound,
                        mut inbound,
                    } = socket;
                    let closed_while_connecting = {
                        let mut guard = self.inner.lock().await;
                        if guard.manual_close {
                            true
                        } else {
                            guard.state = ConnectionState::Open;
                            guard.attempts = 0;
                            guard.outbound = Some(outbound);
                            false
                        }
                    };
                    if closed_while_connecting {
                        // Socket established after close() was requested:
                        // drop it immediately and stay down.
                        drop(inbound);
                        self.inner.lock().await.state = ConnectionState::Closed;
                        self.publish_state(ConnectionState::Closed);
                        return;
                    }
                    self.publish_state(ConnectionState::Open);
                    info!(session = %self.session, "push: connection open");

                    while let Some(text) = inbound.recv().await {
                        let _ = self.frames.send(decode_frame(&text));
                    }

                    let manual = {
                        let mut guard = self.inner.lock().await;
                        guard.outbound = None;
                        guard.state = ConnectionState::Closed;
                        guard.manual_close
                    };
                    self.publish_state(ConnectionState::Closed);
                    if manual {
                        return;
                    }
                    warn!(session = %self.session, "push: connection lost");
                }
                Err(err) => {
                    let manual = {
                        let mut guard = self.inner.lock().await;
                        guard.state = ConnectionState::Closed;
                        guard.manual_close
                    };
                    self.publish_state(ConnectionState::Closed);
                    if manual {
                        return;
                    }
                    warn!(session = %self.session, error = %err, "push: connect attempt failed");
                }
            }

            // This loop is the only place a reconnect delay is armed, so the
            // timer can never be scheduled twice concurrently.
            let delay = {
                let mut guard = self.inner.lock().await;
                guard.attempts = guard.attempts.saturating_add(1);
                backoff_delay(guard.attempts)
            };
            debug!(
                session = %self.session,
                delay_ms = delay.as_millis() as u64,
                "push: reconnect scheduled"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Exponential backoff for the given consecutive-failure count, capped.
pub(crate) fn backoff_delay(attempts: u32) -> Duration {
    let shift = attempts.saturating_sub(1).min(16);
    RECONNECT_BASE_DELAY
        .saturating_mul(1u32 << shift)
        .min(RECONNECT_MAX_DELAY)
}

fn decode_frame(text: &str) -> PushFrame {
    match serde_json::from_str::<PushEvent>(text) {
        Ok(event) => PushFrame::Event(event),
        Err(err) => {
            warn!(error = %err, "push: unparseable frame, passing through raw");
            PushFrame::Raw(text.to_string())
        }
    }
}

/// Owns every push connection for the client. Scoped to the client's
/// lifetime and injected into dependents, never a process-global.
pub struct ConnectionRegistry {
    transport: Arc<dyn PushTransport>,
    connections: Mutex<HashMap<SessionKey, Arc<ManagedConnection>>>,
}

impl ConnectionRegistry {
    pub fn new(transport: Arc<dyn PushTransport>) -> Self {
        Self {
            transport,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// At most one logical connection per session key; concurrent calls
    /// attach to the existing connection.
    pub async fn ensure(&self, session: &SessionKey) -> Arc<ManagedConnection> {
        let mut guard = self.connections.lock().await;
        if let Some(existing) = guard.get(session) {
            return Arc::clone(existing);
        }
        let connection = ManagedConnection::new(session.clone());
        let task = tokio::spawn(Arc::clone(&connection).run(Arc::clone(&self.transport)));
        *connection.run_task.lock().await = Some(task);
        guard.insert(session.clone(), Arc::clone(&connection));
        connection
    }

    pub async fn subscribe(&self, session: &SessionKey) -> broadcast::Receiver<PushFrame> {
        self.ensure(session).await.subscribe()
    }

    pub async fn get(&self, session: &SessionKey) -> Option<Arc<ManagedConnection>> {
        self.connections.lock().await.get(session).cloned()
    }

    /// Deliberate shutdown: the connection stays closed and leaves the
    /// registry, so a later `ensure` starts fresh.
    pub async fn close(&self, session: &SessionKey) {
        let connection = { self.connections.lock().await.remove(session) };
        if let Some(connection) = connection {
            connection.begin_manual_close().await;
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<_> = {
            let mut guard = self.connections.lock().await;
            guard.drain().map(|(_, connection)| connection).collect()
        };
        for connection in drained {
            connection.begin_manual_close().await;
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
