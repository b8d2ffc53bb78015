use std::collections::HashMap as StdHashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::anyhow;
use axum::extract::ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query as AxumQuery, State};
use axum::routing::get;
use axum::Router;
use shared::domain::ChatKey;
use shared::protocol::{ChatAddress, PeerKind};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Notify};
use tokio::time::timeout;

use super::*;

struct ServerSide {
    inbound_tx: mpsc::Sender<String>,
    outbound_rx: mpsc::Receiver<String>,
}

/// In-memory transport with scripted connect failures and an optional gate
/// holding attempts in flight.
struct ChannelTransport {
    fail_first: u32,
    opens: AtomicU32,
    gate: Option<Arc<Notify>>,
    server_sides: Mutex<Vec<ServerSide>>,
}

impl ChannelTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_first: 0,
            opens: AtomicU32::new(0),
            gate: None,
            server_sides: Mutex::new(Vec::new()),
        })
    }

    fn failing_first(fail_first: u32) -> Arc<Self> {
        Arc::new(Self {
            fail_first,
            opens: AtomicU32::new(0),
            gate: None,
            server_sides: Mutex::new(Vec::new()),
        })
    }

    fn gated(gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            fail_first: 0,
            opens: AtomicU32::new(0),
            gate: Some(gate),
            server_sides: Mutex::new(Vec::new()),
        })
    }

    async fn take_server_side(&self) -> ServerSide {
        for _ in 0..100 {
            if let Some(server) = self.server_sides.lock().await.pop() {
                return server;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no server side available");
    }
}

#[async_trait]
impl PushTransport for ChannelTransport {
    async fn open(&self, _session: &SessionKey) -> Result<PushSocket> {
        let attempt = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if attempt <= self.fail_first {
            return Err(anyhow!("scripted connect failure"));
        }
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        self.server_sides.lock().await.push(ServerSide {
            inbound_tx,
            outbound_rx,
        });
        Ok(PushSocket {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

fn session() -> SessionKey {
    SessionKey::new("sess-1")
}

fn typing_event() -> PushEvent {
    PushEvent::TypingStart {
        chat: ChatKey::new("telegram", "acct", "chat-1"),
        user: "alice".to_string(),
    }
}

async fn wait_for_state(connection: &ManagedConnection, target: ConnectionState) {
    let mut status = connection.status();
    timeout(Duration::from_secs(5), async {
        loop {
            if *status.borrow_and_update() == target {
                return;
            }
            status.changed().await.expect("status channel closed");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("connection never reached {target:?}"));
}

#[tokio::test]
async fn ensure_attaches_to_existing_connection() {
    let transport = ChannelTransport::new();
    let registry = ConnectionRegistry::new(transport.clone());

    let first = registry.ensure(&session()).await;
    let second = registry.ensure(&session()).await;
    assert!(Arc::ptr_eq(&first, &second));

    wait_for_state(&first, ConnectionState::Open).await;
    assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn frames_fan_out_to_every_subscriber() {
    let transport = ChannelTransport::new();
    let registry = ConnectionRegistry::new(transport.clone());
    let connection = registry.ensure(&session()).await;
    wait_for_state(&connection, ConnectionState::Open).await;

    let mut first = connection.subscribe();
    let mut second = connection.subscribe();
    let server = transport.take_server_side().await;
    server
        .inbound_tx
        .send(serde_json::to_string(&typing_event()).unwrap())
        .await
        .unwrap();

    for receiver in [&mut first, &mut second] {
        let frame = timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("frame timeout")
            .expect("frame");
        match frame {
            PushFrame::Event(event) => assert_eq!(event, typing_event()),
            PushFrame::Raw(raw) => panic!("unexpected raw frame: {raw}"),
        }
    }
}

#[tokio::test]
async fn unparseable_frame_passes_through_raw() {
    let transport = ChannelTransport::new();
    let registry = ConnectionRegistry::new(transport.clone());
    let connection = registry.ensure(&session()).await;
    wait_for_state(&connection, ConnectionState::Open).await;

    let mut frames = connection.subscribe();
    let server = transport.take_server_side().await;
    server.inbound_tx.send("not json".to_string()).await.unwrap();
    server
        .inbound_tx
        .send(serde_json::to_string(&typing_event()).unwrap())
        .await
        .unwrap();

    match timeout(Duration::from_secs(5), frames.recv()).await.unwrap() {
        Ok(PushFrame::Raw(raw)) => assert_eq!(raw, "not json"),
        other => panic!("expected raw frame, got {other:?}"),
    }
    // the bad frame did not stop delivery
    match timeout(Duration::from_secs(5), frames.recv()).await.unwrap() {
        Ok(PushFrame::Event(event)) => assert_eq!(event, typing_event()),
        other => panic!("expected event frame, got {other:?}"),
    }
}

#[tokio::test]
async fn reconnects_with_backoff_and_resets_attempts() {
    let transport = ChannelTransport::failing_first(2);
    let registry = ConnectionRegistry::new(transport.clone());
    let connection = registry.ensure(&session()).await;

    wait_for_state(&connection, ConnectionState::Open).await;
    assert_eq!(transport.opens.load(Ordering::SeqCst), 3);
    assert_eq!(connection.attempts().await, 0);
}

#[test]
fn backoff_delay_grows_and_never_exceeds_cap() {
    assert_eq!(backoff_delay(1), RECONNECT_BASE_DELAY);
    assert_eq!(backoff_delay(2), RECONNECT_BASE_DELAY * 2);
    assert_eq!(backoff_delay(3), RECONNECT_BASE_DELAY * 4);
    for attempts in 1..64 {
        assert!(backoff_delay(attempts) <= RECONNECT_MAX_DELAY);
    }
    assert_eq!(backoff_delay(40), RECONNECT_MAX_DELAY);
}

#[tokio::test]
async fn manual_close_while_connecting_closes_socket_after_open() {
    let gate = Arc::new(Notify::new());
    let transport = ChannelTransport::gated(gate.clone());
    let registry = ConnectionRegistry::new(transport.clone());
    let connection = registry.ensure(&session()).await;
    wait_for_state(&connection, ConnectionState::Connecting).await;

    // Deliberate shutdown while the attempt is still in flight.
    registry.close(&session()).await;
    gate.notify_one();

    wait_for_state(&connection, ConnectionState::Closed).await;
    let mut server = transport.take_server_side().await;
    // The freshly established socket was dropped immediately upon open.
    assert!(timeout(Duration::from_secs(5), server.outbound_rx.recv())
        .await
        .expect("socket close timeout")
        .is_none());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.opens.load(Ordering::SeqCst), 1, "no reconnect after manual close");
}

#[tokio::test]
async fn close_removes_connection_from_registry() {
    let transport = ChannelTransport::new();
    let registry = ConnectionRegistry::new(transport.clone());
    let first = registry.ensure(&session()).await;
    wait_for_state(&first, ConnectionState::Open).await;

    registry.close(&session()).await;
    assert!(registry.get(&session()).await.is_none());
    wait_for_state(&first, ConnectionState::Closed).await;

    let second = registry.ensure(&session()).await;
    assert!(!Arc::ptr_eq(&first, &second));
    wait_for_state(&second, ConnectionState::Open).await;
    assert_eq!(transport.opens.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn send_requires_an_open_connection() {
    let gate = Arc::new(Notify::new());
    let transport = ChannelTransport::gated(gate);
    let registry = ConnectionRegistry::new(transport);
    let connection = registry.ensure(&session()).await;
    wait_for_state(&connection, ConnectionState::Connecting).await;

    let action = ClientAction::TypingStart {
        address: ChatAddress::new(ChatKey::new("telegram", "acct", "chat-1"), PeerKind::User),
    };
    let err = connection.send(&action).await.expect_err("must fail");
    assert!(err.to_string().contains("no open push connection"));
}

#[tokio::test]
async fn send_writes_action_to_socket() {
    let transport = ChannelTransport::new();
    let registry = ConnectionRegistry::new(transport.clone());
    let connection = registry.ensure(&session()).await;
    wait_for_state(&connection, ConnectionState::Open).await;

    let action = ClientAction::TypingStart {
        address: ChatAddress::new(ChatKey::new("telegram", "acct", "chat-1"), PeerKind::User),
    };
    connection.send(&action).await.expect("send");

    let mut server = transport.take_server_side().await;
    let payload = timeout(Duration::from_secs(5), server.outbound_rx.recv())
        .await
        .expect("payload timeout")
        .expect("payload");
    let decoded: ClientAction = serde_json::from_str(&payload).unwrap();
    assert_eq!(decoded, action);
}

#[derive(Clone)]
struct WsServerState {
    session_tx: Arc<Mutex<Option<oneshot::Sender<String>>>>,
    echo_tx: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

async fn push_route(
    AxumQuery(params): AxumQuery<StdHashMap<String, String>>,
    State(state): State<WsServerState>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    ws.on_upgrade(move |socket| handle_push_socket(socket, params, state))
}

async fn handle_push_socket(
    mut socket: WebSocket,
    params: StdHashMap<String, String>,
    state: WsServerState,
) {
    if let Some(tx) = state.session_tx.lock().await.take() {
        let _ = tx.send(params.get("session").cloned().unwrap_or_default());
    }
    let _ = socket
        .send(AxumWsMessage::Text("server-frame".to_string()))
        .await;
    while let Some(Ok(message)) = socket.recv().await {
        if let AxumWsMessage::Text(text) = message {
            if let Some(tx) = state.echo_tx.lock().await.take() {
                let _ = tx.send(text);
            }
            break;
        }
    }
}

#[tokio::test]
async fn ws_transport_round_trips_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (session_tx, session_rx) = oneshot::channel();
    let (echo_tx, echo_rx) = oneshot::channel();
    let state = WsServerState {
        session_tx: Arc::new(Mutex::new(Some(session_tx))),
        echo_tx: Arc::new(Mutex::new(Some(echo_tx))),
    };
    let app = Router::new().route("/push", get(push_route)).with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let transport = WsPushTransport::new(Url::parse(&format!("ws://{addr}/push")).unwrap());
    let mut socket = transport.open(&SessionKey::new("sess-9")).await.expect("connect");

    assert_eq!(session_rx.await.unwrap(), "sess-9");
    let frame = timeout(Duration::from_secs(5), socket.inbound.recv())
        .await
        .expect("frame timeout");
    assert_eq!(frame.as_deref(), Some("server-frame"));

    socket.outbound.send("client-frame".to_string()).await.unwrap();
    assert_eq!(echo_rx.await.unwrap(), "client-frame");
}
