// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::redundant_pub_crate,
    clippy::missing_panics_doc,
    clippy::significant_drop_tightening
)]

//! Integration tests for the live socket path.
//!
//! Runs an in-process axum WebSocket server that speaks the chat frame
//! protocol and drives a real [`WsConnector`] against it:
//! - the token travels as a query parameter and a bad one is refused
//! - sends are confirmed over the socket without touching REST
//! - pushed messages reach the conversation store and the unread counter
//! - an abnormal close triggers a reconnect; a client disconnect sends 1000

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use chatlink::api::memory::{ApiCall, InMemoryApi};
use chatlink::auth::SharedToken;
use chatlink::chat::send::SendConfig;
use chatlink::chat::store::StoreConfig;
use chatlink::client::ChatClient;
use chatlink::connection::websocket::WsConnector;
use chatlink::connection::{
    ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState,
    EventKind,
};
use chatlink_proto::frame::{ClientFrame, ServerFrame};
use chatlink_proto::message::{MessageId, RawMessage, UserId, UserRef};

const TOKEN: &str = "live-token";

// =============================================================================
// Mock chat server
// =============================================================================

/// What the mock server saw and how to reach its open sockets.
#[derive(Default)]
struct ChatServer {
    connections: AtomicUsize,
    next_id: AtomicU64,
    received: Mutex<Vec<ClientFrame>>,
    close_codes: Mutex<Vec<Option<u16>>>,
    sockets: Mutex<Vec<mpsc::UnboundedSender<Message>>>,
}

impl ChatServer {
    fn push(&self, message: Message) {
        self.sockets.lock().retain(|tx| tx.send(message.clone()).is_ok());
    }

    fn push_frame(&self, frame: &ServerFrame) {
        self.push(Message::Text(serde_json::to_string(frame).unwrap().into()));
    }

    fn close_all(&self, code: u16) {
        self.push(Message::Close(Some(CloseFrame {
            code,
            reason: "server restart".into(),
        })));
    }

    fn message_frames(&self) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|f| !matches!(f, ClientFrame::Ping))
            .count()
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(server): State<Arc<ChatServer>>,
) -> Response {
    if params.get("token").map(String::as_str) != Some(TOKEN) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, server))
}

async fn handle_socket(mut socket: WebSocket, server: Arc<ChatServer>) {
    server.connections.fetch_add(1, Ordering::SeqCst);
    let (tx, mut outbound) = mpsc::unbounded_channel();
    server.sockets.lock().push(tx);

    loop {
        tokio::select! {
            pushed = outbound.recv() => {
                let Some(message) = pushed else { break };
                let closing = matches!(message, Message::Close(_));
                if socket.send(message).await.is_err() || closing {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(frame) = serde_json::from_str::<ClientFrame>(text.as_str()) else {
                            continue;
                        };
                        server.received.lock().push(frame.clone());
                        if let Some(reply) = confirm(&server, frame) {
                            let json = serde_json::to_string(&reply).unwrap();
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        server.close_codes.lock().push(frame.map(|f| f.code));
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => break,
                }
            }
        }
    }
}

/// The server's answer to one client frame: a stored echo for messages, a
/// pong for pings.
fn confirm(server: &ChatServer, frame: ClientFrame) -> Option<ServerFrame> {
    let id = MessageId::new(server.next_id.fetch_add(1, Ordering::SeqCst) + 500);
    match frame {
        ClientFrame::Message {
            recipient_id,
            content,
            client_ref,
            ..
        } => Some(ServerFrame::Message {
            message: RawMessage {
                id: Some(id),
                sender: Some(me()),
                recipient: Some(UserRef::id_only(recipient_id)),
                content: Some(content),
                ..RawMessage::default()
            },
            client_ref,
        }),
        ClientFrame::GroupMessage {
            group_id,
            content,
            client_ref,
            ..
        } => Some(ServerFrame::GroupMessage {
            message: RawMessage {
                id: Some(id),
                sender: Some(me()),
                group_id: Some(group_id),
                content: Some(content),
                ..RawMessage::default()
            },
            client_ref,
        }),
        ClientFrame::Ping => Some(ServerFrame::Pong),
        ClientFrame::Read { .. } => None,
    }
}

async fn start_server() -> (SocketAddr, Arc<ChatServer>) {
    let server = Arc::new(ChatServer::default());
    let app = axum::Router::new()
        .route("/ws/chat/", axum::routing::get(ws_handler))
        .with_state(Arc::clone(&server));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, server)
}

// =============================================================================
// Client helpers
// =============================================================================

fn me() -> UserRef {
    UserRef::named(UserId::new(1), "alice")
}

fn connection_config(addr: SocketAddr) -> ConnectionConfig {
    ConnectionConfig {
        reconnect_interval: Duration::from_millis(100),
        heartbeat_interval: Duration::from_secs(3600),
        connect_timeout: Duration::from_secs(2),
        ..ConnectionConfig::new(Url::parse(&format!("ws://{addr}/ws/chat/")).unwrap())
    }
}

fn client(
    addr: SocketAddr,
    token: &str,
) -> (Arc<InMemoryApi>, ChatClient<InMemoryApi, WsConnector>) {
    let api = Arc::new(InMemoryApi::new(me()));
    let connection = ConnectionManager::new(
        WsConnector,
        Arc::new(SharedToken::new(token)),
        connection_config(addr),
    );
    let client = ChatClient::new(
        Arc::clone(&api),
        connection,
        me(),
        SendConfig::default(),
        StoreConfig::default(),
    );
    (api, client)
}

/// Polls `check` until it holds or five seconds pass.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn connects_with_token_in_query() {
    let (addr, server) = start_server().await;
    let (_api, client) = client(addr, TOKEN);

    client.connect().await;

    assert_eq!(client.connection().state(), ConnectionState::Connected);
    eventually("server to register the socket", || {
        server.connections.load(Ordering::SeqCst) == 1
    })
    .await;
    client.disconnect();
}

#[tokio::test]
async fn send_is_confirmed_over_socket() {
    let (addr, server) = start_server().await;
    let (api, client) = client(addr, TOKEN);
    client.connect().await;

    let direct = client.send_message(UserId::new(2), "over the wire").await.unwrap();
    let group = client
        .send_group_message(chatlink_proto::message::GroupId::new(7), "team update")
        .await
        .unwrap();

    assert_eq!(direct.id, Some(MessageId::new(500)));
    assert_eq!(group.id, Some(MessageId::new(501)));
    assert_eq!(server.message_frames(), 2);
    assert_eq!(api.count_calls(|c| matches!(c, ApiCall::SendMessage(_))), 0);
    assert_eq!(client.sender().pending_count(), 0);
    assert_eq!(client.unread_count(), 0, "own echoes are not unread");
    client.disconnect();
}

#[tokio::test]
async fn pushed_message_updates_store_and_counter() {
    let (addr, server) = start_server().await;
    let (_api, client) = client(addr, TOKEN);
    client.connect().await;
    eventually("socket registration", || !server.sockets.lock().is_empty()).await;

    let mut unread = client.watch_unread();
    server.push_frame(&ServerFrame::Message {
        message: RawMessage {
            id: Some(MessageId::new(42)),
            sender: Some(UserRef::named(UserId::new(3), "carol")),
            recipient: Some(me()),
            content: Some("are you there?".into()),
            ..RawMessage::default()
        },
        client_ref: None,
    });
    tokio::time::timeout(Duration::from_secs(5), unread.changed())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(client.unread_count(), 1);
    let previews = client.store().previews();
    assert_eq!(previews[0].title, "carol");
    assert_eq!(previews[0].unread_count, 1);
    client.disconnect();
}

#[tokio::test]
async fn abnormal_close_reconnects() {
    let (addr, server) = start_server().await;
    let (_api, client) = client(addr, TOKEN);

    let connects = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(Mutex::new(Vec::new()));
    {
        let connects = Arc::clone(&connects);
        client.connection().on(EventKind::Connected, move |_| {
            connects.fetch_add(1, Ordering::SeqCst);
        });
        let disconnects = Arc::clone(&disconnects);
        client.connection().on(EventKind::Disconnected, move |e| {
            if let ConnectionEvent::Disconnected { code } = e {
                disconnects.lock().push(*code);
            }
        });
    }

    client.connect().await;
    eventually("first socket", || server.connections.load(Ordering::SeqCst) == 1).await;
    server.close_all(4001);

    eventually("reconnect", || connects.load(Ordering::SeqCst) == 2).await;
    assert_eq!(server.connections.load(Ordering::SeqCst), 2);
    assert_eq!(disconnects.lock().first(), Some(&Some(4001)));
    assert_eq!(client.connection().reconnect_attempts(), 0);
    client.disconnect();
}

#[tokio::test]
async fn client_disconnect_sends_normal_closure() {
    let (addr, server) = start_server().await;
    let (_api, client) = client(addr, TOKEN);
    client.connect().await;
    eventually("socket registration", || !server.sockets.lock().is_empty()).await;

    client.disconnect();

    eventually("close frame", || !server.close_codes.lock().is_empty()).await;
    assert_eq!(server.close_codes.lock()[0], Some(1000));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.connections.load(Ordering::SeqCst), 1, "no reconnect after 1000");
}

#[tokio::test]
async fn rejected_token_exhausts_reconnects() {
    let (addr, server) = start_server().await;
    let api = Arc::new(InMemoryApi::new(me()));
    let connection = ConnectionManager::new(
        WsConnector,
        Arc::new(SharedToken::new("wrong")),
        ConnectionConfig {
            max_reconnect_attempts: 2,
            ..connection_config(addr)
        },
    );
    let client = ChatClient::new(api, connection, me(), SendConfig::default(), StoreConfig::default());

    let errors = Arc::new(Mutex::new(Vec::new()));
    {
        let errors = Arc::clone(&errors);
        client.connection().on(EventKind::Error, move |e| {
            if let ConnectionEvent::Error(err) = e {
                errors.lock().push(err.clone());
            }
        });
    }

    client.connect().await;

    eventually("reconnects to give up", || {
        errors
            .lock()
            .iter()
            .any(|e| matches!(e, ConnectionError::MaxReconnectExceeded { .. }))
    })
    .await;
    let errors = errors.lock();
    assert_eq!(
        errors.last(),
        Some(&ConnectionError::MaxReconnectExceeded { attempts: 2 })
    );
    assert!(
        errors[..errors.len() - 1]
            .iter()
            .all(|e| matches!(e, ConnectionError::Transport(_)))
    );
    assert_eq!(server.connections.load(Ordering::SeqCst), 0);
    assert_eq!(client.connection().state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn send_after_server_vanishes_falls_back_to_rest() {
    let (addr, server) = start_server().await;
    let (api, client) = client(addr, TOKEN);
    client.connect().await;
    eventually("socket registration", || !server.sockets.lock().is_empty()).await;

    client.disconnect();
    let message = client.send_message(UserId::new(2), "via http").await.unwrap();

    assert_eq!(api.count_calls(|c| matches!(c, ApiCall::SendMessage(_))), 1);
    assert!(message.id.is_some());
    assert_eq!(server.message_frames(), 0);
}
