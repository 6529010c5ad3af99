// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::needless_pass_by_value
)]

//! Integration tests for the REST side.
//!
//! An in-process axum server mimics the chat service's HTTP API. The tests
//! drive [`HttpApi`] directly and through [`ChatClient`] with a socket that
//! never connects, so every send takes the HTTP path.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use parking_lot::Mutex;
use serde_json::{Value, json};
use url::Url;

use chatlink::api::http::{DEFAULT_REQUEST_TIMEOUT, HttpApi};
use chatlink::api::{ApiError, ChatApi};
use chatlink::auth::{SharedToken, TokenSource};
use chatlink::chat::send::{SendConfig, SendEvent, SendEventKind};
use chatlink::chat::store::StoreConfig;
use chatlink::chat::{DeliveryPath, SendError};
use chatlink::client::ChatClient;
use chatlink::connection::loopback::LoopbackConnector;
use chatlink::connection::{ConnectionConfig, ConnectionManager};
use chatlink_proto::message::{ConversationKey, GroupId, MessageId, UserId};

const TOKEN: &str = "rest-token";

// =============================================================================
// Mock REST service
// =============================================================================

#[derive(Default)]
struct RestServer {
    requests: Mutex<Vec<String>>,
    bodies: Mutex<Vec<Value>>,
    next_id: AtomicU64,
    unread: AtomicU64,
}

impl RestServer {
    fn log(&self, method: &Method, path: &str) {
        self.requests.lock().push(format!("{method} {path}"));
    }

    fn count(&self, prefix: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.starts_with(prefix))
            .count()
    }
}

type Shared = State<Arc<RestServer>>;

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"))
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"detail": "invalid token"}))).into_response()
}

async fn profile(State(s): Shared, headers: HeaderMap) -> Response {
    s.log(&Method::GET, "auth/profile/");
    if !authorized(&headers) {
        return unauthorized();
    }
    Json(json!({"id": 1, "username": "alice", "avatar": null})).into_response()
}

async fn conversations(State(s): Shared, headers: HeaderMap) -> Response {
    s.log(&Method::GET, "messages/conversations/");
    if !authorized(&headers) {
        return unauthorized();
    }
    Json(json!({
        "private_chats": [{
            "user": {"id": 2, "username": "bob"},
            "last_message": {"content": "see you", "timestamp": "2024-05-01T10:02:00Z", "is_read": false},
            "unread_count": 1
        }],
        "group_chats": [{
            "id": 4,
            "name": "team",
            "members": [{"id": 1}, {"id": 2}],
            "last_message": {"content": "standup", "timestamp": "2024-05-02T09:00:00Z", "is_read": true},
            "unread_count": 0
        }]
    }))
    .into_response()
}

async fn history(
    State(s): Shared,
    Path(peer): Path<u64>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    s.log(&Method::GET, &format!("messages/conversations/{peer}/"));
    if !authorized(&headers) {
        return unauthorized();
    }
    let page: u32 = params.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
    let results = if page == 1 {
        json!([
            {"id": 1, "sender": {"id": peer, "username": "bob"}, "recipient": {"id": 1},
             "content": "hi", "timestamp": "2024-05-01T10:00:00Z", "is_read": true},
            {"id": 2, "sender": {"id": peer, "username": "bob"}, "recipient": {"id": 1},
             "content": "see you", "timestamp": "2024-05-01T10:02:00Z", "is_read": false},
            {"id": 3, "sender": {"id": 1}, "recipient": {"id": peer},
             "content": "bye", "timestamp": "2024-05-01T10:01:00Z", "is_read": false}
        ])
    } else {
        json!([])
    };
    Json(json!({
        "count": 3,
        "page": page,
        "page_size": params.get("page_size").and_then(|p| p.parse::<u32>().ok()).unwrap_or(20),
        "has_next": false,
        "has_previous": page > 1,
        "results": results
    }))
    .into_response()
}

async fn create_message(State(s): Shared, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    s.log(&Method::POST, "messages/messages/");
    if !authorized(&headers) {
        return unauthorized();
    }
    s.bodies.lock().push(body.clone());
    let id = s.next_id.fetch_add(1, Ordering::SeqCst) + 900;
    (
        StatusCode::CREATED,
        Json(json!({
            "id": id,
            "sender": {"id": 1, "username": "alice"},
            "recipient": {"id": body["recipient"]},
            "content": body["content"],
            "timestamp": "2024-05-03T12:00:00Z",
            "is_read": false
        })),
    )
        .into_response()
}

async fn mark_read(State(s): Shared, Path(id): Path<u64>, headers: HeaderMap) -> Response {
    s.log(&Method::PATCH, &format!("messages/messages/{id}/read/"));
    if !authorized(&headers) {
        return unauthorized();
    }
    let _ = s
        .unread
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    StatusCode::OK.into_response()
}

async fn group_detail(State(s): Shared, Path(id): Path<u64>, headers: HeaderMap) -> Response {
    s.log(&Method::GET, &format!("messages/group-chats/{id}/"));
    if !authorized(&headers) {
        return unauthorized();
    }
    if id != 4 {
        return (StatusCode::NOT_FOUND, "no such group").into_response();
    }
    Json(json!({"id": 4, "name": "team", "members": [1, 2]})).into_response()
}

async fn add_member(
    State(s): Shared,
    Path(id): Path<u64>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    s.log(&Method::POST, &format!("messages/group-chats/{id}/add_member/"));
    if !authorized(&headers) {
        return unauthorized();
    }
    s.bodies.lock().push(body);
    StatusCode::OK.into_response()
}

async fn notifications(State(s): Shared, headers: HeaderMap) -> Response {
    s.log(&Method::GET, "interactions/notifications/");
    if !authorized(&headers) {
        return unauthorized();
    }
    Json(json!({
        "count": 2,
        "results": [
            {"id": 11, "actor": "bob", "notification_type": "like", "post": 5,
             "is_read": false, "created_at": "2024-05-02T08:00:00Z"},
            {"id": 10, "actor": "carol", "notification_type": "comment", "post": 5,
             "comment": "nice", "is_read": true, "created_at": "2024-05-01T08:00:00Z"}
        ]
    }))
    .into_response()
}

async fn notification_read(State(s): Shared, Path(id): Path<u64>, headers: HeaderMap) -> Response {
    s.log(&Method::POST, &format!("interactions/notifications/{id}/read/"));
    if !authorized(&headers) {
        return unauthorized();
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn unread_count(State(s): Shared, headers: HeaderMap) -> Response {
    s.log(&Method::GET, "interactions/notifications/unread-count/");
    if !authorized(&headers) {
        return unauthorized();
    }
    Json(json!({"count": s.unread.load(Ordering::SeqCst)})).into_response()
}

async fn start_server(unread: u64) -> (SocketAddr, Arc<RestServer>) {
    let server = Arc::new(RestServer {
        unread: AtomicU64::new(unread),
        ..RestServer::default()
    });
    let app = axum::Router::new()
        .route("/api/auth/profile/", get(profile))
        .route("/api/messages/conversations/", get(conversations))
        .route("/api/messages/conversations/{peer}/", get(history))
        .route("/api/messages/messages/", post(create_message))
        .route("/api/messages/messages/{id}/read/", patch(mark_read))
        .route("/api/messages/group-chats/{id}/", get(group_detail))
        .route("/api/messages/group-chats/{id}/add_member/", post(add_member))
        .route("/api/interactions/notifications/", get(notifications))
        .route(
            "/api/interactions/notifications/unread-count/",
            get(unread_count),
        )
        .route(
            "/api/interactions/notifications/{id}/read/",
            post(notification_read),
        )
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

fn http_api(addr: SocketAddr, tokens: Arc<dyn TokenSource>) -> HttpApi {
    let base = Url::parse(&format!("http://{addr}/api")).unwrap();
    HttpApi::new(base, tokens, DEFAULT_REQUEST_TIMEOUT).unwrap()
}

async fn offline_client(addr: SocketAddr) -> ChatClient<HttpApi, LoopbackConnector> {
    let tokens: Arc<dyn TokenSource> = Arc::new(SharedToken::new(TOKEN));
    let api = Arc::new(http_api(addr, Arc::clone(&tokens)));
    let connection = ConnectionManager::new(
        LoopbackConnector::new(),
        tokens,
        ConnectionConfig::new(Url::parse("ws://unused.test/ws/chat/").unwrap()),
    );
    ChatClient::for_current_user(api, connection, SendConfig::default(), StoreConfig::default())
        .await
        .unwrap()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn profile_discovers_current_user() {
    let (addr, _server) = start_server(0).await;
    let client = offline_client(addr).await;
    assert_eq!(client.me().id, UserId::new(1));
    assert_eq!(client.me().username.as_deref(), Some("alice"));
}

#[tokio::test]
async fn rejected_token_is_invalidated() {
    let (addr, server) = start_server(0).await;
    let tokens = Arc::new(SharedToken::new("stale"));
    let api = http_api(addr, Arc::clone(&tokens) as Arc<dyn TokenSource>);

    assert!(matches!(api.current_user().await, Err(ApiError::Unauthorized)));
    assert!(tokens.token().is_none());

    assert!(matches!(api.current_user().await, Err(ApiError::NoCredential)));
    assert_eq!(server.count("GET auth/profile/"), 1, "no request without a token");
}

#[tokio::test]
async fn disconnected_send_goes_over_http() {
    let (addr, server) = start_server(0).await;
    let client = offline_client(addr).await;

    let via = Arc::new(Mutex::new(None));
    {
        let via = Arc::clone(&via);
        client.sender().on(SendEventKind::Delivered, move |e| {
            let SendEvent::Delivered { via: path, .. } = e;
            *via.lock() = Some(*path);
        });
    }

    let message = client.send_message(UserId::new(2), "hello over http").await.unwrap();

    assert_eq!(message.id, Some(MessageId::new(900)));
    assert_eq!(message.content, "hello over http");
    assert_eq!(*via.lock(), Some(DeliveryPath::Http));
    assert_eq!(
        server.bodies.lock()[0],
        json!({"recipient": 2, "content": "hello over http"})
    );
    let previews = client.store().previews();
    assert_eq!(previews[0].key, ConversationKey::Direct(UserId::new(2)));
}

#[tokio::test]
async fn empty_message_is_not_sent() {
    let (addr, server) = start_server(0).await;
    let client = offline_client(addr).await;

    let result = client.send_message(UserId::new(2), "   ").await;
    assert!(matches!(result, Err(SendError::EmptyContent)));
    assert_eq!(server.count("POST messages/messages/"), 0);
}

#[tokio::test]
async fn history_marks_unread_and_refreshes_counter_once() {
    let (addr, server) = start_server(1).await;
    let client = offline_client(addr).await;
    let key = ConversationKey::Direct(UserId::new(2));

    client.open(key).await.unwrap();

    assert_eq!(server.count("PATCH messages/messages/"), 1);
    assert_eq!(server.count("PATCH messages/messages/2/read/"), 1);
    assert_eq!(server.count("GET interactions/notifications/unread-count/"), 1);
    assert_eq!(client.unread_count(), 0);

    let conversation = client.store().conversation(key).unwrap();
    let ids: Vec<_> = conversation.messages.iter().filter_map(|m| m.id).map(MessageId::get).collect();
    assert_eq!(ids, vec![1, 3, 2], "ordered by timestamp");
    assert!(!conversation.pagination.has_next);
    assert_eq!(client.store().open_conversation(), Some(key));

    assert_eq!(client.store().load_more_messages(key).await.unwrap(), None);
}

#[tokio::test]
async fn conversation_list_merges_private_and_group_chats() {
    let (addr, server) = start_server(3).await;
    let client = offline_client(addr).await;

    let previews = client.refresh_conversations().await.unwrap();

    assert_eq!(previews.len(), 2);
    assert_eq!(previews[0].key, ConversationKey::Group(GroupId::new(4)), "newest first");
    assert_eq!(previews[1].title, "bob");
    assert_eq!(previews[1].unread_count, 1);
    assert_eq!(client.store().group(GroupId::new(4)).unwrap().members.len(), 2);
    assert_eq!(client.unread_count(), 3);
    assert_eq!(server.count("GET interactions/notifications/unread-count/"), 1);
}

#[tokio::test]
async fn group_endpoints() {
    let (addr, server) = start_server(0).await;
    let api = http_api(addr, Arc::new(SharedToken::new(TOKEN)));

    let group = api.get_group_chat(GroupId::new(4)).await.unwrap();
    assert_eq!(group.name, "team");
    assert_eq!(group.members[1].id, UserId::new(2));

    api.add_group_member(GroupId::new(4), UserId::new(9)).await.unwrap();
    assert_eq!(server.bodies.lock()[0], json!({"user_id": 9}));

    let missing = api.get_group_chat(GroupId::new(5)).await;
    assert!(matches!(missing, Err(ApiError::Status { status: 404, .. })));
}

#[tokio::test]
async fn notifications_are_listed_and_marked_read() {
    let (addr, server) = start_server(1).await;
    let client = offline_client(addr).await;
    let notifications = client.notifications();

    let list = notifications.fetch_notifications().await.unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].id, 11);
    notifications.fetch_unread_count().await;
    assert_eq!(notifications.unread_count(), 1);

    notifications.mark_read(11).await;
    assert_eq!(notifications.unread_count(), 0);
    assert_eq!(server.count("POST interactions/notifications/11/read/"), 1);

    notifications.mark_read(10).await;
    assert_eq!(notifications.unread_count(), 0, "already read, floor stays at zero");
}
