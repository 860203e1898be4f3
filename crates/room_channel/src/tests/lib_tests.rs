use super::*;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use shared::{
    domain::MessageId,
    error::{ApiError, ErrorCode},
    protocol::{ClientFrame, MessageBody, ServerFrame},
};
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Clone)]
struct HubState {
    connections: Arc<AtomicUsize>,
    tokens: Arc<Mutex<Vec<String>>>,
    drop_first_connection: bool,
}

fn text_message(id: &str, body: &str) -> Message {
    Message {
        id: MessageId::new(id),
        author: "alice".into(),
        body: MessageBody::Text(body.into()),
        timestamp: Utc::now(),
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> bool {
    let Ok(text) = serde_json::to_string(frame) else {
        return false;
    };
    socket.send(AxumMessage::Text(text)).await.is_ok()
}

async fn hub(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<HubState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state, query))
}

async fn serve_socket(mut socket: WebSocket, state: HubState, query: HashMap<String, String>) {
    let index = state.connections.fetch_add(1, Ordering::SeqCst);
    if let Some(token) = query.get("access_token") {
        state.tokens.lock().await.push(token.clone());
    }

    let roster = ServerFrame::MemberList {
        members: vec![shared::protocol::Member {
            uid: MemberUid::new("u1"),
            username: "alice".into(),
            is_online: true,
        }],
    };
    if !send_frame(&mut socket, &roster).await {
        return;
    }
    if state.drop_first_connection && index == 0 {
        let _ = socket.close().await;
        return;
    }

    while let Some(Ok(frame)) = socket.recv().await {
        let AxumMessage::Text(text) = frame else {
            continue;
        };
        let Ok(request) = serde_json::from_str::<ClientFrame>(&text) else {
            continue;
        };
        let replies = match request {
            ClientFrame::GetChatHistory { request_id } => vec![ServerFrame::HistoryPage {
                request_id,
                messages: vec![text_message("h1", "old"), text_message("h2", "older")],
            }],
            ClientFrame::SendMessage { request_id, text } => vec![
                ServerFrame::Ack { request_id },
                ServerFrame::Message {
                    message: text_message("m1", &text),
                },
            ],
            ClientFrame::SendPicture { request_id, .. } => vec![ServerFrame::Ack { request_id }],
            ClientFrame::RemoveMember { request_id, .. } => vec![ServerFrame::Error {
                request_id: Some(request_id),
                error: ApiError::new(ErrorCode::Forbidden, "not the room owner"),
            }],
        };
        for reply in &replies {
            if !send_frame(&mut socket, reply).await {
                return;
            }
        }
    }
}

async fn spawn_hub(drop_first_connection: bool) -> (String, HubState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = HubState {
        connections: Arc::new(AtomicUsize::new(0)),
        tokens: Arc::new(Mutex::new(Vec::new())),
        drop_first_connection,
    };
    let app = Router::new()
        .route("/hubs/chat", get(hub))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

async fn next_event(events: &mut broadcast::Receiver<ChannelEvent>) -> ChannelEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event before timeout")
        .expect("event stream open")
}

/// Hands out `token-1`, `token-2`, ... one per reconnect handshake.
#[derive(Default)]
struct RotatingTokens {
    issued: AtomicUsize,
}

#[async_trait]
impl AccessTokenSource for RotatingTokens {
    async fn access_token(&self) -> Result<String, TokenUnavailable> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("token-{n}"))
    }
}

struct RevokedTokens;

#[async_trait]
impl AccessTokenSource for RevokedTokens {
    async fn access_token(&self) -> Result<String, TokenUnavailable> {
        Err(TokenUnavailable::Revoked)
    }
}

fn connector(server_url: String, tokens: Arc<dyn AccessTokenSource>) -> WsRoomChannelConnector {
    WsRoomChannelConnector::new(server_url, fast_backoff(), tokens)
}

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        max_attempts: Some(20),
    }
}

#[test]
fn websocket_endpoint_maps_scheme_and_room() {
    let url = websocket_endpoint("https://chat.example.com/", &RoomId::new("r 1"))
        .expect("endpoint");
    assert_eq!(url.as_str(), "wss://chat.example.com/hubs/chat?roomId=r+1");

    let url = websocket_endpoint("http://127.0.0.1:8080", &RoomId::new("42")).expect("endpoint");
    assert_eq!(url.scheme(), "ws");

    assert!(websocket_endpoint("ftp://example.com", &RoomId::new("42")).is_err());
}

#[test]
fn backoff_doubles_until_capped() {
    let policy = BackoffPolicy {
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(1000),
        max_attempts: None,
    };
    assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
    assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
    assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1000));
    assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(1000));
}

#[tokio::test]
async fn first_subscriber_sees_roster_and_requests_are_correlated() {
    let (server_url, state) = spawn_hub(false).await;
    let connector = connector(server_url, Arc::new(RotatingTokens::default()));
    let channel = connector
        .connect(RoomChannelOptions {
            room_id: RoomId::new("7"),
            access_token: "token-a".into(),
        })
        .await
        .expect("connect");
    let mut events = channel.subscribe_events();

    match next_event(&mut events).await {
        ChannelEvent::MemberList(members) => assert_eq!(members.len(), 1),
        other => panic!("expected roster, got {other:?}"),
    }

    let page = channel.get_chat_history("token-a").await.expect("history");
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].id, MessageId::new("h1"));

    channel.send_message("token-a", "hi").await.expect("send");
    match next_event(&mut events).await {
        ChannelEvent::Message(message) => {
            assert_eq!(message.body, MessageBody::Text("hi".into()))
        }
        other => panic!("expected message, got {other:?}"),
    }

    let err = channel
        .remove_member("token-a", &MemberUid::new("u1"))
        .await
        .expect_err("server rejects removal");
    assert!(err.to_string().contains("not the room owner"));

    assert_eq!(state.tokens.lock().await.as_slice(), ["token-a".to_string()]);
    channel.disconnect().await.expect("disconnect");
}

#[tokio::test]
async fn dropped_socket_is_reported_and_reestablished() {
    let (server_url, state) = spawn_hub(true).await;
    let connector = connector(server_url, Arc::new(RotatingTokens::default()));
    let channel = connector
        .connect(RoomChannelOptions {
            room_id: RoomId::new("7"),
            access_token: "token-a".into(),
        })
        .await
        .expect("connect");
    let mut events = channel.subscribe_events();

    assert!(matches!(
        next_event(&mut events).await,
        ChannelEvent::MemberList(_)
    ));
    assert!(matches!(
        next_event(&mut events).await,
        ChannelEvent::ConnectionLost { .. }
    ));
    assert_eq!(next_event(&mut events).await, ChannelEvent::Reestablished);
    assert!(matches!(
        next_event(&mut events).await,
        ChannelEvent::MemberList(_)
    ));
    assert_eq!(state.connections.load(Ordering::SeqCst), 2);
    assert_eq!(
        state.tokens.lock().await.as_slice(),
        ["token-a".to_string(), "token-1".to_string()]
    );

    let page = channel.get_chat_history("token-b").await.expect("history");
    assert_eq!(page.len(), 2);
    channel.disconnect().await.expect("disconnect");
}

#[tokio::test]
async fn revoked_credentials_stop_reconnecting() {
    let (server_url, state) = spawn_hub(true).await;
    let connector = connector(server_url, Arc::new(RevokedTokens));
    let channel = connector
        .connect(RoomChannelOptions {
            room_id: RoomId::new("7"),
            access_token: "token-a".into(),
        })
        .await
        .expect("connect");
    let mut events = channel.subscribe_events();

    assert!(matches!(
        next_event(&mut events).await,
        ChannelEvent::MemberList(_)
    ));
    assert!(matches!(
        next_event(&mut events).await,
        ChannelEvent::ConnectionLost { .. }
    ));
    assert_eq!(next_event(&mut events).await, ChannelEvent::Closed);
    assert_eq!(state.connections.load(Ordering::SeqCst), 1);
    assert!(channel.send_message("token-a", "late").await.is_err());
}

#[tokio::test]
async fn disconnect_is_idempotent_and_fails_later_requests() {
    let (server_url, _state) = spawn_hub(false).await;
    let connector = connector(server_url, Arc::new(RotatingTokens::default()));
    let channel = connector
        .connect(RoomChannelOptions {
            room_id: RoomId::new("7"),
            access_token: "token-a".into(),
        })
        .await
        .expect("connect");
    let mut events = channel.subscribe_events();

    channel.disconnect().await.expect("disconnect");
    channel.disconnect().await.expect("second disconnect");

    loop {
        if next_event(&mut events).await == ChannelEvent::Closed {
            break;
        }
    }
    assert!(channel.send_message("token-a", "late").await.is_err());
}
