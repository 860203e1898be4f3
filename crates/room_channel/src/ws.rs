use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use shared::{
    domain::{MemberUid, RoomId},
    protocol::{ClientFrame, Message, ServerFrame},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    AccessTokenSource, BackoffPolicy, ChannelEvent, RoomChannel, RoomChannelConnector,
    RoomChannelOptions, TokenUnavailable,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_BUFFER: usize = 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

enum Reply {
    Ack,
    History(Vec<Message>),
}

/// Maps the HTTP base url of the chat server onto the room's websocket hub.
/// The access token is appended per handshake and never stored in the url.
pub fn websocket_endpoint(server_url: &str, room_id: &RoomId) -> Result<Url> {
    let base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(anyhow!("server_url must start with http:// or https://"));
    };
    let mut url = Url::parse(&format!("{}/hubs/chat", base.trim_end_matches('/')))
        .with_context(|| format!("invalid server_url: {server_url}"))?;
    url.query_pairs_mut().append_pair("roomId", room_id.as_str());
    Ok(url)
}

async fn open_socket(endpoint: &Url, access_token: &str) -> Result<(WsSink, WsSource)> {
    let mut url = endpoint.clone();
    url.query_pairs_mut()
        .append_pair("access_token", access_token);
    let (stream, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect websocket: {endpoint}"))?;
    Ok(stream.split())
}

pub struct WsRoomChannel {
    room_id: RoomId,
    endpoint: Url,
    backoff: BackoffPolicy,
    tokens: Arc<dyn AccessTokenSource>,
    writer: Mutex<Option<WsSink>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Reply>>>>,
    next_request_id: AtomicU64,
    events: broadcast::Sender<ChannelEvent>,
    initial_events: StdMutex<Option<broadcast::Receiver<ChannelEvent>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WsRoomChannel {
    pub async fn connect(
        endpoint: Url,
        options: RoomChannelOptions,
        backoff: BackoffPolicy,
        tokens: Arc<dyn AccessTokenSource>,
    ) -> Result<Arc<Self>> {
        let (events, initial_events) = broadcast::channel(EVENT_BUFFER);
        let (sink, source) = open_socket(&endpoint, &options.access_token).await?;
        let channel = Arc::new(Self {
            room_id: options.room_id,
            endpoint,
            backoff,
            tokens,
            writer: Mutex::new(Some(sink)),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            events,
            initial_events: StdMutex::new(Some(initial_events)),
            supervisor: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let task = tokio::spawn(Arc::clone(&channel).supervise(source));
        *channel.supervisor.lock().await = Some(task);
        info!(room_id = %channel.room_id, "room channel connected");
        Ok(channel)
    }

    async fn supervise(self: Arc<Self>, mut source: WsSource) {
        loop {
            let reason = self.pump(&mut source).await;
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            *self.writer.lock().await = None;
            self.fail_pending(&reason).await;
            warn!(room_id = %self.room_id, %reason, "room channel lost; reconnecting");
            let _ = self.events.send(ChannelEvent::ConnectionLost { reason });

            match self.reconnect().await {
                Some(next) => {
                    source = next;
                    let _ = self.events.send(ChannelEvent::Reestablished);
                }
                None => break,
            }
        }

        self.closed.store(true, Ordering::SeqCst);
        self.fail_pending("room channel closed").await;
        let _ = self.events.send(ChannelEvent::Closed);
    }

    async fn pump(&self, source: &mut WsSource) -> String {
        while let Some(frame) = source.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => self.dispatch(frame).await,
                    Err(err) => warn!(room_id = %self.room_id, "invalid server frame: {err}"),
                },
                Ok(WsMessage::Close(_)) => return "closed by server".to_string(),
                Ok(_) => {}
                Err(err) => return format!("websocket receive failed: {err}"),
            }
        }
        "websocket stream ended".to_string()
    }

    async fn dispatch(&self, frame: ServerFrame) {
        let event = match frame {
            ServerFrame::Message { message } => ChannelEvent::Message(message),
            ServerFrame::ChatHistory { messages } => ChannelEvent::ChatHistory(messages),
            ServerFrame::MemberList { members } => ChannelEvent::MemberList(members),
            ServerFrame::HistoryPage {
                request_id,
                messages,
            } => {
                self.resolve(request_id, Ok(Reply::History(messages))).await;
                return;
            }
            ServerFrame::Ack { request_id } => {
                self.resolve(request_id, Ok(Reply::Ack)).await;
                return;
            }
            ServerFrame::Error {
                request_id: Some(request_id),
                error,
            } => {
                self.resolve(request_id, Err(anyhow::Error::new(error)))
                    .await;
                return;
            }
            ServerFrame::Error {
                request_id: None,
                error,
            } => ChannelEvent::ServerError(error),
        };
        let _ = self.events.send(event);
    }

    async fn resolve(&self, request_id: u64, reply: Result<Reply>) {
        match self.pending.lock().await.remove(&request_id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(room_id = %self.room_id, request_id, "reply for unknown request"),
        }
    }

    async fn fail_pending(&self, reason: &str) {
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(anyhow!("{reason}")));
        }
    }

    async fn reconnect(&self) -> Option<WsSource> {
        let mut attempt = 0u32;
        loop {
            if self
                .backoff
                .max_attempts
                .is_some_and(|max_attempts| attempt >= max_attempts)
            {
                warn!(room_id = %self.room_id, attempt, "room channel gave up reconnecting");
                return None;
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }

            let token = match self.tokens.access_token().await {
                Ok(token) => token,
                Err(TokenUnavailable::Revoked) => {
                    warn!(room_id = %self.room_id, "credentials revoked; room channel gives up");
                    return None;
                }
                Err(err) => {
                    debug!(room_id = %self.room_id, attempt, "no token for reconnect: {err}");
                    attempt += 1;
                    continue;
                }
            };
            match open_socket(&self.endpoint, &token).await {
                Ok((sink, source)) => {
                    *self.writer.lock().await = Some(sink);
                    info!(room_id = %self.room_id, attempt, "room channel reestablished");
                    return Some(source);
                }
                Err(err) => {
                    debug!(room_id = %self.room_id, attempt, "reconnect attempt failed: {err:#}");
                    attempt += 1;
                }
            }
        }
    }

    async fn request(&self, build: impl FnOnce(u64) -> ClientFrame) -> Result<Reply> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let text = serde_json::to_string(&build(request_id))?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        let sent = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(sink) => sink
                    .send(WsMessage::Text(text))
                    .await
                    .context("failed to write room frame"),
                None => Err(anyhow!("room channel {} is not connected", self.room_id)),
            }
        };
        if let Err(err) = sent {
            self.pending.lock().await.remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(anyhow!("room channel dropped request {request_id}")),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(anyhow!("room request {request_id} timed out"))
            }
        }
    }
}

#[async_trait]
impl RoomChannel for WsRoomChannel {
    fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        if let Ok(mut initial) = self.initial_events.lock() {
            if let Some(receiver) = initial.take() {
                return receiver;
            }
        }
        self.events.subscribe()
    }

    async fn get_chat_history(&self, _access_token: &str) -> Result<Vec<Message>> {
        match self
            .request(|request_id| ClientFrame::GetChatHistory {
                request_id,
            })
            .await?
        {
            Reply::History(messages) => Ok(messages),
            Reply::Ack => Ok(Vec::new()),
        }
    }

    async fn send_message(&self, _access_token: &str, text: &str) -> Result<()> {
        self.request(|request_id| ClientFrame::SendMessage {
            request_id,
            text: text.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn send_picture(&self, _access_token: &str, image_b64: &str) -> Result<()> {
        self.request(|request_id| ClientFrame::SendPicture {
            request_id,
            image_b64: image_b64.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn remove_member(&self, _access_token: &str, uid: &MemberUid) -> Result<()> {
        self.request(|request_id| ClientFrame::RemoveMember {
            request_id,
            uid: uid.clone(),
        })
        .await
        .map(|_| ())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self.supervisor.lock().await.take() {
            task.abort();
        }
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        self.fail_pending("room channel closed").await;
        let _ = self.events.send(ChannelEvent::Closed);
        info!(room_id = %self.room_id, "room channel disconnected");
        Ok(())
    }
}

pub struct WsRoomChannelConnector {
    server_url: String,
    backoff: BackoffPolicy,
    tokens: Arc<dyn AccessTokenSource>,
}

impl WsRoomChannelConnector {
    pub fn new(
        server_url: impl Into<String>,
        backoff: BackoffPolicy,
        tokens: Arc<dyn AccessTokenSource>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            backoff,
            tokens,
        }
    }
}

#[async_trait]
impl RoomChannelConnector for WsRoomChannelConnector {
    async fn connect(&self, options: RoomChannelOptions) -> Result<Arc<dyn RoomChannel>> {
        let endpoint = websocket_endpoint(&self.server_url, &options.room_id)?;
        let channel =
            WsRoomChannel::connect(endpoint, options, self.backoff, Arc::clone(&self.tokens))
                .await?;
        Ok(channel)
    }
}
