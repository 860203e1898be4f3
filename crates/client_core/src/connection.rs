use std::{
    path::Path,
    sync::{Arc, Weak},
};

use room_channel::{ChannelEvent, RoomChannel, RoomChannelConnector, RoomChannelOptions};
use shared::{
    domain::{MemberUid, RoomId},
    protocol::{Member, Message},
};
use tokio::{
    sync::{broadcast, Mutex, MutexGuard},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::SessionError,
    membership::MembershipProjector,
    picture::{prepare_picture, CropRect},
    reconciler::{PageKind, Reconciler, ScrollPosition, ViewEffect},
    refresh::BearerSource,
};

/// Longest text message the room accepts, in characters.
pub const MAX_MESSAGE_CHARS: usize = 200;

/// Identifies one connect/reconnect lifecycle. Work started under an older
/// generation never mutates the current view.
pub type Generation = u64;

pub type ReconnectHook = Arc<dyn Fn(&RoomId, Generation) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    StateChanged {
        state: ConnectionState,
        generation: Generation,
    },
    MessageAppended {
        message: Message,
        effect: ViewEffect,
    },
    HistoryPrepended {
        count: usize,
        exhausted: bool,
        effect: ViewEffect,
    },
    RosterUpdated {
        online_count: usize,
        members: Vec<Member>,
    },
    View(ViewEffect),
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub room_id: Option<RoomId>,
    pub state: ConnectionState,
    pub generation: Generation,
    pub messages: Vec<Message>,
    pub history_exhausted: bool,
    pub is_loading_history: bool,
    pub pinned_to_bottom: bool,
    pub pending_unread: Option<Message>,
    pub online_count: usize,
    pub members: Vec<Member>,
}

struct ConnectionInner {
    room_id: Option<RoomId>,
    state: ConnectionState,
    generation: Generation,
    channel: Option<Arc<dyn RoomChannel>>,
    event_task: Option<JoinHandle<()>>,
    reconciler: Reconciler,
    membership: MembershipProjector,
    on_reconnect: Option<ReconnectHook>,
}

impl Default for ConnectionInner {
    fn default() -> Self {
        Self {
            room_id: None,
            state: ConnectionState::Disconnected,
            generation: 0,
            channel: None,
            event_task: None,
            reconciler: Reconciler::new(),
            membership: MembershipProjector::new(),
            on_reconnect: None,
        }
    }
}

impl ConnectionInner {
    /// Starts a new generation with an empty view and a hidden roster.
    fn advance(&mut self, state: ConnectionState) -> Generation {
        self.generation += 1;
        self.state = state;
        self.reconciler = Reconciler::new();
        self.membership.hide();
        self.generation
    }

    fn connected_channel(&self) -> Result<Arc<dyn RoomChannel>, SessionError> {
        match (&self.channel, self.state) {
            (Some(channel), ConnectionState::Connected | ConnectionState::Reconnecting) => {
                Ok(Arc::clone(channel))
            }
            _ => Err(SessionError::NotConnected),
        }
    }

    fn roster_event(&self) -> RoomEvent {
        RoomEvent::RosterUpdated {
            online_count: self.membership.online_count(),
            members: self.membership.members().to_vec(),
        }
    }
}

/// Owns the realtime channel of the room the user is in, and the message view
/// and roster projected from it.
pub struct ChatConnectionManager {
    connector: Arc<dyn RoomChannelConnector>,
    bearer: Arc<dyn BearerSource>,
    inner: Mutex<ConnectionInner>,
    events: broadcast::Sender<RoomEvent>,
}

impl ChatConnectionManager {
    pub fn new(connector: Arc<dyn RoomChannelConnector>, bearer: Arc<dyn BearerSource>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            connector,
            bearer,
            inner: Mutex::new(ConnectionInner::default()),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }

    /// Opens the room channel and loads the initial history page. Any previous
    /// connection is torn down first.
    pub async fn connect(self: &Arc<Self>, room_id: RoomId) -> Result<Generation, SessionError> {
        let (generation, previous) = {
            let mut inner = self.inner.lock().await;
            let previous = inner.channel.take();
            if let Some(task) = inner.event_task.take() {
                task.abort();
            }
            inner.room_id = Some(room_id.clone());
            let generation = inner.advance(ConnectionState::Connecting);
            self.emit(RoomEvent::StateChanged {
                state: ConnectionState::Connecting,
                generation,
            });
            (generation, previous)
        };
        if let Some(previous) = previous {
            if let Err(err) = previous.disconnect().await {
                warn!("failed to close previous room channel: {err:#}");
            }
        }
        info!(%room_id, generation, "connecting to room");

        let channel = match self.open_channel(&room_id).await {
            Ok(channel) => channel,
            Err(err) => {
                self.fall_back_to_disconnected(generation).await;
                return Err(err);
            }
        };

        {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation {
                drop(inner);
                debug!(%room_id, generation, "connect superseded; closing new channel");
                let _ = channel.disconnect().await;
                return Err(SessionError::NotConnected);
            }
            let events = channel.subscribe_events();
            inner.event_task = Some(tokio::spawn(run_events(
                Arc::downgrade(self),
                generation,
                events,
            )));
            inner.channel = Some(channel);
            inner.state = ConnectionState::Connected;
            self.emit(RoomEvent::StateChanged {
                state: ConnectionState::Connected,
                generation,
            });
        }
        info!(%room_id, generation, "room connected");

        match self.fetch_page().await {
            Ok(_) => {}
            Err(SessionError::Unauthenticated) => {
                warn!(%room_id, generation, "session expired while loading history; leaving room");
                self.disconnect().await;
                return Err(SessionError::Unauthenticated);
            }
            Err(err) => warn!(%room_id, generation, "initial history page failed: {err}"),
        }
        Ok(generation)
    }

    async fn open_channel(&self, room_id: &RoomId) -> Result<Arc<dyn RoomChannel>, SessionError> {
        let access_token = self.bearer.bearer().await?;
        self.connector
            .connect(RoomChannelOptions {
                room_id: room_id.clone(),
                access_token,
            })
            .await
            .map_err(|err| SessionError::TransientFailure(format!("{err:#}")))
    }

    async fn fall_back_to_disconnected(&self, generation: Generation) {
        let mut inner = self.inner.lock().await;
        if inner.generation == generation {
            inner.state = ConnectionState::Disconnected;
            self.emit(RoomEvent::StateChanged {
                state: ConnectionState::Disconnected,
                generation,
            });
        }
    }

    /// Loads the next older history page. Returns the number of messages the
    /// server sent, or zero when nothing was fetched because a fetch is
    /// already running, history is exhausted or the result went stale.
    pub async fn fetch_next_page(&self) -> Result<usize, SessionError> {
        self.fetch_page().await
    }

    async fn fetch_page(&self) -> Result<usize, SessionError> {
        let (generation, channel, kind) = {
            let mut inner = self.inner.lock().await;
            let channel = inner.connected_channel()?;
            let Some(kind) = inner.reconciler.begin_fetch() else {
                debug!(generation = inner.generation, "history fetch skipped");
                return Ok(0);
            };
            (inner.generation, channel, kind)
        };

        let result = match self.bearer.bearer().await {
            Ok(token) => channel
                .get_chat_history(&token)
                .await
                .map_err(|err| SessionError::TransientFailure(format!("{err:#}"))),
            Err(err) => Err(err),
        };

        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            debug!(
                stale_generation = generation,
                generation = inner.generation,
                "discarding history page from a previous generation"
            );
            return Ok(0);
        }

        let outcome = match result {
            Ok(page) => {
                let count = page.len();
                let before = inner.reconciler.messages().len();
                let effect = inner.reconciler.apply_page(kind, page);
                let exhausted = inner.reconciler.cursor().exhausted;
                debug!(generation, count, exhausted, ?kind, "history page applied");
                self.emit(RoomEvent::HistoryPrepended {
                    count: inner.reconciler.messages().len() - before,
                    exhausted,
                    effect,
                });
                Ok(count)
            }
            Err(err) => {
                inner.reconciler.fail_fetch();
                self.emit(RoomEvent::Error(err.to_string()));
                Err(err)
            }
        };

        if kind == PageKind::Initial {
            inner.membership.reveal();
            self.emit(inner.roster_event());
        }
        outcome
    }

    /// Re-pins the view, then sends `text` unless it is empty or too long.
    pub async fn send_message(&self, text: &str) -> Result<(), SessionError> {
        let channel = {
            let mut inner = self.inner.lock().await;
            let effect = inner.reconciler.pin_to_bottom();
            self.emit(RoomEvent::View(effect));
            inner.connected_channel()
        };

        if text.is_empty() {
            return Err(SessionError::ValidationRejected("message is empty".into()));
        }
        let length = text.chars().count();
        if length > MAX_MESSAGE_CHARS {
            debug!(length, "dropping over-long message");
            return Err(SessionError::ValidationRejected(format!(
                "message is {length} characters; the limit is {MAX_MESSAGE_CHARS}"
            )));
        }

        let channel = channel?;
        let token = self.bearer.bearer().await?;
        channel
            .send_message(&token, text)
            .await
            .map_err(|err| SessionError::TransientFailure(format!("{err:#}")))
    }

    /// Sends an already-encoded picture. Transport details are logged, not
    /// surfaced.
    pub async fn send_picture(&self, image_b64: &str) -> Result<(), SessionError> {
        let channel = {
            let mut inner = self.inner.lock().await;
            let effect = inner.reconciler.pin_to_bottom();
            self.emit(RoomEvent::View(effect));
            inner.connected_channel()?
        };

        let token = self.bearer.bearer().await?;
        if let Err(err) = channel.send_picture(&token, image_b64).await {
            warn!("picture send failed: {err:#}");
            return Err(SessionError::SendFailed);
        }
        Ok(())
    }

    pub async fn send_picture_file(
        &self,
        path: &Path,
        crop: Option<CropRect>,
    ) -> Result<(), SessionError> {
        let bytes = tokio::fs::read(path).await.map_err(|err| {
            warn!(path = %path.display(), "failed to read picture: {err}");
            SessionError::SendFailed
        })?;
        let prepared = tokio::task::spawn_blocking(move || prepare_picture(&bytes, crop))
            .await
            .map_err(|err| {
                warn!("picture preparation task failed: {err}");
                SessionError::SendFailed
            })?
            .map_err(|err| {
                warn!("picture preparation failed: {err}");
                SessionError::SendFailed
            })?;
        self.send_picture(&prepared).await
    }

    /// Asks the server to remove a member. The roster changes only when the
    /// server pushes the next member list.
    pub async fn remove_member(&self, uid: &MemberUid) -> Result<(), SessionError> {
        let channel = self.inner.lock().await.connected_channel()?;
        let token = self.bearer.bearer().await?;
        channel
            .remove_member(&token, uid)
            .await
            .map_err(|err| SessionError::TransientFailure(format!("{err:#}")))
    }

    pub async fn on_scroll(&self, position: ScrollPosition) {
        self.inner.lock().await.reconciler.on_scroll(position);
    }

    /// Tears down the current generation. Safe to call at any time.
    pub async fn disconnect(&self) {
        let channel = {
            let mut inner = self.inner.lock().await;
            if let Some(task) = inner.event_task.take() {
                task.abort();
            }
            inner.on_reconnect = None;
            let channel = inner.channel.take();
            let was_disconnected = inner.state == ConnectionState::Disconnected;
            let generation = inner.advance(ConnectionState::Disconnected);
            if !was_disconnected {
                info!(room_id = ?inner.room_id, generation, "room disconnected");
                self.emit(RoomEvent::StateChanged {
                    state: ConnectionState::Disconnected,
                    generation,
                });
            }
            channel
        };

        if let Some(channel) = channel {
            if let Err(err) = channel.disconnect().await {
                warn!("failed to close room channel: {err:#}");
            }
        }
    }

    /// Installs the single reconnect handler, replacing any previous one.
    pub async fn set_on_reconnect<F>(&self, hook: F)
    where
        F: Fn(&RoomId, Generation) + Send + Sync + 'static,
    {
        self.inner.lock().await.on_reconnect = Some(Arc::new(hook));
    }

    pub async fn clear_on_reconnect(&self) {
        self.inner.lock().await.on_reconnect = None;
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn generation(&self) -> Generation {
        self.inner.lock().await.generation
    }

    pub async fn snapshot(&self) -> ConnectionSnapshot {
        let inner = self.inner.lock().await;
        let anchor = inner.reconciler.anchor();
        ConnectionSnapshot {
            room_id: inner.room_id.clone(),
            state: inner.state,
            generation: inner.generation,
            messages: inner.reconciler.messages().to_vec(),
            history_exhausted: inner.reconciler.cursor().exhausted,
            is_loading_history: inner.reconciler.is_loading_history(),
            pinned_to_bottom: anchor.pinned_to_bottom,
            pending_unread: anchor.pending_unread.clone(),
            online_count: inner.membership.online_count(),
            members: inner.membership.members().to_vec(),
        }
    }

    /// Applies one channel event. Returns the generation the event loop should
    /// keep listening under, or `None` to stop.
    async fn handle_channel_event(
        self: &Arc<Self>,
        generation: Generation,
        event: ChannelEvent,
    ) -> Option<Generation> {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            debug!(
                stale_generation = generation,
                generation = inner.generation,
                "ignoring event from a previous generation"
            );
            return None;
        }

        match event {
            ChannelEvent::Message(message) => {
                let before = inner.reconciler.messages().len();
                let effect = inner.reconciler.append_live(message.clone());
                if inner.reconciler.messages().len() > before {
                    self.emit(RoomEvent::MessageAppended { message, effect });
                }
            }
            ChannelEvent::ChatHistory(batch) => {
                let before = inner.reconciler.messages().len();
                let effect = inner.reconciler.prepend_history(batch);
                let count = inner.reconciler.messages().len() - before;
                if count > 0 {
                    self.emit(RoomEvent::HistoryPrepended {
                        count,
                        exhausted: inner.reconciler.cursor().exhausted,
                        effect,
                    });
                }
            }
            ChannelEvent::MemberList(members) => {
                inner.membership.apply_roster(members);
                if inner.membership.is_visible() {
                    self.emit(inner.roster_event());
                }
            }
            ChannelEvent::ConnectionLost { reason } => {
                warn!(room_id = ?inner.room_id, generation, %reason, "room connection lost");
                inner.state = ConnectionState::Reconnecting;
                inner.membership.hide();
                self.emit(RoomEvent::StateChanged {
                    state: ConnectionState::Reconnecting,
                    generation,
                });
                self.emit(inner.roster_event());
            }
            ChannelEvent::Reestablished => {
                info!(room_id = ?inner.room_id, generation, "room connection re-established");
                return Some(self.restart_view(inner, ConnectionState::Connected));
            }
            ChannelEvent::ServerError(error) => {
                warn!(generation, "room server error: {error}");
                self.emit(RoomEvent::Error(error.to_string()));
            }
            ChannelEvent::Closed => {
                info!(room_id = ?inner.room_id, generation, "room channel closed");
                inner.channel = None;
                inner.event_task = None;
                inner.state = ConnectionState::Disconnected;
                self.emit(RoomEvent::StateChanged {
                    state: ConnectionState::Disconnected,
                    generation,
                });
                return None;
            }
        }
        Some(generation)
    }

    /// Called when the event loop fell behind the channel and dropped
    /// `skipped` events. The view can no longer be trusted, so it is rebuilt
    /// from a fresh history page under a new generation.
    async fn resync_after_lag(
        self: &Arc<Self>,
        generation: Generation,
        skipped: u64,
    ) -> Option<Generation> {
        let inner = self.inner.lock().await;
        if inner.generation != generation {
            return None;
        }
        warn!(room_id = ?inner.room_id, generation, skipped, "room events dropped; reloading view");
        let state = inner.state;
        Some(self.restart_view(inner, state))
    }

    /// Starts a new generation in `state`, fires the reconnect hook and
    /// reloads the first history page. Returns the new generation.
    fn restart_view(
        self: &Arc<Self>,
        mut inner: MutexGuard<'_, ConnectionInner>,
        state: ConnectionState,
    ) -> Generation {
        let next = inner.advance(state);
        self.emit(RoomEvent::StateChanged {
            state,
            generation: next,
        });
        self.emit(inner.roster_event());
        let hook = inner.on_reconnect.clone();
        let room_id = inner.room_id.clone();
        drop(inner);

        if let (Some(hook), Some(room_id)) = (hook, room_id) {
            hook(&room_id, next);
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = manager.fetch_page().await {
                warn!(generation = next, "history reload failed: {err}");
            }
        });
        next
    }
}

async fn run_events(
    manager: Weak<ChatConnectionManager>,
    mut generation: Generation,
    mut events: broadcast::Receiver<ChannelEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                match manager.resync_after_lag(generation, skipped).await {
                    Some(next) => generation = next,
                    None => break,
                }
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(manager) = manager.upgrade() else {
            break;
        };
        match manager.handle_channel_event(generation, event).await {
            Some(next) => generation = next,
            None => break,
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
