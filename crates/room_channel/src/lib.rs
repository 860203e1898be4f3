use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use shared::{
    domain::{MemberUid, RoomId},
    error::ApiError,
    protocol::{Member, Message},
};
use thiserror::Error;
use tokio::sync::broadcast;

pub mod ws;

pub use ws::{websocket_endpoint, WsRoomChannel, WsRoomChannelConnector};

/// Everything a room channel reports to its subscribers, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(Message),
    /// Server-pushed history batch, oldest-first.
    ChatHistory(Vec<Message>),
    /// Full roster snapshot.
    MemberList(Vec<Member>),
    /// Transport dropped; the channel is retrying on its own.
    ConnectionLost { reason: String },
    /// Transport is back after a `ConnectionLost`.
    Reestablished,
    /// Server error not tied to a pending request.
    ServerError(ApiError),
    /// Channel closed for good (explicit disconnect or retries given up).
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomChannelOptions {
    pub room_id: RoomId,
    pub access_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenUnavailable {
    /// Credentials are gone; retrying cannot succeed.
    #[error("credentials were revoked")]
    Revoked,
    #[error("access token unavailable: {0}")]
    Temporary(String),
}

/// Supplies the access token presented at every reconnect handshake, so a
/// long outage reconnects with a refreshed credential.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String, TokenUnavailable>;
}

/// One live realtime connection to a chat room. Implementations own their
/// reconnect/backoff and surface it as `ConnectionLost`/`Reestablished`.
///
/// Outbound calls carry the caller's current access token. Transports that
/// only authenticate at the handshake may ignore it.
#[async_trait]
pub trait RoomChannel: Send + Sync {
    fn room_id(&self) -> &RoomId;
    /// The first call receives every event since the channel connected; later
    /// calls only see events from the moment they subscribe.
    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent>;
    /// Requests the next page of older messages, oldest-first.
    async fn get_chat_history(&self, access_token: &str) -> anyhow::Result<Vec<Message>>;
    async fn send_message(&self, access_token: &str, text: &str) -> anyhow::Result<()>;
    async fn send_picture(&self, access_token: &str, image_b64: &str) -> anyhow::Result<()>;
    async fn remove_member(&self, access_token: &str, uid: &MemberUid) -> anyhow::Result<()>;
    async fn disconnect(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait RoomChannelConnector: Send + Sync {
    async fn connect(&self, options: RoomChannelOptions) -> anyhow::Result<Arc<dyn RoomChannel>>;
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
