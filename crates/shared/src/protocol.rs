use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{MemberUid, MessageId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageBody {
    Text(String),
    /// Server-side reference (URL or key) of a stored picture.
    Image(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub author: String,
    pub body: MessageBody,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub uid: MemberUid,
    #[serde(default)]
    pub username: String,
    pub is_online: bool,
}

/// Frames the client writes to the realtime channel. `request_id` correlates
/// the server's `ack`/`history_page`/`error` answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    SendMessage { request_id: u64, text: String },
    SendPicture { request_id: u64, image_b64: String },
    GetChatHistory { request_id: u64 },
    RemoveMember { request_id: u64, uid: MemberUid },
}

impl ClientFrame {
    pub fn request_id(&self) -> u64 {
        match self {
            ClientFrame::SendMessage { request_id, .. }
            | ClientFrame::SendPicture { request_id, .. }
            | ClientFrame::GetChatHistory { request_id }
            | ClientFrame::RemoveMember { request_id, .. } => *request_id,
        }
    }
}

/// Frames the server pushes over the realtime channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    Message {
        message: Message,
    },
    /// Server-initiated history batch, oldest-first.
    ChatHistory {
        messages: Vec<Message>,
    },
    /// Full roster snapshot.
    MemberList {
        members: Vec<Member>,
    },
    HistoryPage {
        request_id: u64,
        messages: Vec<Message>,
    },
    Ack {
        request_id: u64,
    },
    Error {
        #[serde(default)]
        request_id: Option<u64>,
        error: ApiError,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenResponse {
    #[serde(rename = "accessToken")]
    pub access_token: String,
}
