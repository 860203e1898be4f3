use std::sync::Arc;

use reqwest::Client;
use shared::domain::{Role, RoomId};
use tracing::info;

use crate::{
    credentials::{CredentialStore, TokenKind},
    error::SessionError,
    pipeline::{AuthenticatedHttp, HttpSend},
};

pub const PREVIOUS_ROOM_PATH: &str = "api/rooms/previous-room-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryDecision {
    /// Show the room list.
    Allow,
    /// The user never left this room; go straight back into it.
    RedirectTo(RoomId),
}

/// Decides where a user lands when opening the room list.
pub struct RoomEntryGuard<S = Client> {
    http: Arc<AuthenticatedHttp<S>>,
    credentials: Arc<CredentialStore>,
    server_url: String,
}

impl<S: HttpSend> RoomEntryGuard<S> {
    pub fn new(
        http: Arc<AuthenticatedHttp<S>>,
        credentials: Arc<CredentialStore>,
        server_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            credentials,
            server_url: server_url.into(),
        }
    }

    pub async fn previous_room_id(&self) -> Result<Option<RoomId>, SessionError> {
        let url = format!(
            "{}/{PREVIOUS_ROOM_PATH}",
            self.server_url.trim_end_matches('/')
        );
        let body = self.http.get_text(&url).await?;
        let id = body.trim().trim_matches('"');
        Ok((!id.is_empty()).then(|| RoomId::new(id)))
    }

    pub async fn check(&self) -> Result<EntryDecision, SessionError> {
        let Some(claims) = self.credentials.claims(TokenKind::Access).await else {
            return Err(SessionError::Unauthenticated);
        };
        if claims.role == Role::Guest {
            return Ok(EntryDecision::Allow);
        }

        match self.previous_room_id().await? {
            Some(room_id) => {
                info!(%room_id, "returning to previous room");
                Ok(EntryDecision::RedirectTo(room_id))
            }
            None => Ok(EntryDecision::Allow),
        }
    }
}

#[cfg(test)]
#[path = "tests/guard_tests.rs"]
mod tests;
