use std::sync::Arc;

use reqwest::Client;
use room_channel::WsRoomChannelConnector;
use tracing::info;

pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod guard;
pub mod membership;
pub mod picture;
pub mod pipeline;
pub mod reconciler;
pub mod refresh;

pub use config::{load_settings, Settings};
pub use connection::{
    ChatConnectionManager, ConnectionSnapshot, ConnectionState, Generation, RoomEvent,
    MAX_MESSAGE_CHARS,
};
pub use credentials::{
    decode_claims, Claims, CredentialStore, JsonFileScope, MemoryScope, Scope, TokenKind,
};
pub use error::{RefreshOutcome, SessionError};
pub use guard::{EntryDecision, RoomEntryGuard};
pub use pipeline::{AuthenticatedHttp, HttpSend};
pub use reconciler::{ScrollPosition, ViewEffect, HISTORY_PAGE_SIZE};
pub use refresh::{BearerSource, TokenRefreshCoordinator};

/// Wires the session layer together for one server: credential storage, the
/// refresh coordinator, the authenticated HTTP client and room connections.
pub struct ChatClient {
    settings: Settings,
    credentials: Arc<CredentialStore>,
    coordinator: Arc<TokenRefreshCoordinator>,
    http: Arc<AuthenticatedHttp>,
}

impl ChatClient {
    pub fn new(settings: Settings, credentials: Arc<CredentialStore>) -> Self {
        let coordinator = Arc::new(TokenRefreshCoordinator::new(
            &settings.server_url,
            Arc::clone(&credentials),
        ));
        let http = Arc::new(AuthenticatedHttp::new(Client::new(), coordinator.clone()));
        Self {
            settings,
            credentials,
            coordinator,
            http,
        }
    }

    /// Durable scope backed by `credentials_path`, session scope in memory.
    pub fn from_settings(settings: Settings) -> Self {
        let credentials = Arc::new(CredentialStore::new(
            Arc::new(JsonFileScope::new(&settings.credentials_path)),
            Arc::new(MemoryScope::new()),
        ));
        Self::new(settings, credentials)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn coordinator(&self) -> &Arc<TokenRefreshCoordinator> {
        &self.coordinator
    }

    pub fn http(&self) -> &Arc<AuthenticatedHttp> {
        &self.http
    }

    /// Stores the token pair issued by a login. The access token must carry
    /// readable claims.
    pub async fn login_with_tokens(
        &self,
        access_token: &str,
        refresh_token: &str,
        remember: bool,
    ) -> Result<(), SessionError> {
        let Some(claims) = decode_claims(access_token) else {
            return Err(SessionError::ValidationRejected(
                "access token has no readable claims".into(),
            ));
        };
        self.credentials
            .store_login(access_token, refresh_token, remember)
            .await
            .map_err(|err| SessionError::TransientFailure(format!("{err:#}")))?;
        info!(user = %claims.subject_name, role = ?claims.role, remember, "signed in");
        Ok(())
    }

    pub async fn logout(&self) -> Result<(), SessionError> {
        self.credentials
            .clear_all()
            .await
            .map_err(|err| SessionError::TransientFailure(format!("{err:#}")))?;
        info!("signed out");
        Ok(())
    }

    pub fn entry_guard(&self) -> RoomEntryGuard {
        RoomEntryGuard::new(
            Arc::clone(&self.http),
            Arc::clone(&self.credentials),
            self.settings.server_url.clone(),
        )
    }

    pub fn connection_manager(&self) -> Arc<ChatConnectionManager> {
        let connector = WsRoomChannelConnector::new(
            self.settings.server_url.clone(),
            self.settings.reconnect_backoff(),
            self.coordinator.clone(),
        );
        ChatConnectionManager::new(Arc::new(connector), self.coordinator.clone())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
