use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use reqwest::{Client, StatusCode};
use shared::protocol::RefreshTokenResponse;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use room_channel::{AccessTokenSource, TokenUnavailable};

use crate::{
    credentials::{CredentialStore, TokenKind},
    error::{RefreshOutcome, SessionError},
};

/// Refresh once fewer than this many seconds of validity remain.
pub const REFRESH_THRESHOLD_SECS: i64 = 600;
pub const REFRESH_TOKEN_PATH: &str = "api/user/refresh-token";

pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Source of a bearer credential that is valid right now.
#[async_trait]
pub trait BearerSource: Send + Sync {
    async fn bearer(&self) -> Result<String, SessionError>;
}

type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

struct InFlightRefresh {
    id: u64,
    future: SharedRefresh,
}

/// Keeps the access token fresh with at most one refresh call in flight.
///
/// The staleness check and the publication of the in-flight future happen
/// under the same lock, so a caller that arrives while a refresh is running
/// always joins it instead of starting another one.
pub struct TokenRefreshCoordinator {
    http: Client,
    refresh_url: String,
    credentials: Arc<CredentialStore>,
    clock: Arc<dyn Clock>,
    in_flight: Mutex<Option<InFlightRefresh>>,
    next_refresh_id: AtomicU64,
}

impl TokenRefreshCoordinator {
    pub fn new(server_url: &str, credentials: Arc<CredentialStore>) -> Self {
        Self::with_clock(server_url, credentials, Arc::new(SystemClock))
    }

    pub fn with_clock(
        server_url: &str,
        credentials: Arc<CredentialStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            http: Client::new(),
            refresh_url: format!("{}/{REFRESH_TOKEN_PATH}", server_url.trim_end_matches('/')),
            credentials,
            clock,
            in_flight: Mutex::new(None),
            next_refresh_id: AtomicU64::new(1),
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub async fn ensure_fresh(&self) -> RefreshOutcome {
        let (id, future) = {
            let mut slot = self.in_flight.lock().await;
            // A settled refresh whose waiters were all cancelled is never
            // cleared by them; its outcome must not be served again.
            let pending = slot
                .as_ref()
                .filter(|in_flight| in_flight.future.peek().is_none());
            match pending {
                Some(in_flight) => {
                    debug!(refresh_id = in_flight.id, "joining in-flight token refresh");
                    (in_flight.id, in_flight.future.clone())
                }
                None => {
                    let Some(claims) = self.credentials.claims(TokenKind::Access).await else {
                        info!("no readable access token; session is unauthenticated");
                        if let Err(err) = self.credentials.clear_all().await {
                            error!("failed to clear credentials: {err:#}");
                        }
                        return RefreshOutcome::Unauthenticated;
                    };
                    let remaining = claims.expires_at_unix - self.clock.now_unix();
                    if remaining >= REFRESH_THRESHOLD_SECS {
                        return RefreshOutcome::Fresh;
                    }

                    let id = self.next_refresh_id.fetch_add(1, Ordering::SeqCst);
                    info!(refresh_id = id, remaining_secs = remaining, "access token near expiry; refreshing");
                    let future = refresh_access_token(
                        self.http.clone(),
                        self.refresh_url.clone(),
                        Arc::clone(&self.credentials),
                    )
                    .boxed()
                    .shared();
                    *slot = Some(InFlightRefresh {
                        id,
                        future: future.clone(),
                    });
                    (id, future)
                }
            }
        };

        let outcome = future.await;

        let mut slot = self.in_flight.lock().await;
        if slot.as_ref().is_some_and(|in_flight| in_flight.id == id) {
            *slot = None;
        }
        outcome
    }
}

#[async_trait]
impl BearerSource for TokenRefreshCoordinator {
    async fn bearer(&self) -> Result<String, SessionError> {
        self.ensure_fresh().await.into_result()?;
        match self.credentials.get(TokenKind::Access).await {
            Ok(Some(token)) => Ok(token),
            Ok(None) => Err(SessionError::Unauthenticated),
            Err(err) => Err(SessionError::TransientFailure(format!(
                "failed to read access token: {err:#}"
            ))),
        }
    }
}

/// Reconnect handshakes go through the same single-flight refresh as HTTP.
#[async_trait]
impl AccessTokenSource for TokenRefreshCoordinator {
    async fn access_token(&self) -> Result<String, TokenUnavailable> {
        self.bearer().await.map_err(|err| match err {
            SessionError::Unauthenticated => TokenUnavailable::Revoked,
            other => TokenUnavailable::Temporary(other.to_string()),
        })
    }
}

async fn refresh_access_token(
    http: Client,
    refresh_url: String,
    credentials: Arc<CredentialStore>,
) -> RefreshOutcome {
    let refresh_token = match credentials.get(TokenKind::Refresh).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            warn!("no refresh token stored; clearing credentials");
            if let Err(err) = credentials.clear_all().await {
                error!("failed to clear credentials: {err:#}");
            }
            return RefreshOutcome::Unauthenticated;
        }
        Err(err) => {
            return RefreshOutcome::TransientFailure(format!(
                "failed to read refresh token: {err:#}"
            ))
        }
    };

    let response = match http.post(&refresh_url).bearer_auth(&refresh_token).send().await {
        Ok(response) => response,
        Err(err) => {
            warn!("token refresh request failed: {err}");
            return RefreshOutcome::TransientFailure(err.to_string());
        }
    };

    if response.status() == StatusCode::UNAUTHORIZED {
        warn!("refresh token rejected; clearing credentials");
        if let Err(err) = credentials.clear_all().await {
            error!("failed to clear credentials: {err:#}");
        }
        return RefreshOutcome::Unauthenticated;
    }

    let body: RefreshTokenResponse = match response.error_for_status() {
        Ok(response) => match response.json().await {
            Ok(body) => body,
            Err(err) => {
                warn!("invalid token refresh response: {err}");
                return RefreshOutcome::TransientFailure(err.to_string());
            }
        },
        Err(err) => {
            warn!(status = ?err.status(), "token refresh failed");
            return RefreshOutcome::TransientFailure(err.to_string());
        }
    };

    if let Err(err) = credentials.save(TokenKind::Access, &body.access_token).await {
        return RefreshOutcome::TransientFailure(format!("failed to store access token: {err:#}"));
    }
    info!("access token refreshed");
    RefreshOutcome::Fresh
}

#[cfg(test)]
#[path = "tests/refresh_tests.rs"]
mod tests;
