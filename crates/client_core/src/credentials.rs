use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::Deserialize;
use shared::domain::Role;
use tokio::sync::Mutex;
use tracing::{info, warn};
use zeroize::Zeroize;

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const REMEMBER_ME_KEY: &str = "remember_me";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub fn storage_key(self) -> &'static str {
        match self {
            TokenKind::Access => ACCESS_TOKEN_KEY,
            TokenKind::Refresh => REFRESH_TOKEN_KEY,
        }
    }
}

/// Lifetime of a stored credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Survives restarts ("remember me").
    Persistent,
    /// Lives as long as the process.
    Ephemeral,
}

#[async_trait]
pub trait CredentialScope: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryScope {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryScope {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialScope for MemoryScope {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        if let Some(mut previous) = self
            .values
            .lock()
            .await
            .insert(key.to_string(), value.to_string())
        {
            previous.zeroize();
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if let Some(mut previous) = self.values.lock().await.remove(key) {
            previous.zeroize();
        }
        Ok(())
    }
}

/// Durable scope kept as a flat JSON object on disk. The file is read once and
/// rewritten on every mutation.
pub struct JsonFileScope {
    path: PathBuf,
    cache: Mutex<Option<HashMap<String, String>>>,
}

impl JsonFileScope {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<HashMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(HashMap::new()),
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("corrupt credential file '{}'", self.path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to read credential file '{}'", self.path.display())),
        }
    }

    async fn persist(&self, values: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("failed to create directory '{}'", parent.display())
                })?;
            }
        }
        let raw = serde_json::to_string_pretty(values)?;
        tokio::fs::write(&self.path, raw)
            .await
            .with_context(|| format!("failed to write credential file '{}'", self.path.display()))
    }

    async fn update(&self, mutate: impl FnOnce(&mut HashMap<String, String>)) -> Result<()> {
        let mut cache = self.cache.lock().await;
        let mut values = match cache.take() {
            Some(values) => values,
            None => self.load().await?,
        };
        mutate(&mut values);
        let persisted = self.persist(&values).await;
        *cache = Some(values);
        persisted
    }
}

#[async_trait]
impl CredentialScope for JsonFileScope {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut cache = self.cache.lock().await;
        if cache.is_none() {
            *cache = Some(self.load().await?);
        }
        Ok(cache.as_ref().and_then(|values| values.get(key).cloned()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.update(|values| {
            if let Some(mut previous) = values.insert(key.to_string(), value.to_string()) {
                previous.zeroize();
            }
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.update(|values| {
            if let Some(mut previous) = values.remove(key) {
                previous.zeroize();
            }
        })
        .await
    }
}

/// Decoded fields of an access or refresh token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub role: Role,
    pub subject_name: String,
    pub expires_at_unix: i64,
}

#[derive(Deserialize)]
struct RawClaims {
    #[serde(default)]
    role: Option<serde_json::Value>,
    #[serde(default)]
    unique_name: Option<String>,
    exp: i64,
}

fn normalize_role(raw: Option<&serde_json::Value>) -> Option<Role> {
    match raw {
        None | Some(serde_json::Value::Null) => Some(Role::Guest),
        Some(serde_json::Value::Number(n)) => n.as_i64().and_then(Role::from_ordinal),
        Some(serde_json::Value::String(s)) => match s.trim().parse::<i64>() {
            Ok(ordinal) => Role::from_ordinal(ordinal),
            Err(_) => match s.trim().to_ascii_lowercase().as_str() {
                "guest" => Some(Role::Guest),
                "user" => Some(Role::User),
                "admin" => Some(Role::Admin),
                _ => None,
            },
        },
        Some(_) => None,
    }
}

/// Reads the payload segment of a compact JWT without verifying its
/// signature; the server is the only party that validates tokens.
pub fn decode_claims(token: &str) -> Option<Claims> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let raw: RawClaims = serde_json::from_slice(&bytes).ok()?;
    let role = normalize_role(raw.role.as_ref())?;
    // Non-ASCII user names are url-encoded by the server.
    let subject_name = raw
        .unique_name
        .map(|name| match urlencoding::decode(&name) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => name,
        })
        .unwrap_or_default();
    Some(Claims {
        role,
        subject_name,
        expires_at_unix: raw.exp,
    })
}

struct CachedClaims {
    token: String,
    claims: Option<Claims>,
}

/// Access/refresh token slots over a durable and a session-only scope.
///
/// The `remember_me` flag always lives in the durable scope and decides which
/// scope is authoritative. Only the refresh coordinator replaces the access
/// token after login; only logout or a rejected refresh clears everything.
pub struct CredentialStore {
    durable: Arc<dyn CredentialScope>,
    session: Arc<dyn CredentialScope>,
    claims_cache: Mutex<HashMap<TokenKind, CachedClaims>>,
}

impl CredentialStore {
    pub fn new(durable: Arc<dyn CredentialScope>, session: Arc<dyn CredentialScope>) -> Self {
        Self {
            durable,
            session,
            claims_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryScope::new()), Arc::new(MemoryScope::new()))
    }

    fn scope(&self, scope: Scope) -> &Arc<dyn CredentialScope> {
        match scope {
            Scope::Persistent => &self.durable,
            Scope::Ephemeral => &self.session,
        }
    }

    pub async fn remember_me(&self) -> Result<bool> {
        Ok(self.durable.get(REMEMBER_ME_KEY).await?.as_deref() == Some("true"))
    }

    pub async fn set_remember_me(&self, remember: bool) -> Result<()> {
        self.durable
            .set(REMEMBER_ME_KEY, if remember { "true" } else { "false" })
            .await
    }

    pub async fn active_scope(&self) -> Result<Scope> {
        Ok(if self.remember_me().await? {
            Scope::Persistent
        } else {
            Scope::Ephemeral
        })
    }

    pub async fn get(&self, kind: TokenKind) -> Result<Option<String>> {
        let scope = self.active_scope().await?;
        self.scope(scope).get(kind.storage_key()).await
    }

    pub async fn set(&self, kind: TokenKind, value: &str, scope: Scope) -> Result<()> {
        self.scope(scope).set(kind.storage_key(), value).await
    }

    /// Writes into whichever scope is currently authoritative.
    pub async fn save(&self, kind: TokenKind, value: &str) -> Result<()> {
        let scope = self.active_scope().await?;
        self.set(kind, value, scope).await
    }

    /// Records a fresh login: the remember flag first, then both tokens into
    /// the scope it selects.
    pub async fn store_login(&self, access_token: &str, refresh_token: &str, remember: bool) -> Result<()> {
        self.set_remember_me(remember).await?;
        self.save(TokenKind::Access, access_token).await?;
        self.save(TokenKind::Refresh, refresh_token).await?;
        info!(remember, "credentials stored");
        Ok(())
    }

    /// Removes both token kinds from both scopes, whatever `remember_me` says.
    pub async fn clear_all(&self) -> Result<()> {
        for scope in [&self.durable, &self.session] {
            scope.remove(REFRESH_TOKEN_KEY).await?;
            scope.remove(ACCESS_TOKEN_KEY).await?;
        }
        let mut cache = self.claims_cache.lock().await;
        for cached in cache.values_mut() {
            cached.token.zeroize();
        }
        cache.clear();
        info!("credentials cleared");
        Ok(())
    }

    /// Claims of the stored token, or `None` when it is absent, unreadable or
    /// malformed. Decoding runs once per distinct token string.
    pub async fn claims(&self, kind: TokenKind) -> Option<Claims> {
        let token = match self.get(kind).await {
            Ok(Some(token)) => token,
            Ok(None) => return None,
            Err(err) => {
                warn!(?kind, "failed to read token: {err:#}");
                return None;
            }
        };

        let mut cache = self.claims_cache.lock().await;
        if let Some(cached) = cache.get(&kind) {
            if cached.token == token {
                return cached.claims.clone();
            }
        }
        let claims = decode_claims(&token);
        if let Some(mut stale) = cache.insert(kind, CachedClaims { token, claims: claims.clone() }) {
            stale.token.zeroize();
        }
        claims
    }

    /// Guests hold a token but do not count as logged in.
    pub async fn is_logged_in(&self) -> bool {
        self.claims(TokenKind::Access)
            .await
            .is_some_and(|claims| claims.role >= Role::User)
    }
}

#[cfg(test)]
#[path = "tests/credentials_tests.rs"]
mod tests;
