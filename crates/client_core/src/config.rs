use std::{collections::HashMap, fs, path::PathBuf, time::Duration};

use room_channel::BackoffPolicy;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_url: String,
    /// File backing the durable ("remember me") credential scope.
    pub credentials_path: PathBuf,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".into(),
            credentials_path: PathBuf::from("./data/credentials.json"),
            reconnect_initial_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            log_filter: "info".into(),
        }
    }
}

impl Settings {
    pub fn reconnect_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(self.reconnect_initial_delay_ms.max(1)),
            max_delay: Duration::from_millis(
                self.reconnect_max_delay_ms
                    .max(self.reconnect_initial_delay_ms),
            ),
            max_attempts: None,
        }
    }
}

/// Defaults, then `client.toml` in the working directory, then environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        apply_file_overrides(&mut settings, &raw);
    }
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());

    settings
}

pub(crate) fn apply_file_overrides(settings: &mut Settings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(raw) else {
        return;
    };
    let text = |key: &str| file_cfg.get(key).and_then(|v| v.as_str()).map(str::to_string);
    let number = |key: &str| {
        file_cfg
            .get(key)
            .and_then(|v| v.as_integer())
            .and_then(|v| u64::try_from(v).ok())
    };

    if let Some(v) = text("server_url") {
        settings.server_url = v;
    }
    if let Some(v) = text("credentials_path") {
        settings.credentials_path = PathBuf::from(v);
    }
    if let Some(v) = number("reconnect_initial_delay_ms") {
        settings.reconnect_initial_delay_ms = v;
    }
    if let Some(v) = number("reconnect_max_delay_ms") {
        settings.reconnect_max_delay_ms = v;
    }
    if let Some(v) = text("log_filter") {
        settings.log_filter = v;
    }
}

pub(crate) fn apply_env_overrides(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = var("APP__CREDENTIALS_PATH") {
        settings.credentials_path = PathBuf::from(v);
    }

    if let Some(v) = var("APP__RECONNECT_INITIAL_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_initial_delay_ms = parsed;
        }
    }
    if let Some(v) = var("APP__RECONNECT_MAX_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_max_delay_ms = parsed;
        }
    }

    if let Some(v) = var("APP__LOG_FILTER") {
        settings.log_filter = v;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
