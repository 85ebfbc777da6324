use std::{collections::HashMap, fs, path::Path, time::Duration};

use crate::{
    poller::DEFAULT_POLL_INTERVAL,
    realtime::{RetryPolicy, DEFAULT_RESUBSCRIBE_ATTEMPTS, DEFAULT_RESUBSCRIBE_DELAY},
};

pub const CLIENT_CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub server_url: String,
    pub api_key: Option<String>,
    pub poll_interval: Duration,
    pub resubscribe_delay: Duration,
    pub resubscribe_attempts: u32,
    pub event_buffer: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8787".into(),
            api_key: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
            resubscribe_attempts: DEFAULT_RESUBSCRIBE_ATTEMPTS,
            event_buffer: 1024,
        }
    }
}

impl SyncSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.resubscribe_attempts,
            delay: self.resubscribe_delay,
        }
    }
}

/// Defaults, then `client.toml` in the working directory, then `WAYFARER_*`
/// environment variables.
pub fn load_sync_settings() -> SyncSettings {
    load_sync_settings_from(Path::new(CLIENT_CONFIG_FILE), |key| std::env::var(key).ok())
}

pub fn load_sync_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> SyncSettings {
    let mut settings = SyncSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        apply_file_overrides(&mut settings, &raw);
    }

    if let Some(v) = env("WAYFARER_SERVER_URL") {
        settings.server_url = v.trim_end_matches('/').to_string();
    }
    if let Some(v) = env("WAYFARER_API_KEY") {
        settings.api_key = Some(v).filter(|key| !key.trim().is_empty());
    }
    if let Some(ms) = env("WAYFARER_POLL_INTERVAL_MS").and_then(|v| v.parse::<u64>().ok()) {
        settings.poll_interval = Duration::from_millis(ms.max(1));
    }
    if let Some(ms) = env("WAYFARER_RESUBSCRIBE_DELAY_MS").and_then(|v| v.parse::<u64>().ok()) {
        settings.resubscribe_delay = Duration::from_millis(ms);
    }
    if let Some(n) = env("WAYFARER_RESUBSCRIBE_ATTEMPTS").and_then(|v| v.parse::<u32>().ok()) {
        settings.resubscribe_attempts = n.max(1);
    }
    if let Some(n) = env("WAYFARER_EVENT_BUFFER").and_then(|v| v.parse::<usize>().ok()) {
        settings.event_buffer = n.max(1);
    }

    settings
}

fn apply_file_overrides(settings: &mut SyncSettings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(raw) else {
        return;
    };
    if let Some(v) = file_cfg.get("server_url").and_then(toml::Value::as_str) {
        settings.server_url = v.trim_end_matches('/').to_string();
    }
    if let Some(v) = file_cfg.get("api_key").and_then(toml::Value::as_str) {
        settings.api_key = Some(v.to_string()).filter(|key| !key.trim().is_empty());
    }
    if let Some(ms) = millis(&file_cfg, "poll_interval_ms") {
        settings.poll_interval = Duration::from_millis(ms.max(1));
    }
    if let Some(ms) = millis(&file_cfg, "resubscribe_delay_ms") {
        settings.resubscribe_delay = Duration::from_millis(ms);
    }
    if let Some(v) = file_cfg
        .get("resubscribe_attempts")
        .and_then(toml::Value::as_integer)
    {
        settings.resubscribe_attempts = u32::try_from(v).unwrap_or(1).max(1);
    }
    if let Some(v) = file_cfg.get("event_buffer").and_then(toml::Value::as_integer) {
        settings.event_buffer = usize::try_from(v).unwrap_or(1).max(1);
    }
}

fn millis(file_cfg: &HashMap<String, toml::Value>, key: &str) -> Option<u64> {
    file_cfg
        .get(key)
        .and_then(toml::Value::as_integer)
        .and_then(|v| u64::try_from(v).ok())
}
