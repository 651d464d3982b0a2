//! Client configuration loaded from environment variables.
//!
//! Every setting has a default, so a client starts with no configuration at
//! all. Values that do not parse are logged and replaced by the default.

use std::path::PathBuf;
use std::time::Duration;

use dari_media::{HostDevices, RetryPolicy};
use dari_shared::constants::{
    DEFAULT_ANSWER_TIMEOUT_SECS, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_STALE_CALL_TTL_SECS,
    DEFAULT_STORE_RETRY_ATTEMPTS, DEFAULT_STORE_RETRY_BACKOFF_MS, DEFAULT_STUN_URLS,
    DEFAULT_SWEEP_INTERVAL_SECS,
};
use dari_shared::UserId;
use dari_store::{Database, SqliteMailbox, StoreError};

use crate::session::CallTimeouts;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Mailbox database file.
    /// Env: `DARI_DB_PATH`
    /// Default: `mailbox.db` in the platform data directory.
    pub db_path: Option<PathBuf>,

    /// Authenticated user. Without one, every mailbox operation is refused.
    /// Env: `DARI_USER_ID`
    pub user_id: Option<UserId>,

    /// Public STUN servers.
    /// Env: `DARI_STUN_URLS` (comma-separated)
    /// Default: the two Google STUN servers.
    pub stun_urls: Vec<String>,

    /// Relay credential endpoint.
    /// Env: `DARI_RELAY_CREDENTIALS_URL`
    /// Default: none (STUN only).
    pub relay_credentials_url: Option<String>,

    /// How long the caller waits for an answer.
    /// Env: `DARI_ANSWER_TIMEOUT_SECS`
    /// Default: `60`
    pub answer_timeout: Duration,

    /// How long either side waits for `connected`.
    /// Env: `DARI_CONNECT_TIMEOUT_SECS`
    /// Default: `30`
    pub connect_timeout: Duration,

    /// Tries per mailbox operation, including the first.
    /// Env: `DARI_STORE_RETRY_ATTEMPTS`
    /// Default: `3`
    pub store_retry_attempts: u32,

    /// First retry delay; doubles on every further retry.
    /// Env: `DARI_STORE_RETRY_BACKOFF_MS`
    /// Default: `200`
    pub store_retry_backoff: Duration,

    /// Unanswered call records older than this are swept.
    /// Env: `DARI_STALE_CALL_TTL_SECS`
    /// Default: `3600`
    pub stale_call_ttl: Duration,

    /// Env: `DARI_SWEEP_INTERVAL_SECS`
    /// Default: `300`
    pub sweep_interval: Duration,

    /// Whether the host reports a camera.
    /// Env: `DARI_CAMERA` (on/off)
    /// Default: `on`
    pub camera: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            user_id: None,
            stun_urls: DEFAULT_STUN_URLS.iter().map(|u| u.to_string()).collect(),
            relay_credentials_url: None,
            answer_timeout: Duration::from_secs(DEFAULT_ANSWER_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            store_retry_attempts: DEFAULT_STORE_RETRY_ATTEMPTS,
            store_retry_backoff: Duration::from_millis(DEFAULT_STORE_RETRY_BACKOFF_MS),
            stale_call_ttl: Duration::from_secs(DEFAULT_STALE_CALL_TTL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            camera: true,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("DARI_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        if let Some(user) = lookup("DARI_USER_ID") {
            let user = user.trim();
            if !user.is_empty() {
                config.user_id = Some(UserId::new(user));
            }
        }

        if let Some(urls) = lookup("DARI_STUN_URLS") {
            let urls: Vec<String> = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from)
                .collect();
            if urls.iter().all(|u| u.starts_with("stun:")) {
                config.stun_urls = urls;
            } else {
                tracing::warn!(value = ?urls, "Invalid DARI_STUN_URLS, using default");
            }
        }

        if let Some(url) = lookup("DARI_RELAY_CREDENTIALS_URL") {
            if url.starts_with("http://") || url.starts_with("https://") {
                config.relay_credentials_url = Some(url);
            } else if !url.is_empty() {
                tracing::warn!(value = %url, "Invalid DARI_RELAY_CREDENTIALS_URL, ignoring");
            }
        }

        if let Some(secs) = parse_u64(&lookup, "DARI_ANSWER_TIMEOUT_SECS") {
            config.answer_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&lookup, "DARI_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_u64(&lookup, "DARI_STORE_RETRY_ATTEMPTS") {
            config.store_retry_attempts = u32::try_from(n).unwrap_or(u32::MAX);
        }
        if let Some(ms) = parse_u64(&lookup, "DARI_STORE_RETRY_BACKOFF_MS") {
            config.store_retry_backoff = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_u64(&lookup, "DARI_STALE_CALL_TTL_SECS") {
            config.stale_call_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&lookup, "DARI_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("DARI_CAMERA") {
            match val.trim().to_ascii_lowercase().as_str() {
                "on" | "true" | "1" => config.camera = true,
                "off" | "false" | "0" => config.camera = false,
                _ => tracing::warn!(value = %val, "Invalid DARI_CAMERA, using default"),
            }
        }

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.store_retry_attempts, self.store_retry_backoff)
    }

    pub fn timeouts(&self) -> CallTimeouts {
        CallTimeouts {
            answer: self.answer_timeout,
            connect: self.connect_timeout,
        }
    }

    pub fn host_devices(&self) -> HostDevices {
        HostDevices::new(self.camera)
    }

    /// Open the configured mailbox, creating the file if needed.
    pub fn open_mailbox(&self) -> Result<SqliteMailbox, StoreError> {
        match &self.db_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                SqliteMailbox::open_at(path)
            }
            None => Ok(SqliteMailbox::new(Database::new()?)),
        }
    }
}

/// Zero is rejected: every numeric setting is a count or a duration that
/// has to be positive.
fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(key, value = %raw, "Invalid setting, using default");
            None
        }
    }
}
