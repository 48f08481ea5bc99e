//! Configuration file parser for ~/.config/feedsync/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are accepted but logged as warnings, since they are usually
//! typos.
use crate::feed::{CategoryCatalog, Endpoints, FeedOptions, FetchPolicy, DEFAULT_CATEGORIES};
use crate::realtime::{Backoff, ChannelTimeouts};
use crate::sync::SyncSettings;
use crate::util::{validate_base_url, UrlValidationError};
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid api_base_url: {0}")]
    InvalidBaseUrl(#[from] UrlValidationError),
}

// ============================================================================
// Configuration Struct
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// `Debug` masks `api_token`.
#[derive(Deserialize)]
#[serde(default)]
pub struct Config {
    /// Feed API root. https, or http for localhost.
    pub api_base_url: String,
    pub listing_path: String,
    pub item_path: String,
    /// Websocket path; empty disables the realtime channel.
    pub realtime_path: String,
    /// Sent as `Authorization: Bearer`. The `FEEDSYNC_API_TOKEN` env var wins.
    #[serde(deserialize_with = "deserialize_secret")]
    pub api_token: Option<SecretString>,

    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,

    pub page_size: u32,
    pub max_pages: u32,
    /// 0 = unlimited
    pub max_items_per_category: usize,

    /// 0 = no periodic refresh
    pub refresh_interval_secs: u64,
    pub realtime_backoff_floor_secs: u64,
    pub realtime_backoff_ceiling_secs: u64,
    pub realtime_connect_timeout_secs: u64,
    /// Silence (no frames, keepalives included) before reconnecting. 0 = never
    pub realtime_idle_timeout_secs: u64,
    pub hint_debounce_ms: u64,

    pub deeplink_poll_window_ms: u64,
    pub deeplink_poll_interval_ms: u64,

    /// Category allow-list.
    pub categories: Vec<String>,
    /// Used for unknown category input.
    pub default_category: String,
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.filter(|t| !t.trim().is_empty()).map(SecretString::from))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.example.com".to_string(),
            listing_path: "/v1/feed".to_string(),
            item_path: "/v1/items".to_string(),
            realtime_path: "/v1/realtime".to_string(),
            api_token: None,
            request_timeout_secs: 12,
            max_retries: 2,
            retry_backoff_ms: 1000,
            page_size: 50,
            max_pages: 3,
            max_items_per_category: 0,
            refresh_interval_secs: 120,
            realtime_backoff_floor_secs: 2,
            realtime_backoff_ceiling_secs: 60,
            realtime_connect_timeout_secs: 12,
            realtime_idle_timeout_secs: 90,
            hint_debounce_ms: 500,
            deeplink_poll_window_ms: 4000,
            deeplink_poll_interval_ms: 200,
            categories: DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect(),
            default_category: "all".to_string(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_base_url", &self.api_base_url)
            .field("listing_path", &self.listing_path)
            .field("item_path", &self.item_path)
            .field("realtime_path", &self.realtime_path)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("page_size", &self.page_size)
            .field("max_pages", &self.max_pages)
            .field("max_items_per_category", &self.max_items_per_category)
            .field("refresh_interval_secs", &self.refresh_interval_secs)
            .field("realtime_backoff_floor_secs", &self.realtime_backoff_floor_secs)
            .field("realtime_backoff_ceiling_secs", &self.realtime_backoff_ceiling_secs)
            .field("realtime_connect_timeout_secs", &self.realtime_connect_timeout_secs)
            .field("realtime_idle_timeout_secs", &self.realtime_idle_timeout_secs)
            .field("hint_debounce_ms", &self.hint_debounce_ms)
            .field("deeplink_poll_window_ms", &self.deeplink_poll_window_ms)
            .field("deeplink_poll_interval_ms", &self.deeplink_poll_interval_ms)
            .field("categories", &self.categories)
            .field("default_category", &self.default_category)
            .finish()
    }
}

const KNOWN_KEYS: &[&str] = &[
    "api_base_url",
    "listing_path",
    "item_path",
    "realtime_path",
    "api_token",
    "request_timeout_secs",
    "max_retries",
    "retry_backoff_ms",
    "page_size",
    "max_pages",
    "max_items_per_category",
    "refresh_interval_secs",
    "realtime_backoff_floor_secs",
    "realtime_backoff_ceiling_secs",
    "realtime_connect_timeout_secs",
    "realtime_idle_timeout_secs",
    "hint_debounce_ms",
    "deeplink_poll_window_ms",
    "deeplink_poll_interval_ms",
    "categories",
    "default_category",
];

impl Config {
    /// Maximum config file size (1 MiB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing or empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config = Self::parse(&content)?;
        tracing::info!(path = %path.display(), base_url = %config.api_base_url, "Loaded configuration");
        Ok(config)
    }

    /// Parses TOML text; blank input yields the defaults.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        Ok(toml::from_str(content)?)
    }

    /// Overrides `api_token` from `FEEDSYNC_API_TOKEN` when set and non-empty.
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("FEEDSYNC_API_TOKEN") {
            if !token.trim().is_empty() {
                self.api_token = Some(SecretString::from(token));
            }
        }
    }

    pub fn base_url(&self) -> Result<Url, ConfigError> {
        Ok(validate_base_url(&self.api_base_url)?)
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
            max_retries: self.max_retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            listing_path: self.listing_path.clone(),
            item_path: self.item_path.clone(),
        }
    }

    pub fn catalog(&self) -> CategoryCatalog {
        CategoryCatalog::new(&self.categories, &self.default_category)
    }

    pub fn feed_options(&self) -> FeedOptions {
        FeedOptions {
            page_size: self.page_size.max(1),
            max_pages: self.max_pages.max(1),
            max_items: self.max_items_per_category,
        }
    }

    pub fn realtime_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_secs(self.realtime_backoff_floor_secs),
            Duration::from_secs(self.realtime_backoff_ceiling_secs),
        )
    }

    pub fn realtime_timeouts(&self) -> ChannelTimeouts {
        ChannelTimeouts {
            connect: Duration::from_secs(self.realtime_connect_timeout_secs.max(1)),
            idle: (self.realtime_idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.realtime_idle_timeout_secs)),
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            catalog: self.catalog(),
            feed_options: self.feed_options(),
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
            hint_debounce: Duration::from_millis(self.hint_debounce_ms),
        }
    }

    pub fn deeplink_polling(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.deeplink_poll_window_ms),
            Duration::from_millis(self.deeplink_poll_interval_ms),
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
