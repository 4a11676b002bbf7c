//! Configuration management for brewline
//!
//! Handles loading and validation of `brewline.toml`. Every field has a
//! default, so an absent file or an empty section is a valid configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::records::RecordType;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV_VAR: &str = "BREWLINE_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Firehose connection settings
    #[serde(default)]
    pub stream: StreamConfig,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Backfill settings
    #[serde(default)]
    pub backfill: BackfillConfig,

    /// Feed query settings
    #[serde(default)]
    pub feed: FeedConfig,

    /// Profile cache settings
    #[serde(default)]
    pub profiles: ProfilesConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file, appended to alongside stderr
    #[serde(default)]
    pub log_file: Option<String>,

    /// Data directory path
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_file: None,
            data_dir: default_data_dir(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> String {
    "~/.local/share/brewline".to_string()
}

/// Firehose connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Subscription endpoints, tried in rotation
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Record types to request; empty means every known type
    #[serde(default)]
    pub wanted_types: Vec<String>,

    /// Ask the server for zstd-compressed frames
    #[serde(default = "default_true")]
    pub compress: bool,

    /// Optional zstd dictionary used to inflate compressed frames
    #[serde(default)]
    pub zstd_dictionary: Option<String>,

    /// Handshake timeout in milliseconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Reconnect when no frame arrives for this long (milliseconds)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// First reconnect delay in milliseconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Reconnect delay cap in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// How far to rewind the persisted cursor on resume (microseconds)
    #[serde(default = "default_rewind")]
    pub cursor_rewind_us: i64,

    /// Persist the cursor after this many processed events
    #[serde(default = "default_cursor_flush")]
    pub cursor_flush_every: u64,

    /// Capacity of the frame channel between connector and router
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            wanted_types: Vec::new(),
            compress: true,
            zstd_dictionary: None,
            handshake_timeout_ms: default_handshake_timeout(),
            idle_timeout_ms: default_idle_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            cursor_rewind_us: default_rewind(),
            cursor_flush_every: default_cursor_flush(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl StreamConfig {
    /// Record types to subscribe to, resolving short names and NSIDs.
    pub fn wanted_record_types(&self) -> Result<Vec<RecordType>> {
        if self.wanted_types.is_empty() {
            return Ok(RecordType::ALL.to_vec());
        }
        self.wanted_types
            .iter()
            .map(|name| {
                name.parse::<RecordType>().map_err(|_| {
                    ConfigError::ValidationError(format!("stream.wanted_types: unknown type {name}"))
                        .into()
                })
            })
            .collect()
    }

    /// Parsed subscription endpoints; each must be a `ws://` or `wss://` URL.
    pub fn endpoint_urls(&self) -> Result<Vec<url::Url>> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::ValidationError(
                "stream.endpoints must list at least one endpoint".into(),
            )
            .into());
        }
        self.endpoints
            .iter()
            .map(|endpoint| {
                let parsed = url::Url::parse(endpoint).map_err(|e| {
                    ConfigError::ValidationError(format!("stream.endpoints: {endpoint}: {e}"))
                })?;
                if !matches!(parsed.scheme(), "ws" | "wss") {
                    return Err(ConfigError::ValidationError(format!(
                        "stream.endpoints: {endpoint}: must use ws:// or wss://"
                    ))
                    .into());
                }
                Ok(parsed)
            })
            .collect()
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

fn default_endpoints() -> Vec<String> {
    vec![
        "wss://jetstream1.us-east.bsky.network/subscribe".to_string(),
        "wss://jetstream2.us-east.bsky.network/subscribe".to_string(),
        "wss://jetstream1.us-west.bsky.network/subscribe".to_string(),
        "wss://jetstream2.us-west.bsky.network/subscribe".to_string(),
    ]
}

fn default_true() -> bool {
    true
}

fn default_handshake_timeout() -> u64 {
    10_000
}

fn default_idle_timeout() -> u64 {
    60_000
}

fn default_initial_backoff() -> u64 {
    1_000
}

fn default_max_backoff() -> u64 {
    60_000
}

fn default_rewind() -> i64 {
    5_000_000
}

fn default_cursor_flush() -> u64 {
    100
}

fn default_channel_capacity() -> usize {
    1024
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file path
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Idle reader connections kept open
    #[serde(default = "default_reader_pool")]
    pub reader_pool_size: usize,

    /// SQLite busy timeout in milliseconds
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            reader_pool_size: default_reader_pool(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

impl StorageConfig {
    #[must_use]
    pub fn store_options(&self) -> crate::storage::StoreOptions {
        crate::storage::StoreOptions {
            reader_pool_size: self.reader_pool_size,
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
        }
    }
}

fn default_db_path() -> String {
    "~/.local/share/brewline/index.db".to_string()
}

fn default_reader_pool() -> usize {
    4
}

fn default_busy_timeout() -> u64 {
    5_000
}

/// Backfill configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Backfill newly seen actors automatically
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// DID PLC directory used to resolve origin stores
    #[serde(default = "default_plc_directory")]
    pub plc_directory: String,

    /// Records requested per listRecords page
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Actors backfilled at the same time
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Per-request HTTP timeout in milliseconds
    #[serde(default = "default_http_timeout")]
    pub http_timeout_ms: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            plc_directory: default_plc_directory(),
            page_size: default_page_size(),
            max_concurrent: default_max_concurrent(),
            http_timeout_ms: default_http_timeout(),
        }
    }
}

fn default_plc_directory() -> String {
    "https://plc.directory".to_string()
}

fn default_page_size() -> u32 {
    100
}

fn default_max_concurrent() -> usize {
    4
}

fn default_http_timeout() -> u64 {
    15_000
}

/// Feed query configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Page size when the caller gives none
    #[serde(default = "default_feed_limit")]
    pub default_limit: usize,

    /// Largest page a caller may request
    #[serde(default = "default_feed_max")]
    pub max_limit: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            default_limit: default_feed_limit(),
            max_limit: default_feed_max(),
        }
    }
}

fn default_feed_limit() -> usize {
    20
}

fn default_feed_max() -> usize {
    100
}

/// Profile cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilesConfig {
    /// Entry lifetime in seconds
    #[serde(default = "default_profile_ttl")]
    pub ttl_secs: u64,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_profile_ttl(),
        }
    }
}

fn default_profile_ttl() -> u64 {
    3_600
}

impl Config {
    /// Load configuration from `$BREWLINE_CONFIG` or the default location.
    ///
    /// A missing file at the default location yields the defaults; a missing
    /// file named by the environment variable is an error.
    pub fn load() -> Result<Self> {
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            return Self::load_from(Path::new(&path));
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config = Self::from_toml(&text)?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// `$XDG_CONFIG_HOME/brewline/brewline.toml` or the platform equivalent.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("brewline").join("brewline.toml"))
    }

    /// Reject values that would make the consumer misbehave.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| -> Result<()> {
            Err(ConfigError::ValidationError(msg.to_string()).into())
        };

        self.stream.endpoint_urls()?;
        self.stream.wanted_record_types()?;
        if self.stream.cursor_flush_every == 0 {
            return invalid("stream.cursor_flush_every must be at least 1");
        }
        if self.stream.channel_capacity == 0 {
            return invalid("stream.channel_capacity must be at least 1");
        }
        if self.stream.initial_backoff_ms > self.stream.max_backoff_ms {
            return invalid("stream.initial_backoff_ms must not exceed stream.max_backoff_ms");
        }
        if self.stream.cursor_rewind_us < 0 {
            return invalid("stream.cursor_rewind_us must not be negative");
        }
        if self.backfill.max_concurrent == 0 {
            return invalid("backfill.max_concurrent must be at least 1");
        }
        if !(1..=100).contains(&self.backfill.page_size) {
            return invalid("backfill.page_size must be between 1 and 100");
        }
        if self.feed.max_limit == 0 || self.feed.default_limit > self.feed.max_limit {
            return invalid("feed.default_limit must be between 1 and feed.max_limit");
        }
        Ok(())
    }

    /// Database path with `~` expanded.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        expand_home(&self.storage.db_path)
    }

    /// Log file path with `~` expanded.
    #[must_use]
    pub fn log_file(&self) -> Option<PathBuf> {
        self.general.log_file.as_deref().map(expand_home)
    }
}

/// Expand a leading `~/` to the home directory.
#[must_use]
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().map_or_else(|| PathBuf::from(path), |home| home.join(rest)),
        None => PathBuf::from(path),
    }
}
