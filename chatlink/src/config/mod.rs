//! Configuration for the `chatlink` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/chatlink/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::api::http::DEFAULT_REQUEST_TIMEOUT;
use crate::chat::send::{DEFAULT_ACK_TIMEOUT, SendConfig};
use crate::chat::store::StoreConfig;
use crate::connection::{
    ConnectionConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_INTERVAL,
};
use chatlink_proto::page::DEFAULT_PAGE_SIZE;

/// WebSocket endpoint used when none is configured.
pub const DEFAULT_WS_URL: &str = "ws://localhost:8000/ws/chat/";

/// REST base URL used when none is configured.
pub const DEFAULT_API_URL: &str = "http://localhost:8000/api/";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A configured endpoint is not a valid URL.
    #[error("invalid {field} {value:?}: {source}")]
    InvalidUrl {
        /// Which setting held the bad value.
        field: &'static str,
        /// The rejected value.
        value: String,
        /// Parser error.
        source: url::ParseError,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    connection: ConnectionFileConfig,
    chat: ChatFileConfig,
    http: HttpFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    ws_url: Option<String>,
    api_url: Option<String>,
}

/// `[connection]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConnectionFileConfig {
    max_reconnect_attempts: Option<u32>,
    reconnect_interval_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    connect_timeout_secs: Option<u64>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    ack_timeout_ms: Option<u64>,
    page_size: Option<u32>,
    suppress_open_unread: Option<bool>,
}

/// `[http]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct HttpFileConfig {
    request_timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Server --
    /// WebSocket endpoint, without the token parameter.
    pub ws_url: String,
    /// REST API base URL.
    pub api_url: String,
    /// Bearer token, if supplied on the command line or environment.
    pub token: Option<String>,

    // -- Connection --
    pub max_reconnect_attempts: u32,
    pub reconnect_interval: Duration,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,

    // -- Chat --
    /// How long a socket send waits for confirmation before REST fallback.
    pub ack_timeout: Duration,
    /// Messages per history page.
    pub page_size: u32,
    /// Skip unread counting for the open conversation.
    pub suppress_open_unread: bool,

    // -- HTTP --
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            token: None,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            page_size: DEFAULT_PAGE_SIZE,
            suppress_open_unread: true,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/chatlink/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default. Split from `load()` so it can be
    /// tested without CLI parsing.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            ws_url: cli
                .ws_url
                .clone()
                .or_else(|| file.server.ws_url.clone())
                .unwrap_or(defaults.ws_url),
            api_url: cli
                .api_url
                .clone()
                .or_else(|| file.server.api_url.clone())
                .unwrap_or(defaults.api_url),
            token: cli.token.clone().filter(|t| !t.trim().is_empty()),
            max_reconnect_attempts: file
                .connection
                .max_reconnect_attempts
                .unwrap_or(defaults.max_reconnect_attempts),
            reconnect_interval: file
                .connection
                .reconnect_interval_ms
                .map_or(defaults.reconnect_interval, Duration::from_millis),
            heartbeat_interval: file
                .connection
                .heartbeat_interval_ms
                .map_or(defaults.heartbeat_interval, Duration::from_millis),
            connect_timeout: file
                .connection
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            ack_timeout: file
                .chat
                .ack_timeout_ms
                .map_or(defaults.ack_timeout, Duration::from_millis),
            page_size: cli
                .page_size
                .or(file.chat.page_size)
                .unwrap_or(defaults.page_size)
                .max(1),
            suppress_open_unread: file
                .chat
                .suppress_open_unread
                .unwrap_or(defaults.suppress_open_unread),
            request_timeout: file
                .http
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
        }
    }

    /// Builds the socket settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidUrl`] if `ws_url` does not parse.
    pub fn connection_config(&self) -> Result<ConnectionConfig, ConfigError> {
        Ok(ConnectionConfig {
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_interval: self.reconnect_interval,
            heartbeat_interval: self.heartbeat_interval,
            connect_timeout: self.connect_timeout,
            ..ConnectionConfig::new(parse_url("ws_url", &self.ws_url)?)
        })
    }

    /// The REST base URL.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidUrl`] if `api_url` does not parse.
    pub fn api_base(&self) -> Result<Url, ConfigError> {
        parse_url("api_url", &self.api_url)
    }

    #[must_use]
    pub const fn send_config(&self) -> SendConfig {
        SendConfig {
            ack_timeout: self.ack_timeout,
        }
    }

    #[must_use]
    pub const fn store_config(&self) -> StoreConfig {
        StoreConfig {
            page_size: self.page_size,
            suppress_open_unread: self.suppress_open_unread,
        }
    }
}

fn parse_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
        source,
    })
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Real-time messaging client")]
pub struct CliArgs {
    /// WebSocket endpoint of the chat server.
    #[arg(long, env = "CHATLINK_WS_URL")]
    pub ws_url: Option<String>,

    /// Base URL of the REST API.
    #[arg(long, env = "CHATLINK_API_URL")]
    pub api_url: Option<String>,

    /// Bearer token for both the socket and the REST API.
    #[arg(long, env = "CHATLINK_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Messages per history page.
    #[arg(long)]
    pub page_size: Option<u32>,

    /// Path to config file (default: `~/.config/chatlink/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CHATLINK_LOG")]
    pub log_level: String,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// What the binary does once signed in.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Stay connected and print inbound messages (the default).
    Listen,
    /// Send one message and print how it was delivered.
    Send {
        /// Recipient user id.
        #[arg(long, conflicts_with = "group", required_unless_present = "group")]
        to: Option<u64>,
        /// Group chat id.
        #[arg(long)]
        group: Option<u64>,
        /// Message text.
        text: String,
    },
    /// Print one page of a conversation.
    History {
        /// Peer user id.
        #[arg(long, conflicts_with = "group", required_unless_present = "group")]
        with: Option<u64>,
        /// Group chat id.
        #[arg(long)]
        group: Option<u64>,
        /// Page number, 1 being the newest.
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    /// List conversations, most recent first.
    Conversations,
    /// Print the unread counter.
    Unread,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("chatlink").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
