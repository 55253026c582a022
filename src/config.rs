//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **CLI flags**: `--url`, `--name`, `--store`, `--skip-negotiation`
//! 2. **Environment variables**: `HUBCHAT_URL`, `HUBCHAT_USER`,
//!    `HUBCHAT_STORE`
//! 3. **Config file**: path via `--config <path>`, or `hubchat.toml` in CWD
//! 4. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [hub]
//! url = "http://localhost:5000/chat"
//! skip_negotiation = false
//! auto_reconnect = true
//! reconnect_delays_ms = [0, 2000, 10000, 30000]
//! keep_alive_interval_secs = 15
//! server_timeout_secs = 30
//! handshake_timeout_secs = 15
//!
//! [user]
//! name = "iPhone"
//!
//! # Optional: omit to keep the log in memory only
//! [storage]
//! path = "~/.local/share/hubchat/messages.jsonl"
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::transport::SignalROptions;

const DEFAULT_CONFIG_FILE: &str = "hubchat.toml";

/// CLI arguments parsed by `clap`.
#[derive(Debug, Default, Parser)]
#[command(name = "hubchat", version, about = "Terminal client for a real-time chat hub")]
pub struct Cli {
    /// Path to config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Hub endpoint, e.g. http://localhost:5000/chat
    #[arg(long)]
    pub url: Option<String>,

    /// Name shown on messages you send
    #[arg(long)]
    pub name: Option<String>,

    /// Message log file (JSON lines)
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Connect the WebSocket directly without the negotiate request
    #[arg(long)]
    pub skip_negotiation: bool,
}

/// Failures while resolving configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read { path: PathBuf, error: std::io::Error },
    Parse { path: PathBuf, error: toml::de::Error },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, error } => {
                write!(f, "Failed to read config file {}: {error}", path.display())
            }
            ConfigError::Parse { path, error } => {
                write!(f, "Failed to parse config file {}: {error}", path.display())
            }
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub user: UserConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Hub endpoint and connection tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Hub endpoint URL (default `http://localhost:5000/chat`).
    #[serde(default = "default_url")]
    pub url: String,
    /// Skip the `/negotiate` request (default false).
    #[serde(default)]
    pub skip_negotiation: bool,
    /// Reconnect after an unexpected drop (default true).
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,
    /// Delay before each reconnect attempt, in milliseconds. The list length
    /// is the number of attempts (default `[0, 2000, 10000, 30000]`).
    #[serde(default = "default_reconnect_delays_ms")]
    pub reconnect_delays_ms: Vec<u64>,
    #[serde(default = "default_keep_alive_interval_secs")]
    pub keep_alive_interval_secs: u64,
    #[serde(default = "default_server_timeout_secs")]
    pub server_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    /// Display name (default `iPhone`).
    #[serde(default = "default_user_name")]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// JSON-lines message log. `None` keeps messages in memory.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter used when `RUST_LOG` is unset (default `info`).
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_url() -> String {
    "http://localhost:5000/chat".to_string()
}
fn default_auto_reconnect() -> bool {
    true
}
fn default_reconnect_delays_ms() -> Vec<u64> {
    vec![0, 2000, 10_000, 30_000]
}
fn default_keep_alive_interval_secs() -> u64 {
    15
}
fn default_server_timeout_secs() -> u64 {
    30
}
fn default_handshake_timeout_secs() -> u64 {
    15
}
fn default_user_name() -> String {
    "iPhone".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            skip_negotiation: false,
            auto_reconnect: default_auto_reconnect(),
            reconnect_delays_ms: default_reconnect_delays_ms(),
            keep_alive_interval_secs: default_keep_alive_interval_secs(),
            server_timeout_secs: default_server_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            name: default_user_name(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Resolve configuration from the config file, the environment, and `cli`.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(&expand_tilde(path))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|error| ConfigError::Read {
            path: path.to_path_buf(),
            error,
        })?;
        toml::from_str(&content).map_err(|error| ConfigError::Parse {
            path: path.to_path_buf(),
            error,
        })
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("HUBCHAT_URL") {
            self.hub.url = url;
        }
        if let Some(name) = var("HUBCHAT_USER") {
            self.user.name = name;
        }
        if let Some(path) = var("HUBCHAT_STORE") {
            self.storage.path = Some(path);
        }
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(url) = &cli.url {
            self.hub.url.clone_from(url);
        }
        if let Some(name) = &cli.name {
            self.user.name.clone_from(name);
        }
        if let Some(path) = &cli.store {
            self.storage.path = Some(path.to_string_lossy().into_owned());
        }
        if cli.skip_negotiation {
            self.hub.skip_negotiation = true;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.hub.url.trim().is_empty() {
            return Err(ConfigError::Invalid("hub.url is empty".into()));
        }
        if self.user.name.trim().is_empty() {
            return Err(ConfigError::Invalid("user.name is empty".into()));
        }
        if self.hub.keep_alive_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "hub.keep_alive_interval_secs must be positive".into(),
            ));
        }
        if self.hub.server_timeout_secs <= self.hub.keep_alive_interval_secs {
            return Err(ConfigError::Invalid(
                "hub.server_timeout_secs must exceed hub.keep_alive_interval_secs".into(),
            ));
        }
        Ok(())
    }

    /// Message log path with `~/` expanded, if persistence is configured.
    pub fn storage_path(&self) -> Option<PathBuf> {
        self.storage
            .path
            .as_deref()
            .map(|p| expand_tilde(Path::new(p)))
    }

    pub fn signalr_options(&self) -> SignalROptions {
        let hub = &self.hub;
        SignalROptions {
            skip_negotiation: hub.skip_negotiation,
            auto_reconnect: hub.auto_reconnect,
            reconnect_delays: hub
                .reconnect_delays_ms
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
            keep_alive_interval: Duration::from_secs(hub.keep_alive_interval_secs),
            server_timeout: Duration::from_secs(hub.server_timeout_secs),
            handshake_timeout: Duration::from_secs(hub.handshake_timeout_secs),
        }
    }
}

/// Expand a leading `~/` to `$HOME`.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}
