//! Server configuration
//!
//! Loads listener and protocol settings, optionally from a TOML file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use super::ConnectionConfig;

/// Default maximum message size (16 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 16 * 1024 * 1024;

/// Default time allowed for a client to complete the upgrade handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Configuration for a listening server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Port to listen on (0 picks an ephemeral port)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Subprotocols the server is willing to speak. Empty echoes whatever
    /// the client offers first.
    #[serde(default)]
    pub protocols: Vec<String>,
    /// Largest data frame payload accepted from a peer
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u64,
    /// Milliseconds a client gets to complete the handshake
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Milliseconds a single frame write may take
    #[serde(default)]
    pub write_timeout_ms: Option<u64>,
    /// Answer Ping frames with a Pong carrying the same payload
    #[serde(default = "default_auto_pong")]
    pub auto_pong: bool,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7331
}

fn default_max_message_size() -> u64 {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}

fn default_auto_pong() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            protocols: Vec::new(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            write_timeout_ms: None,
            auto_pong: true,
        }
    }
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: impl Into<String>, port: u16) -> Self {
        Self {
            bind: bind.into(),
            port,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Set the supported subprotocols
    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Set the maximum message size
    pub fn with_max_message_size(mut self, size: u64) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the per-frame write timeout
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    /// Enable or disable automatic Pong replies
    pub fn with_auto_pong(mut self, auto_pong: bool) -> Self {
        self.auto_pong = auto_pong;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Handshake timeout as a Duration
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Settings applied to every accepted connection
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_message_size: self.max_message_size,
            auto_pong: self.auto_pong,
            write_timeout: self.write_timeout_ms.map(Duration::from_millis),
        }
    }
}
