//! Per-connection and client dial settings

use std::time::Duration;

use super::{DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_MAX_MESSAGE_SIZE};

/// Settings that govern a single established connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Largest data frame payload accepted from the peer
    pub max_message_size: u64,
    /// Answer Ping frames with a Pong carrying the same payload
    pub auto_pong: bool,
    /// Upper bound on a single frame write
    pub write_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            auto_pong: true,
            write_timeout: None,
        }
    }
}

/// Settings for dialing a server
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Request target sent in the upgrade request
    pub path: String,
    /// Subprotocol to request
    pub protocol: Option<String>,
    /// Check Sec-WebSocket-Accept against the key that was sent
    pub verify_accept: bool,
    /// Upper bound on connect plus handshake
    pub handshake_timeout: Duration,
    /// Settings for the resulting connection
    pub connection: ConnectionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            protocol: None,
            verify_accept: true,
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            connection: ConnectionConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Set the request path
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Request a subprotocol
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Enable or disable accept-key verification
    pub fn with_verify_accept(mut self, verify: bool) -> Self {
        self.verify_accept = verify;
        self
    }
}
