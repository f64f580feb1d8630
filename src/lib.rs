//! WebSocket protocol engine
//!
//! Performs the HTTP upgrade handshake in both directions, encodes and
//! decodes WebSocket frames, tracks concurrently connected peers in a shared
//! registry and dispatches their messages to handlers, optionally through a
//! tree of namespaces.

pub mod config;
pub mod conn;
pub mod protocol;
pub mod server;

pub use config::{ClientConfig, ConnectionConfig, ServerConfig};
pub use conn::{dial, dial_protocol, dial_with_config, Connection, ConnectionError, Incoming};
pub use server::{Handler, JsonMessageHandler, MessageHandler, Namespace, Server, ServerError};
