//! Configuration module
//!
//! Server settings (loadable from TOML) and per-connection/client settings.

mod connection;
mod server;

pub use connection::*;
pub use server::*;
