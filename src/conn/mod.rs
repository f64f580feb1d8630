//! Connection module
//!
//! A single established WebSocket session and the client-side dial path
//! that produces one.

mod connection;
mod dial;

pub use connection::*;
pub use dial::*;
