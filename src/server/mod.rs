//! WebSocket server module
//!
//! Accepts connections into a shared registry and routes their messages to
//! handlers, optionally through a tree of namespaces.

mod handler;
mod namespace;
mod registry;
mod websocket;

pub use handler::*;
pub use namespace::*;
pub use registry::*;
pub use websocket::*;
