//! Wire protocol module
//!
//! The frame codec and the HTTP upgrade handshake. Both are pure
//! transformations over async byte streams with no connection state.

mod frame;
mod handshake;

pub use frame::*;
pub use handshake::*;
