//! Palaver Protocol
//!
//! Shared types for the WebSocket signaling protocol between clients and the
//! voice server. Both sides serialize these with serde; the wire format is
//! JSON with a `type` tag on every message.

mod messages;
mod types;

pub use messages::{ClientMessage, ServerMessage};
pub use types::*;
