//! The signaling hub: WebSocket connection registry, message dispatch, the
//! voice protocol handlers, and the SFU event dispatcher.

pub mod connections;
pub mod events;
pub mod handler;
pub mod voice;
