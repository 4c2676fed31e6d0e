//! Palaver Server Library
//!
//! The voice/video media plane: a selective forwarding unit plus its
//! signaling hub. This module exposes the server components for testing and
//! embedding.

pub mod api;
pub mod auth;
pub mod error;
pub mod perms;
pub mod sfu;
pub mod state;
pub mod stores;
pub mod voice;
pub mod ws;

use crate::stores::{CommunityStore, MessageStore};
use anyhow::Result;
use std::sync::Arc;

/// Create and configure the server application. Also spawns the SFU event
/// dispatcher, which lives for the lifetime of the process.
pub fn create_app(
    config: state::Config,
    communities: Arc<dyn CommunityStore>,
    messages: Arc<dyn MessageStore>,
) -> Result<(axum::Router, state::AppState)> {
    let (app_state, sfu_events) = state::AppState::new(config, communities, messages)?;
    tokio::spawn(ws::events::run_sfu_events(app_state.clone(), sfu_events));
    let router = api::create_router(app_state.clone());
    Ok((router, app_state))
}
