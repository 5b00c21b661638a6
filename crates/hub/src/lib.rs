//! The aggregating hub.
//!
//! One WebSocket server with two roles: provider sockets (bridges dialing
//! in with `?server=<name>`) and frontend sockets (chat UIs, voice devices,
//! test harnesses). The hub merges every provider's advertised tools into
//! one virtual tool surface, routes `tools/call` back to the owning
//! provider, and synthesizes the MCP handshake so frontends see a single
//! logical server. The admin API and SSE status stream ride on the same
//! HTTP listener.

pub mod admin;
pub mod discovery;
pub mod hub;
pub mod ws;

use axum::{Extension, Router, routing::get};
use std::sync::Arc;

/// Assemble the full HTTP surface: both WebSocket roles plus the admin API.
#[must_use]
pub fn app(hub: Arc<hub::Hub>, admin_state: Arc<admin::AdminState>) -> Router {
    Router::new()
        .route("/", get(ws::frontend_ws))
        .route("/mcp", get(ws::provider_ws))
        .merge(admin::router())
        .layer(Extension(hub))
        .layer(Extension(admin_state))
}
