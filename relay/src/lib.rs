//! Local AI proxy relay
//!
//! Routes AI requests arriving over HTTP to user-operated worker processes
//! that hold a long-lived WebSocket channel open to the relay, and
//! correlates each worker reply back to the waiting HTTP caller.

pub mod api;
pub mod auth;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod hub;
pub mod pending;
pub mod registry;
pub mod state;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Build the relay's HTTP + WebSocket router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route(shared_types::CHANNEL_PATH, get(channel::channel_handler))
        .route("/api/local-proxy/dispatch", post(dispatch::dispatch_handler))
        .route("/api/local-proxy/status", post(api::worker_status))
        .route("/admin/workers", get(api::list_workers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
