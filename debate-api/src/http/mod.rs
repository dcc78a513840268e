//! HTTP surface: the signaling WebSocket and health check

pub mod health;
pub mod websocket;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use debate_sfu::RoomRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    /// Largest signaling frame accepted from a client, in bytes
    pub max_message_size: usize,
}

/// Create the HTTP router with all routes
pub fn create_router(registry: Arc<RoomRegistry>, max_message_size: usize) -> Router {
    let state = AppState {
        registry,
        max_message_size,
    };

    Router::new()
        .merge(health::create_health_router())
        .route("/ws", get(websocket::websocket_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
