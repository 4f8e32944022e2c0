//! Common utilities for integration tests

use axum::extract::ws::WebSocketUpgrade;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

/// Build a router with the same HTTP surface as the server binary.
///
/// The state-heavy pieces (engines, session registry) live in the binary
/// crate, so the routes here use stand-in handlers with matching shapes.
pub fn create_test_app() -> Router {
    Router::new()
        .route(
            "/health",
            get(|| async {
                Json(serde_json::json!({
                    "service": "speech-pipeline-server",
                    "status": "ok",
                    "version": env!("CARGO_PKG_VERSION"),
                }))
            }),
        )
        .route(
            "/ws/chat",
            get(|ws: WebSocketUpgrade| async move {
                ws.on_upgrade(|_socket| async {}).into_response()
            }),
        )
        .layer(
            ServiceBuilder::new()
                .layer(CorsLayer::permissive())
                .into_inner(),
        )
}
