//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! The bot is push-driven: the chat platform POSTs every update to
//! `/webhook/{secret}`. `/health` is for the load balancer.

pub mod webhook;

use axum::Json;
use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/{secret}", post(webhook::receive))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
