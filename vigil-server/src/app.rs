use axum::{Json, Router, extract::State, routing::get};
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{infra::app_state::AppState, routes};

/// Full HTTP surface with middleware applied.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping_handler))
        .route("/health", get(health_handler))
        .merge(routes::create_api_router())
        // Last layer wraps outermost: tracing sees CORS preflights too.
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ping_handler() -> &'static str {
    "pong"
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let config = state.runtime.config();
    Json(json!({
        "status": "ok",
        "tick_interval_ms": config.tick_interval_ms,
        "dispatch_batch_size": config.dispatch_batch_size,
    }))
}
