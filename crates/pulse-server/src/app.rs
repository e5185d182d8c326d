//! Application state and router.

use axum::{
    Json, Router,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agent::ChatAgent;
use crate::error::ApiError;
use crate::handler::ws_handler;
use crate::registry::ConnectionRegistry;
use crate::telemetry::TelemetryEmitter;

/// Shared application state.
///
/// The registry is the single shared mutable resource; it is created once
/// here and handed by reference to the endpoint handler and the emitter.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub emitter: Arc<TelemetryEmitter>,
    pub agent: Arc<dyn ChatAgent>,
}

impl AppState {
    /// Build state around an agent constructed from the emitter.
    pub fn new<F>(make_agent: F) -> Self
    where
        F: FnOnce(Arc<TelemetryEmitter>) -> Arc<dyn ChatAgent>,
    {
        let registry = Arc::new(ConnectionRegistry::new());
        let emitter = Arc::new(TelemetryEmitter::new(registry.clone()));
        let agent = make_agent(emitter.clone());
        Self {
            registry,
            emitter,
            agent,
        }
    }
}

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub output: String,
}

/// Request/response fallback sharing the agent path with the WebSocket
/// endpoint. Telemetry still flows to the session's channel if one is open.
async fn chat(
    axum::extract::State(state): axum::extract::State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let output = state
        .agent
        .respond(&req.session_id, &req.message)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(ChatResponse {
        session_id: req.session_id,
        output,
    }))
}
