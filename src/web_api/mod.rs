//! WebAPI - REST, Streaming and WebSocket Endpoints
//!
//! ## Responsibilities
//!
//! - HTTP API routes (cameras, frames, analytics, zones, alerts, movements)
//! - MJPEG streaming and snapshots
//! - WebSocket frame ingestion and metric/alert push
//!
//! Handlers stay thin: validate, call the owning service, shape the JSON.

mod routes;
mod stream_routes;
mod ws_routes;

pub use routes::create_router;

use crate::models::now_ms;
use crate::state::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();

    Json(json!({
        "status": if db_ok { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "db": if db_ok { "connected" } else { "error" },
        "timestamp": now_ms(),
    }))
}
