//! Liveness and readiness probes.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::api::ApiState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok" or "starting".
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
}

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

fn response(status: &str) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        service: "quarry-scheduler".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    }
}

/// The process is up. Does not look at the scheduler.
async fn healthz() -> impl IntoResponse {
    Json(response("ok"))
}

/// 503 until the scheduling loop has started.
async fn readyz(State(state): State<ApiState>) -> impl IntoResponse {
    if state.latch.is_open() {
        (StatusCode::OK, Json(response("ok")))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response("starting")))
    }
}
