//! Health check endpoint

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use crate::api::server::AppState;
use crate::models::HealthStatus;

pub const SERVER_NAME: &str = "bare-proxy";

/// Liveness and uptime
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthStatus {
            status: "healthy",
            timestamp: chrono::Utc::now().to_rfc3339(),
            server: SERVER_NAME,
            uptime: state.uptime().as_secs(),
        }),
    )
}
