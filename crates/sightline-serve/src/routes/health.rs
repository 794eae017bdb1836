//! Health check endpoint.

use axum::Json;
use axum::extract::State;
use serde::Serialize;
use sightline_ingest::LoopState;

use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    ingest: LoopState,
}

/// Public health check endpoint.
///
/// Reports `degraded` while the ingestion loop is backing off or has not
/// resolved its starting position; the server itself still answers.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let ingest = state.ingest.status().state;
    let status = match ingest {
        LoopState::Polling => "ok",
        _ => "degraded",
    };
    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        ingest,
    })
}
