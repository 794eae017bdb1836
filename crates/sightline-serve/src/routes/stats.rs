//! Stats endpoint.

use axum::Json;
use axum::extract::State;
use serde::Serialize;
use sightline_ingest::{LoopStatus, StoreStats};

use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub identities: StoreStats,
    pub ingest: LoopStatus,
}

/// `GET /api/v1/stats`
///
/// Identity and record counts plus ingestion loop progress.
pub async fn overview(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        identities: state.store.stats(),
        ingest: state.ingest.status(),
    })
}
