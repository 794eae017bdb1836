//! Snapshot endpoints for the renderer.

use axum::Json;
use axum::extract::{Query, State};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sightline_ingest::SnapshotEntry;

use crate::cache::{self, PINS_KEY};
use crate::config::Viewport;
use crate::error::ApiError;
use crate::state::AppState;

/// Query parameters for `GET /api/v1/snapshot`.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotQuery {
    /// Snapshot time (RFC 3339). Defaults to the last observed event.
    pub as_of: Option<DateTime<Utc>>,
    /// Session window in milliseconds. Defaults to the configured timeout.
    pub session_timeout_ms: Option<u64>,
}

/// `GET /api/v1/snapshot`
///
/// Identities with a reservation, or searching within the session window,
/// ordered by first activity.
pub async fn snapshot(
    State(state): State<AppState>,
    Query(params): Query<SnapshotQuery>,
) -> Result<Json<Vec<SnapshotEntry>>, ApiError> {
    let timeout = match params.session_timeout_ms {
        Some(ms) => i64::try_from(ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .ok_or_else(|| ApiError::BadRequest(format!("session_timeout_ms out of range: {ms}")))?,
        None => state.config.session_timeout_chrono(),
    };

    let Some(as_of) = params.as_of.or_else(|| state.store.last_timestamp()) else {
        return Ok(Json(Vec::new()));
    };
    if params.session_timeout_ms.is_some() && as_of.checked_sub_signed(timeout).is_none() {
        return Err(ApiError::BadRequest(format!(
            "session window reaches before the earliest supported time: {} ms",
            timeout.num_milliseconds()
        )));
    }

    Ok(Json(state.store.read_as_of(as_of, timeout)))
}

/// Pins at the last observed event, as refreshed by the snapshot timer.
pub fn compute_pins(state: &AppState) -> Vec<SnapshotEntry> {
    match state.store.last_timestamp() {
        Some(as_of) => state.store.pins(as_of, state.config.session_timeout_chrono()),
        None => Vec::new(),
    }
}

/// `GET /api/v1/pins`
///
/// Searching identities without a reservation: what the map shows.
pub async fn pins(State(state): State<AppState>) -> Result<Json<Vec<SnapshotEntry>>, ApiError> {
    let pins = cache::get_or_compute(&state.cache, PINS_KEY, || async {
        Ok(compute_pins(&state))
    })
    .await?;
    Ok(Json(pins))
}

/// `GET /api/v1/viewport`
///
/// The configured map center and zoom, or `null` when unset.
pub async fn viewport(State(state): State<AppState>) -> Json<Option<Viewport>> {
    Json(state.config.viewport)
}
