//! Inspection endpoints over identities and raw records.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use serde::Serialize;
use sightline_core::{EventKind, RawRecord};
use sightline_ingest::Aggregate;

use crate::error::ApiError;
use crate::state::AppState;

/// The authoritative aggregate for an id.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityResponse {
    /// The id that was requested.
    pub id: String,
    /// User id of the merged identity this resolves to, if any.
    pub merged_into: Option<String>,
    /// Anonymous ids merged into that identity.
    pub members: Vec<String>,
    pub aggregate: Aggregate,
}

/// `GET /api/v1/identities/{id}`
///
/// Accepts an anonymous id or an authenticated user id. Absorbed anonymous
/// ids resolve to the merged identity.
pub async fn get_identity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<IdentityResponse>, ApiError> {
    let response = state.store.read(|s| {
        let aggregate = s.aggregate_for(&id)?.clone();
        let merged = s
            .merged_identity_for(&id)
            .filter(|m| m.aggregate.consolidated_id == aggregate.consolidated_id);
        Some(IdentityResponse {
            id: id.clone(),
            merged_into: merged.map(|m| m.user_id.clone()),
            members: merged
                .map(|m| m.members.iter().cloned().collect())
                .unwrap_or_default(),
            aggregate,
        })
    });

    response
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("identity {id}")))
}

fn owned(records: Vec<Arc<RawRecord>>) -> Vec<RawRecord> {
    records.iter().map(|r| RawRecord::clone(r)).collect()
}

/// `GET /api/v1/reservations/{reservation_id}`
///
/// Raw lifecycle records for one reservation, in arrival order.
pub async fn reservation_records(
    State(state): State<AppState>,
    Path(reservation_id): Path<String>,
) -> Result<Json<Vec<RawRecord>>, ApiError> {
    let records = state.store.records_for_reservation(&reservation_id);
    if records.is_empty() {
        return Err(ApiError::NotFound(format!("reservation {reservation_id}")));
    }
    Ok(Json(owned(records)))
}

/// `GET /api/v1/events/{kind}/{name}`
///
/// Records of one event kind and name. Unnamed events are indexed under their
/// kind, e.g. `/events/identify/identify`.
pub async fn event_records(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> Result<Json<Vec<RawRecord>>, ApiError> {
    let kind: EventKind = kind.parse().map_err(ApiError::BadRequest)?;
    Ok(Json(owned(state.store.records_for_event(kind, &name))))
}

/// `GET /api/v1/users/{user_id}/events`
///
/// Records that carried this authenticated user id.
pub async fn user_records(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<RawRecord>>, ApiError> {
    Ok(Json(owned(state.store.records_for_user(&user_id))))
}
