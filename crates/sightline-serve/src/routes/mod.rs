//! API route definitions.

mod health;
mod identities;
mod snapshot;
mod stats;

use axum::Router;
use axum::http::{HeaderValue, header};
use axum::middleware;
use axum::response::Response;
use axum::routing::get;

use crate::auth::require_auth;
use crate::state::AppState;

pub use snapshot::compute_pins;

/// Build the complete API router.
///
/// # Route Structure
///
/// ## Public (no auth)
/// - `GET /health` - Health check
///
/// ## Protected (auth required)
///
/// ### Snapshot
/// - `GET /api/v1/snapshot` - Identities relevant at `as_of`
/// - `GET /api/v1/pins` - Map pins at the last observed event
/// - `GET /api/v1/viewport` - Configured map center and zoom
///
/// ### Inspection
/// - `GET /api/v1/identities/{id}` - Authoritative aggregate for an id
/// - `GET /api/v1/reservations/{reservation_id}` - Reservation lifecycle records
/// - `GET /api/v1/events/{kind}/{name}` - Records by event kind and name
/// - `GET /api/v1/users/{user_id}/events` - Records carrying a user id
/// - `GET /api/v1/stats` - Store counts and ingestion progress
pub fn router(state: AppState) -> Router {
    let public = Router::new().route("/health", get(health::health_check));

    let api_v1 = Router::new()
        // Snapshot
        .route("/snapshot", get(snapshot::snapshot))
        .route("/pins", get(snapshot::pins))
        .route("/viewport", get(snapshot::viewport))
        // Inspection
        .route("/identities/{id}", get(identities::get_identity))
        .route(
            "/reservations/{reservation_id}",
            get(identities::reservation_records),
        )
        .route("/events/{kind}/{name}", get(identities::event_records))
        .route("/users/{user_id}/events", get(identities::user_records))
        .route("/stats", get(stats::overview))
        // Auth middleware
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(middleware::map_response(add_cache_headers));

    Router::new()
        .merge(public)
        .nest("/api/v1", api_v1)
        .with_state(state)
}

/// Responses reflect live state; tell clients and proxies not to keep them.
async fn add_cache_headers(response: Response) -> Response {
    if response.status().is_success() {
        let (mut parts, body) = response.into_parts();
        parts
            .headers
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        Response::from_parts(parts, body)
    } else {
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SourceConfig, Viewport};
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use sightline_core::{GeoPoint, RecordDecoder};
    use sightline_ingest::{IdentityStore, LoopHandle};
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const TOKEN: &str = "test-token";

    fn config() -> Config {
        Config {
            bind_addr: "127.0.0.1:0".to_string(),
            api_tokens: HashSet::from([TOKEN.to_string()]),
            source: SourceConfig::Replay(PathBuf::from("capture.jsonl")),
            start_lag: Duration::from_secs(3600),
            session_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(1000),
            snapshot_interval: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            metrics_port: 0,
            viewport: Some(Viewport {
                center: GeoPoint { lat: 38.7, lng: -9.1 },
                zoom: 13.0,
            }),
        }
    }

    fn seeded_store() -> IdentityStore {
        let payloads = [
            r#"{"type":"track","event":"complete search","rudderId":"a1","timestamp":"2022-03-01T10:00:00Z","properties":{"lat":10,"lng":20}}"#,
            r#"{"type":"track","event":"complete search","rudderId":"a2","timestamp":"2022-03-01T10:00:05Z","properties":{"lat":30,"lng":40}}"#,
            r#"{"type":"identify","rudderId":"a2","userId":"u2","timestamp":"2022-03-01T10:00:06Z"}"#,
            r#"{"type":"track","event":"complete reservation request","rudderId":"a3","timestamp":"2022-03-01T10:00:07Z","properties":{"reservationId":"r1","lat":1,"lng":2},"context":{"traits":{"Latitude":50,"Longitude":60}}}"#,
        ];
        let mut decoder = RecordDecoder::new();
        let records = payloads
            .iter()
            .enumerate()
            .map(|(i, p)| Arc::new(decoder.decode(&(i + 1).to_string(), p.as_bytes(), None).unwrap()));

        let store = IdentityStore::new();
        store.apply_batch(records);
        store
    }

    fn app() -> Router {
        router(AppState::new(config(), seeded_store(), LoopHandle::default()))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .header("Authorization", format!("Bearer {TOKEN}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_requires_token() {
        let response = app()
            .oneshot(Request::builder().uri("/api/v1/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/stats")
                    .header("Authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_snapshot_defaults_to_last_timestamp() {
        let (status, body) = get_json(app(), "/api/v1/snapshot").await;
        assert_eq!(status, StatusCode::OK);

        let ids: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["id"].as_str().unwrap())
            .collect();
        // a3 holds a reservation and is located by its traits.
        assert_eq!(ids, vec!["a1", "u2", "a3"]);
        assert_eq!(body[1]["lat"], 30.0);
    }

    #[tokio::test]
    async fn test_snapshot_with_explicit_window() {
        let (status, body) = get_json(
            app(),
            "/api/v1/snapshot?as_of=2022-03-01T10:00:03Z&session_timeout_ms=1000",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        // a1 was last seen 3s before as_of, outside the 1s window.
        let ids: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["a3"]);
    }

    #[tokio::test]
    async fn test_snapshot_rejects_unrepresentable_window() {
        let (status, body) = get_json(
            app(),
            &format!("/api/v1/snapshot?session_timeout_ms={}", i64::MAX),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");

        let (status, _) = get_json(
            app(),
            &format!("/api/v1/snapshot?session_timeout_ms={}", u64::MAX),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_pins_with_oversized_configured_timeout() {
        let config = Config {
            session_timeout: Duration::from_secs(u64::MAX),
            ..config()
        };
        let app = router(AppState::new(config, seeded_store(), LoopHandle::default()));

        let (status, body) = get_json(app, "/api/v1/pins").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_pins_exclude_reservations() {
        let (status, body) = get_json(app(), "/api/v1/pins").await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["a1", "u2"]);
    }

    #[tokio::test]
    async fn test_identity_resolves_absorbed_id() {
        let (status, body) = get_json(app(), "/api/v1/identities/a2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["merged_into"], "u2");
        assert_eq!(body["members"], serde_json::json!(["a2"]));
        assert_eq!(body["aggregate"]["consolidated_id"], "u2");

        let (status, body) = get_json(app(), "/api/v1/identities/nobody").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_record_lookups() {
        let (status, body) = get_json(app(), "/api/v1/reservations/r1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (_, body) = get_json(app(), "/api/v1/events/track/complete%20search").await;
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (_, body) = get_json(app(), "/api/v1/users/u2/events").await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = get_json(app(), "/api/v1/events/page/home").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stats_and_viewport() {
        let (_, body) = get_json(app(), "/api/v1/stats").await;
        assert_eq!(body["identities"]["merged"], 1);
        assert_eq!(body["identities"]["standalone"], 2);
        assert_eq!(body["ingest"]["state"], "uninitialized");

        let (_, body) = get_json(app(), "/api/v1/viewport").await;
        assert_eq!(body["zoom"], 13.0);
        assert_eq!(body["center"]["lat"], 38.7);
    }
}
