//! Prometheus metrics helpers for sightline.
//!
//! # Usage
//!
//! ```rust,ignore
//! use sightline_core::metrics::{init_metrics, start_metrics_server};
//!
//! let handle = init_metrics()?;
//! start_metrics_server(9091, handle).await?;
//!
//! metrics::counter!("ingest_records_total").increment(1);
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component (`ingest_`, `merge_`, `snapshot_`)
//! - Suffix: unit or type (`_total`, `_ms`)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Fails if a recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_common_metrics();
    Ok(handle)
}

/// Serve `/metrics` on the given port from a background task.
///
/// The listener is bound before returning so port conflicts surface here.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server stopped");
        }
    });

    Ok(())
}

/// Register descriptions for the metrics recorded across sightline.
fn register_common_metrics() {
    // =========================================================================
    // Ingestion
    // =========================================================================

    describe_counter!(
        "ingest_records_total",
        "Total records fetched from the partition"
    );
    describe_counter!(
        "ingest_records_applied_total",
        "Records folded into an aggregate"
    );
    describe_counter!(
        "ingest_records_duplicate_total",
        "Re-delivered records ignored by sequence number"
    );
    describe_counter!(
        "ingest_records_dropped_total",
        "Records dropped as undecodable or malformed (label: reason)"
    );
    describe_counter!("ingest_fetch_errors_total", "Failed partition fetches");
    describe_gauge!("ingest_backoff_delay_ms", "Current fetch backoff delay");
    describe_histogram!(
        "ingest_batch_size",
        "Number of records per fetched batch"
    );
    describe_gauge!(
        "ingest_millis_behind_latest",
        "How far the shard iterator trails the stream tip"
    );

    // =========================================================================
    // Identity aggregation
    // =========================================================================

    describe_counter!(
        "merge_replays_total",
        "Full replays of a combined identity history"
    );
    describe_counter!(
        "merge_identities_linked_total",
        "Anonymous ids absorbed into an authenticated identity"
    );
    describe_gauge!("identities_standalone", "Standalone anonymous aggregates");
    describe_gauge!("identities_merged", "Authenticated merged identities");

    // =========================================================================
    // Snapshot queries
    // =========================================================================

    describe_counter!("snapshot_queries_total", "Snapshot queries served");
    describe_gauge!(
        "snapshot_entries",
        "Entries returned by the most recent snapshot"
    );
}
