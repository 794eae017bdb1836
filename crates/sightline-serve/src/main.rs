//! Sightline daemon.
//!
//! Primes the identity store from `now - start_lag`, then keeps polling the
//! partition while serving the HTTP API and refreshing the pins cache.
//!
//! # Graceful Shutdown
//!
//! On Ctrl+C the ingestion loop stops after its current poll cycle, the
//! snapshot refresher exits and the server drains in-flight requests.

use std::time::Duration;

use anyhow::Context;
use axum::http::Request;
use clap::Parser;
use sightline_core::metrics::{init_metrics, start_metrics_server};
use sightline_ingest::{
    BackoffConfig, IdentityStore, IngestConfig, IngestionLoop, JsonlConfig, JsonlPartition,
    KinesisPartition, LoopHandle, Partition,
};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use sightline_serve::{AppState, Config, PINS_KEY, SourceConfig, cache, compute_pins, router};

/// Sightline live identity map daemon.
#[derive(Parser, Debug)]
#[command(name = "sightline-serve")]
#[command(about = "Live identity aggregation daemon and HTTP API", long_about = None)]
struct Args {
    /// Path to .env file (optional).
    #[arg(long, env = "DOTENV_PATH", default_value = ".env")]
    dotenv: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if std::path::Path::new(&args.dotenv).exists() {
        dotenvy::from_path(&args.dotenv)?;
        eprintln!("Loaded environment from {}", args.dotenv);
    }

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sightline_ingest=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let bind_addr = config.bind_addr.clone();

    if config.metrics_port > 0 {
        let handle = init_metrics().context("Failed to install metrics recorder")?;
        start_metrics_server(config.metrics_port, handle)
            .await
            .context("Failed to start metrics server")?;
    }

    let ingest_config = IngestConfig {
        backoff: BackoffConfig {
            max_delay: config.max_backoff,
            ..Default::default()
        },
        poll_interval: config.poll_interval,
        ..Default::default()
    };
    let start = chrono::Utc::now()
        - chrono::Duration::from_std(config.start_lag).context("start lag out of range")?;

    let store = IdentityStore::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (ingest_handle, ingest_task) = match &config.source {
        SourceConfig::Kinesis(kinesis) => {
            let partition = KinesisPartition::connect(kinesis.clone()).await?;
            spawn_ingest(partition, store.clone(), ingest_config, start).await?
        }
        SourceConfig::Replay(path) => {
            let partition = JsonlPartition::open(JsonlConfig {
                input: path.clone(),
                ..Default::default()
            })?;
            spawn_ingest(partition, store.clone(), ingest_config, start).await?
        }
    };

    let state = AppState::new(config, store, ingest_handle.clone());
    let refresher = tokio::spawn(refresh_pins(state.clone(), shutdown_rx.clone()));

    let app = router(state)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                tracing::span!(
                    Level::INFO,
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                    query = request.uri().query().unwrap_or("")
                )
            }),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "starting server");

    let mut server_shutdown = shutdown_rx.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = server_shutdown.wait_for(|stop| *stop).await;
    });

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            return;
        }
        tracing::info!("Shutdown signal received, stopping gracefully...");
        ingest_handle.stop();
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    match ingest_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "ingestion loop failed"),
        Err(e) => tracing::error!(error = %e, "ingestion task panicked"),
    }
    refresher.await?;

    tracing::info!("shutdown complete");
    Ok(())
}

/// Resolve the start position, then prime and poll on a background task.
///
/// Initialization failures are returned here and abort startup.
async fn spawn_ingest<P>(
    partition: P,
    store: IdentityStore,
    config: IngestConfig,
    start: chrono::DateTime<chrono::Utc>,
) -> anyhow::Result<(
    LoopHandle,
    tokio::task::JoinHandle<sightline_ingest::Result<()>>,
)>
where
    P: Partition + 'static,
{
    let mut ingest = IngestionLoop::new(partition, store, config);
    ingest
        .initialize(start)
        .await
        .context("Failed to resolve the starting position")?;

    let handle = ingest.handle();
    let task = tokio::spawn(async move {
        ingest.prime().await?;
        ingest.run().await
    });
    Ok((handle, task))
}

/// Recompute the pins cache every snapshot interval until shutdown.
async fn refresh_pins(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(
        state.config.snapshot_interval.max(Duration::from_millis(1)),
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let pins = compute_pins(&state);
                if let Err(e) = cache::store(&state.cache, PINS_KEY, &pins).await {
                    tracing::warn!(error = %e, "failed to cache pins");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("pins refresher stopped");
}
