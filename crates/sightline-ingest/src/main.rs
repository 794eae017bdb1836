//! Sightline replay tool.
//!
//! Primes an identity store from a JSONL capture or a Kinesis stream and
//! prints the resulting snapshot as JSON on stdout.
//!
//! # Usage
//!
//! ```bash
//! # Replay a capture and print the snapshot at its last event
//! sightline-ingest --input capture.jsonl
//!
//! # Print map pins instead of the full snapshot
//! sightline-ingest --input capture.jsonl --pins --session-timeout-secs 600
//!
//! # Catch up on the last hour of a live stream
//! sightline-ingest --stream-name events --region eu-west-1 --start-lag-secs 3600
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::Parser;
use sightline_core::metrics::{init_metrics, start_metrics_server};
use sightline_ingest::{
    BackoffConfig, IdentityStore, IngestConfig, IngestionLoop, JsonlConfig, JsonlPartition,
    KinesisConfig, KinesisPartition, Partition,
};
use tracing_subscriber::EnvFilter;

/// Replay a sightline event capture and print the identity snapshot.
#[derive(Parser, Debug)]
#[command(name = "sightline-ingest")]
#[command(about = "Replay an event capture or stream into a snapshot")]
#[command(version)]
struct Args {
    /// JSONL capture to replay (one event payload per line)
    #[arg(long, short, conflicts_with = "stream_name")]
    input: Option<PathBuf>,

    /// Kinesis stream to read instead of a capture
    #[arg(long, env = "SIGHTLINE_STREAM_NAME")]
    stream_name: Option<String>,

    /// AWS region of the stream
    #[arg(long, env = "SIGHTLINE_STREAM_REGION", default_value = "us-east-1")]
    region: String,

    /// Static access key id (default AWS credential chain if unset)
    #[arg(long, env = "SIGHTLINE_STREAM_ACCESS_KEY_ID", hide_env_values = true)]
    access_key_id: Option<String>,

    /// Static secret access key
    #[arg(long, env = "SIGHTLINE_STREAM_SECRET_ACCESS_KEY", hide_env_values = true)]
    secret_access_key: Option<String>,

    /// Start reading at this RFC 3339 time (overrides --start-lag-secs)
    #[arg(long)]
    start: Option<DateTime<Utc>>,

    /// Start reading this many seconds before now (Kinesis only)
    #[arg(long, env = "SIGHTLINE_START_LAG_SECS", default_value = "86400")]
    start_lag_secs: u64,

    /// Snapshot time (defaults to the last event seen)
    #[arg(long)]
    as_of: Option<DateTime<Utc>>,

    /// Session timeout for the snapshot window
    #[arg(long, env = "SIGHTLINE_SESSION_TIMEOUT_SECS", default_value = "300")]
    session_timeout_secs: u64,

    /// Print map pins (searching, no reservation) instead of the full snapshot
    #[arg(long)]
    pins: bool,

    /// Records per fetch
    #[arg(long, default_value = "500")]
    batch_size: usize,

    /// Maximum backoff delay in milliseconds
    #[arg(long, env = "SIGHTLINE_MAX_BACKOFF_MS", default_value = "60000")]
    max_backoff_ms: u64,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "0")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("sightline_ingest=debug".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if args.metrics_port > 0 {
        let handle = init_metrics().context("Failed to install metrics recorder")?;
        start_metrics_server(args.metrics_port, handle)
            .await
            .context("Failed to start metrics server")?;
    }

    let config = IngestConfig {
        backoff: BackoffConfig {
            max_delay: Duration::from_millis(args.max_backoff_ms),
            ..Default::default()
        },
        ..Default::default()
    };

    let store = IdentityStore::new();

    if let Some(input) = &args.input {
        let partition = JsonlPartition::open(JsonlConfig {
            input: input.clone(),
            batch_size: args.batch_size,
        })?;
        let start = args.start.unwrap_or(DateTime::UNIX_EPOCH);
        prime(partition, store.clone(), config, start).await?;
    } else if let Some(stream_name) = &args.stream_name {
        let partition = KinesisPartition::connect(KinesisConfig {
            stream_name: stream_name.clone(),
            region: args.region.clone(),
            access_key_id: args.access_key_id.clone(),
            secret_access_key: args.secret_access_key.clone(),
            batch_limit: i32::try_from(args.batch_size).ok(),
        })
        .await?;
        let start = match args.start {
            Some(start) => start,
            None => Utc::now() - chrono::Duration::seconds(args.start_lag_secs as i64),
        };
        prime(partition, store.clone(), config, start).await?;
    } else {
        bail!("either --input or --stream-name is required");
    }

    let stats = store.stats();
    tracing::info!(
        records = stats.index.records,
        standalone = stats.standalone,
        merged = stats.merged,
        "replay finished"
    );

    let Some(as_of) = args.as_of.or(stats.last_timestamp) else {
        tracing::warn!("no events replayed, nothing to snapshot");
        println!("[]");
        return Ok(());
    };
    let timeout = chrono::Duration::seconds(args.session_timeout_secs as i64);

    let entries = if args.pins {
        store.pins(as_of, timeout)
    } else {
        store.read_as_of(as_of, timeout)
    };
    println!("{}", serde_json::to_string_pretty(&entries)?);

    Ok(())
}

async fn prime<P: Partition>(
    partition: P,
    store: IdentityStore,
    config: IngestConfig,
    start: DateTime<Utc>,
) -> Result<()> {
    let mut ingest = IngestionLoop::new(partition, store, config);
    ingest
        .initialize(start)
        .await
        .context("Failed to resolve the starting position")?;
    ingest.prime().await?;
    Ok(())
}
