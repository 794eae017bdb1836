//! Daemon configuration loaded from the environment.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use sightline_core::GeoPoint;
use sightline_ingest::KinesisConfig;

/// Where the daemon reads records from.
#[derive(Debug, Clone)]
pub enum SourceConfig {
    Kinesis(KinesisConfig),
    /// Replay a JSONL capture instead of a live stream.
    Replay(PathBuf),
}

/// Map viewport handed through to the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Viewport {
    pub center: GeoPoint,
    pub zoom: f64,
}

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:8080").
    pub bind_addr: String,

    /// Valid API tokens (loaded from SIGHTLINE_API_TOKENS).
    pub api_tokens: HashSet<String>,

    pub source: SourceConfig,

    /// Priming starts this long before now.
    pub start_lag: Duration,

    /// Session window used for snapshots and pins.
    pub session_timeout: Duration,

    pub poll_interval: Duration,

    /// How often the pins cache is refreshed.
    pub snapshot_interval: Duration,

    pub max_backoff: Duration,

    /// Metrics server port (0 = disabled).
    pub metrics_port: u16,

    pub viewport: Option<Viewport>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required environment variables:
    /// - `SIGHTLINE_API_TOKENS`: Comma-separated list of valid API tokens
    /// - `SIGHTLINE_STREAM_NAME`: Kinesis stream (unless `SIGHTLINE_REPLAY_FILE` is set)
    ///
    /// Optional environment variables:
    /// - `SIGHTLINE_BIND_ADDR`: Server bind address (default: "0.0.0.0:8080")
    /// - `SIGHTLINE_STREAM_REGION`: AWS region (default: "us-east-1")
    /// - `SIGHTLINE_STREAM_ACCESS_KEY_ID` / `SIGHTLINE_STREAM_SECRET_ACCESS_KEY`
    /// - `SIGHTLINE_START_LAG_SECS` (default: 86400)
    /// - `SIGHTLINE_SESSION_TIMEOUT_SECS` (default: 300)
    /// - `SIGHTLINE_POLL_INTERVAL_MS` (default: 1000)
    /// - `SIGHTLINE_SNAPSHOT_INTERVAL_MS` (default: 500)
    /// - `SIGHTLINE_MAX_BACKOFF_MS` (default: 60000)
    /// - `SIGHTLINE_METRICS_PORT` (default: 0)
    /// - `SIGHTLINE_REPLAY_FILE`: JSONL capture to replay instead of Kinesis
    /// - `SIGHTLINE_MAP_CENTER_LAT` / `SIGHTLINE_MAP_CENTER_LNG` / `SIGHTLINE_MAP_ZOOM`
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let bind_addr = lookup("SIGHTLINE_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string());

        let tokens_str = lookup("SIGHTLINE_API_TOKENS")
            .ok_or_else(|| anyhow::anyhow!("SIGHTLINE_API_TOKENS environment variable is required"))?;

        let api_tokens: HashSet<String> = tokens_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if api_tokens.is_empty() {
            anyhow::bail!("SIGHTLINE_API_TOKENS must contain at least one token");
        }

        let source = match lookup("SIGHTLINE_REPLAY_FILE").filter(|s| !s.is_empty()) {
            Some(path) => SourceConfig::Replay(PathBuf::from(path)),
            None => {
                let stream_name = lookup("SIGHTLINE_STREAM_NAME")
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        anyhow::anyhow!("SIGHTLINE_STREAM_NAME environment variable is required")
                    })?;
                SourceConfig::Kinesis(KinesisConfig {
                    stream_name,
                    region: lookup("SIGHTLINE_STREAM_REGION")
                        .unwrap_or_else(|| "us-east-1".to_string()),
                    access_key_id: lookup("SIGHTLINE_STREAM_ACCESS_KEY_ID"),
                    secret_access_key: lookup("SIGHTLINE_STREAM_SECRET_ACCESS_KEY"),
                    batch_limit: None,
                })
            }
        };

        let start_lag = Duration::from_secs(parse_or(&lookup, "SIGHTLINE_START_LAG_SECS", 86_400)?);
        let session_timeout =
            Duration::from_secs(parse_or(&lookup, "SIGHTLINE_SESSION_TIMEOUT_SECS", 300)?);
        let poll_interval =
            Duration::from_millis(parse_or(&lookup, "SIGHTLINE_POLL_INTERVAL_MS", 1000)?);
        let snapshot_interval =
            Duration::from_millis(parse_or(&lookup, "SIGHTLINE_SNAPSHOT_INTERVAL_MS", 500)?);
        let max_backoff = Duration::from_millis(parse_or(&lookup, "SIGHTLINE_MAX_BACKOFF_MS", 60_000)?);
        let metrics_port = parse_or(&lookup, "SIGHTLINE_METRICS_PORT", 0)?;

        if poll_interval.is_zero() || snapshot_interval.is_zero() {
            anyhow::bail!("poll and snapshot intervals must be positive");
        }

        let viewport = match (
            parse_opt::<f64>(&lookup, "SIGHTLINE_MAP_CENTER_LAT")?,
            parse_opt::<f64>(&lookup, "SIGHTLINE_MAP_CENTER_LNG")?,
        ) {
            (Some(lat), Some(lng)) => Some(Viewport {
                center: GeoPoint { lat, lng },
                zoom: parse_or(&lookup, "SIGHTLINE_MAP_ZOOM", 12.0)?,
            }),
            _ => None,
        };

        let config = Self {
            bind_addr,
            api_tokens,
            source,
            start_lag,
            session_timeout,
            poll_interval,
            snapshot_interval,
            max_backoff,
            metrics_port,
            viewport,
        };

        tracing::info!(
            bind_addr = %config.bind_addr,
            source = ?config.source_name(),
            token_count = config.api_tokens.len(),
            start_lag_secs = config.start_lag.as_secs(),
            session_timeout_secs = config.session_timeout.as_secs(),
            "configuration loaded"
        );

        Ok(config)
    }

    fn source_name(&self) -> &str {
        match &self.source {
            SourceConfig::Kinesis(kinesis) => &kinesis.stream_name,
            SourceConfig::Replay(_) => "replay",
        }
    }

    pub fn session_timeout_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.session_timeout).unwrap_or(chrono::Duration::MAX)
    }
}

fn parse_opt<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .filter(|s| !s.trim().is_empty())
        .map(|raw| raw.trim().parse::<T>().with_context(|| format!("invalid {key}: '{raw}'")))
        .transpose()
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[
            ("SIGHTLINE_API_TOKENS", "abc, def ,"),
            ("SIGHTLINE_STREAM_NAME", "events"),
        ])
        .unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.api_tokens.len(), 2);
        assert!(config.api_tokens.contains("def"));
        assert_eq!(config.start_lag, Duration::from_secs(86_400));
        assert_eq!(config.session_timeout, Duration::from_secs(300));
        assert_eq!(config.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.snapshot_interval, Duration::from_millis(500));
        assert_eq!(config.max_backoff, Duration::from_secs(60));
        assert_eq!(config.metrics_port, 0);
        assert!(config.viewport.is_none());

        let SourceConfig::Kinesis(kinesis) = &config.source else {
            panic!("expected a Kinesis source");
        };
        assert_eq!(kinesis.stream_name, "events");
        assert_eq!(kinesis.region, "us-east-1");
        assert!(kinesis.access_key_id.is_none());
    }

    #[test]
    fn test_missing_tokens_or_stream() {
        assert!(load(&[("SIGHTLINE_STREAM_NAME", "events")]).is_err());
        assert!(load(&[("SIGHTLINE_API_TOKENS", " , "), ("SIGHTLINE_STREAM_NAME", "events")]).is_err());
        assert!(load(&[("SIGHTLINE_API_TOKENS", "abc")]).is_err());
    }

    #[test]
    fn test_replay_file_replaces_stream() {
        let config = load(&[
            ("SIGHTLINE_API_TOKENS", "abc"),
            ("SIGHTLINE_REPLAY_FILE", "/data/capture.jsonl"),
        ])
        .unwrap();
        assert!(matches!(config.source, SourceConfig::Replay(ref p) if p == &PathBuf::from("/data/capture.jsonl")));
    }

    #[test]
    fn test_viewport_and_overrides() {
        let config = load(&[
            ("SIGHTLINE_API_TOKENS", "abc"),
            ("SIGHTLINE_STREAM_NAME", "events"),
            ("SIGHTLINE_SESSION_TIMEOUT_SECS", "600"),
            ("SIGHTLINE_MAP_CENTER_LAT", "38.72"),
            ("SIGHTLINE_MAP_CENTER_LNG", "-9.14"),
        ])
        .unwrap();
        assert_eq!(config.session_timeout_chrono(), chrono::Duration::seconds(600));
        assert_eq!(
            config.viewport,
            Some(Viewport {
                center: GeoPoint { lat: 38.72, lng: -9.14 },
                zoom: 12.0,
            })
        );
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let err = load(&[
            ("SIGHTLINE_API_TOKENS", "abc"),
            ("SIGHTLINE_STREAM_NAME", "events"),
            ("SIGHTLINE_POLL_INTERVAL_MS", "soon"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("SIGHTLINE_POLL_INTERVAL_MS"));
    }
}
