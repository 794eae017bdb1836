//! JSONL partition adapter.
//!
//! Replays a captured stream from a JSONL file, one record payload per line.
//! Positions are zero-based line offsets and each record's sequence number is
//! its one-based line number, so a capture replays in file order.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sightline_core::decode_event;

use super::{Batch, Partition, PartitionRecord, Position};
use crate::{Error, Result};

/// Configuration for the JSONL partition.
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    /// Capture file path.
    pub input: PathBuf,

    /// Maximum records returned per fetch.
    pub batch_size: usize,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            batch_size: 500,
        }
    }
}

/// A JSONL capture replayed as a partition.
#[derive(Debug)]
pub struct JsonlPartition {
    config: JsonlConfig,
    lines: Vec<String>,
}

impl JsonlPartition {
    /// Load the capture named by `config.input`.
    pub fn open(config: JsonlConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".to_string()));
        }
        let contents = fs::read_to_string(&config.input).map_err(|e| {
            Error::Initialization(format!("cannot read {}: {e}", config.input.display()))
        })?;
        let lines: Vec<String> = contents.lines().map(str::to_string).collect();

        tracing::info!(
            path = %config.input.display(),
            lines = lines.len(),
            "loaded JSONL capture"
        );

        Ok(Self { config, lines })
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn offset(position: &Position) -> Result<usize> {
        position
            .as_str()
            .parse()
            .map_err(|_| Error::Fetch(format!("invalid JSONL position '{position}'")))
    }

    fn timestamp_of(line: &str) -> Option<DateTime<Utc>> {
        decode_event(line.as_bytes()).ok()?.timestamp
    }
}

impl Partition for JsonlPartition {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn resolve(&self, at: DateTime<Utc>) -> Result<Position> {
        let offset = self
            .lines
            .iter()
            .position(|line| Self::timestamp_of(line).is_none_or(|t| t >= at))
            .unwrap_or(self.lines.len());

        tracing::debug!(offset, "resolved JSONL start position");
        Ok(Position::new(offset.to_string()))
    }

    async fn fetch(&self, position: &Position) -> Result<Batch> {
        let start = Self::offset(position)?.min(self.lines.len());
        let end = (start + self.config.batch_size).min(self.lines.len());

        let records = self.lines[start..end]
            .iter()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| PartitionRecord {
                sequence_number: (start + i + 1).to_string(),
                data: line.as_bytes().to_vec(),
                arrival: None,
            })
            .collect();

        Ok(Batch {
            records,
            next_position: Position::new(end.to_string()),
        })
    }
}
