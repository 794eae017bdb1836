//! Partition adapters.
//!
//! The ingestion loop consumes exactly one ordered partition. Each adapter
//! resolves a starting [`Position`] from a timestamp and then fetches batches,
//! every batch carrying the position to fetch from next.
//!
//! # Available Partitions
//!
//! - [`KinesisPartition`] - The first shard of an AWS Kinesis stream
//! - [`JsonlPartition`] - Replays a JSONL capture, one record per line
//! - [`MemoryPartition`] - In-process partition with failure injection

mod jsonl;
mod kinesis;
mod memory;

use std::fmt;
use std::future::Future;

use chrono::{DateTime, Utc};

pub use jsonl::{JsonlConfig, JsonlPartition};
pub use kinesis::{KinesisConfig, KinesisPartition};
pub use memory::MemoryPartition;

use crate::Result;

/// An opaque position within a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position(String);

impl Position {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A record as delivered by the partition, before decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionRecord {
    /// Partition-assigned decimal sequence number.
    pub sequence_number: String,
    pub data: Vec<u8>,
    /// Approximate time the partition accepted the record, if known.
    pub arrival: Option<DateTime<Utc>>,
}

/// One fetched batch and the position that follows it.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub records: Vec<PartitionRecord>,
    pub next_position: Position,
}

/// A single ordered partition.
///
/// `fetch` is expected to fail with [`Error::Fetch`](crate::Error::Fetch) on
/// transient upstream problems; the loop retries those from the same position.
pub trait Partition: Send + Sync {
    /// Human-readable name for this partition (used in logs).
    fn name(&self) -> &str;

    /// Resolve the position of the first record at or after `at`.
    fn resolve(&self, at: DateTime<Utc>) -> impl Future<Output = Result<Position>> + Send;

    /// Fetch the batch starting at `position`.
    fn fetch(&self, position: &Position) -> impl Future<Output = Result<Batch>> + Send;
}
