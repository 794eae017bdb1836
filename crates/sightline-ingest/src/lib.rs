//! Sightline ingestion and identity aggregation.
//!
//! This crate consumes a single ordered partition of analytics events and
//! maintains one derived [`Aggregate`] per identity, merging anonymous ids
//! into authenticated users as `identify` events link them.
//!
//! # Modules
//!
//! - [`source`] - Partition adapters (Kinesis, JSONL capture, in-memory)
//! - [`stream`] - The ingestion loop with retry and backoff
//! - [`store`] - The shared aggregate set and its read accessors
//! - [`index`], [`reduce`], [`merge`] - Record index, per-identity fold, identity merging
//! - [`snapshot`] - Time-windowed selection for display
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Partition    │  (Kinesis shard, JSONL capture)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  IngestionLoop  │  cursor + backoff, single writer
//! └────────┬────────┘
//!          │  RecordDecoder
//!          ▼
//! ┌─────────────────┐
//! │  IdentityStore  │  IdentityIndex → reduce → MergeEngine
//! └────────┬────────┘
//!          │  read lock
//!          ▼
//! ┌─────────────────┐
//! │    snapshot     │  readAsOf / pins for the renderer
//! └─────────────────┘
//! ```
//!
//! The index keeps every record, so any aggregate can be rebuilt from its raw
//! history when records arrive out of order or identities merge.

pub mod backoff;
pub mod error;
pub mod index;
pub mod merge;
pub mod reduce;
pub mod snapshot;
pub mod source;
pub mod store;
pub mod stream;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};

pub use backoff::{Backoff, BackoffConfig};
pub use index::{IdentityIndex, IndexStats};
pub use merge::{FoldOutcome, LinkOutcome, MergeEngine, MergedIdentity};
pub use reduce::{Aggregate, Reservation, SearchState, reduce, replay};
pub use snapshot::SnapshotEntry;
pub use store::{Applied, BatchStats, IdentityState, IdentityStore, StoreStats};
pub use stream::{
    BatchReport, Cursor, IngestConfig, IngestionLoop, LoopHandle, LoopState, LoopStatus,
    PollOutcome, PrimeReport,
};

pub use source::{
    Batch, JsonlConfig, JsonlPartition, KinesisConfig, KinesisPartition, MemoryPartition,
    Partition, PartitionRecord, Position,
};
