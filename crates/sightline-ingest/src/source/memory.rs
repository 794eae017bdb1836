//! In-process partition.
//!
//! Records are appended by the owner and read back by position, with optional
//! failure injection for exercising the loop's backoff path. Clones share the
//! same partition, so a test can keep a handle while the loop owns another.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{Batch, Partition, PartitionRecord, Position};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct Inner {
    records: Vec<PartitionRecord>,
    failing_fetches: usize,
    resolve_fails: bool,
    fetches: usize,
}

/// An in-memory partition.
#[derive(Debug, Clone)]
pub struct MemoryPartition {
    inner: Arc<Mutex<Inner>>,
    batch_size: usize,
}

impl MemoryPartition {
    pub fn new(batch_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            batch_size: batch_size.max(1),
        }
    }

    /// Append a record.
    pub fn push(&self, sequence_number: impl Into<String>, data: impl Into<Vec<u8>>, arrival: Option<DateTime<Utc>>) {
        self.inner.lock().records.push(PartitionRecord {
            sequence_number: sequence_number.into(),
            data: data.into(),
            arrival,
        });
    }

    /// Make the next `n` fetches fail.
    pub fn fail_next_fetches(&self, n: usize) {
        self.inner.lock().failing_fetches = n;
    }

    /// Make every `resolve` call fail.
    pub fn fail_resolve(&self, fail: bool) {
        self.inner.lock().resolve_fails = fail;
    }

    /// Number of fetch attempts, failed ones included.
    pub fn fetch_count(&self) -> usize {
        self.inner.lock().fetches
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }
}

impl Default for MemoryPartition {
    fn default() -> Self {
        Self::new(100)
    }
}

impl Partition for MemoryPartition {
    fn name(&self) -> &str {
        "memory"
    }

    async fn resolve(&self, at: DateTime<Utc>) -> Result<Position> {
        let inner = self.inner.lock();
        if inner.resolve_fails {
            return Err(Error::Initialization("partition unavailable".to_string()));
        }
        let offset = inner
            .records
            .iter()
            .position(|r| r.arrival.is_none_or(|t| t >= at))
            .unwrap_or(inner.records.len());
        Ok(Position::new(offset.to_string()))
    }

    async fn fetch(&self, position: &Position) -> Result<Batch> {
        let mut inner = self.inner.lock();
        inner.fetches += 1;

        if inner.failing_fetches > 0 {
            inner.failing_fetches -= 1;
            return Err(Error::Fetch("injected failure".to_string()));
        }

        let start: usize = position
            .as_str()
            .parse()
            .map_err(|_| Error::Fetch(format!("invalid position '{position}'")))?;
        let start = start.min(inner.records.len());
        let end = (start + self.batch_size).min(inner.records.len());

        Ok(Batch {
            records: inner.records[start..end].to_vec(),
            next_position: Position::new(end.to_string()),
        })
    }
}
