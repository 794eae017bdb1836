//! The live aggregate set.
//!
//! [`IdentityState`] holds the record index, the standalone aggregates and the
//! merge engine, and routes each record to the one aggregate that owns it.
//! [`IdentityStore`] shares that state between the single ingestion writer and
//! any number of readers. The writer applies a whole batch under one write
//! lock; readers copy what they need under a read lock, so a reader never sees
//! an aggregate halfway through a fold or a batch halfway applied.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use sightline_core::{EventKind, RawRecord};

use crate::index::{IdentityIndex, IndexStats};
use crate::merge::{FoldOutcome, LinkOutcome, MergeEngine, MergedIdentity};
use crate::reduce::{self, Aggregate};
use crate::snapshot::{self, SnapshotEntry};

/// What happened to one applied record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Folded onto the end of its aggregate.
    Folded,
    /// Arrived out of sequence order; its aggregate was rebuilt.
    Replayed,
    /// Linked its anonymous id to an authenticated identity.
    Linked(LinkOutcome),
    /// Already indexed under the same sequence number; ignored.
    Duplicate,
}

impl From<FoldOutcome> for Applied {
    fn from(outcome: FoldOutcome) -> Self {
        match outcome {
            FoldOutcome::Incremental => Self::Folded,
            FoldOutcome::Replayed => Self::Replayed,
        }
    }
}

/// Single-writer identity state.
#[derive(Debug, Default)]
pub struct IdentityState {
    index: IdentityIndex,
    standalone: HashMap<String, Aggregate>,
    merge: MergeEngine,
    last_timestamp: Option<DateTime<Utc>>,
}

impl IdentityState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one record into the index and its owning aggregate.
    ///
    /// Records without a timestamp are rejected before anything is touched.
    pub fn apply(&mut self, record: Arc<RawRecord>) -> sightline_core::Result<Applied> {
        let timestamp = record.event.timestamp()?;

        if !self.index.append(Arc::clone(&record)) {
            return Ok(Applied::Duplicate);
        }
        self.last_timestamp = Some(
            self.last_timestamp
                .map_or(timestamp, |last| last.max(timestamp)),
        );

        let event = &record.event;
        let anonymous_id = event.anonymous_id.as_str();

        if event.is_identity_link() {
            if let Some(user_id) = event.user_id.as_deref() {
                if self.merge.owner_of(anonymous_id) != Some(user_id) {
                    let outcome =
                        self.merge
                            .link(user_id, anonymous_id, self.index.records_for(anonymous_id));
                    self.standalone.remove(anonymous_id);
                    return Ok(Applied::Linked(outcome));
                }
            }
        }

        if let Some(folded) = self.merge.fold_member(&record) {
            return folded.map(Applied::from);
        }

        match self.standalone.get_mut(anonymous_id) {
            Some(aggregate) if aggregate.accepts_in_order(&record) => {
                aggregate.apply(&record)?;
                Ok(Applied::Folded)
            }
            Some(aggregate) => {
                if let Some(rebuilt) = reduce::replay(self.index.records_for(anonymous_id)) {
                    *aggregate = rebuilt;
                }
                Ok(Applied::Replayed)
            }
            None => {
                let aggregate = reduce::reduce(None, &record)?;
                self.standalone.insert(anonymous_id.to_string(), aggregate);
                Ok(Applied::Folded)
            }
        }
    }

    /// Every authoritative aggregate: standalone ones not yet absorbed, then
    /// the combined aggregate of every merged identity.
    pub fn aggregates(&self) -> impl Iterator<Item = &Aggregate> {
        self.standalone
            .iter()
            .filter(|(id, _)| !self.merge.is_absorbed(id))
            .map(|(_, aggregate)| aggregate)
            .chain(self.merge.identities().map(|identity| &identity.aggregate))
    }

    /// The aggregate that is authoritative for `id`.
    ///
    /// `id` may be an anonymous id (absorbed ids resolve to their merged
    /// identity) or an authenticated user id. A user id shadows a standalone
    /// anonymous id with the same value.
    pub fn aggregate_for(&self, id: &str) -> Option<&Aggregate> {
        let user_id = self.merge.owner_of(id).unwrap_or(id);
        self.merge
            .get(user_id)
            .map(|identity| &identity.aggregate)
            .or_else(|| self.standalone.get(id))
    }

    pub fn merged_identity(&self, user_id: &str) -> Option<&MergedIdentity> {
        self.merge.get(user_id)
    }

    /// The merged identity `id` belongs to, as a member or as its user id.
    pub fn merged_identity_for(&self, id: &str) -> Option<&MergedIdentity> {
        self.merge
            .owner_of(id)
            .and_then(|owner| self.merge.get(owner))
            .or_else(|| self.merge.get(id))
    }

    pub fn index(&self) -> &IdentityIndex {
        &self.index
    }

    /// Timestamp of the latest event applied so far.
    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_timestamp
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            standalone: self
                .standalone
                .keys()
                .filter(|id| !self.merge.is_absorbed(id))
                .count(),
            merged: self.merge.len(),
            index: self.index.stats(),
            last_timestamp: self.last_timestamp,
        }
    }
}

/// Counts from one applied batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub applied: usize,
    pub duplicates: usize,
    pub dropped: usize,
    pub linked: usize,
    pub replayed: usize,
}

/// Counts describing the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub standalone: usize,
    pub merged: usize,
    pub index: IndexStats,
    pub last_timestamp: Option<DateTime<Utc>>,
}

/// Shared handle to the identity state.
///
/// Cloning is cheap; all clones see the same state.
#[derive(Debug, Clone, Default)]
pub struct IdentityStore {
    inner: Arc<RwLock<IdentityState>>,
}

impl IdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a batch of records atomically with respect to readers.
    ///
    /// Malformed records are logged and dropped; they never abort the batch.
    pub fn apply_batch<I>(&self, records: I) -> BatchStats
    where
        I: IntoIterator<Item = Arc<RawRecord>>,
    {
        let mut stats = BatchStats::default();
        let mut state = self.inner.write();

        for record in records {
            let sequence = record.sequence.clone();
            match state.apply(record) {
                Ok(Applied::Duplicate) => stats.duplicates += 1,
                Ok(applied) => {
                    stats.applied += 1;
                    match applied {
                        Applied::Linked(_) => stats.linked += 1,
                        Applied::Replayed => stats.replayed += 1,
                        _ => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(sequence = %sequence, error = %e, "dropping record from fold");
                    stats.dropped += 1;
                }
            }
        }

        let current = state.stats();
        drop(state);

        metrics::counter!("ingest_records_applied_total").increment(stats.applied as u64);
        metrics::counter!("ingest_records_duplicate_total").increment(stats.duplicates as u64);
        metrics::counter!("ingest_records_dropped_total", "reason" => "malformed")
            .increment(stats.dropped as u64);
        metrics::gauge!("identities_standalone").set(current.standalone as f64);
        metrics::gauge!("identities_merged").set(current.merged as f64);

        stats
    }

    /// Run `f` against a consistent view of the state.
    pub fn read<R>(&self, f: impl FnOnce(&IdentityState) -> R) -> R {
        f(&self.inner.read())
    }

    /// Display records for the identities relevant at `as_of`.
    pub fn read_as_of(&self, as_of: DateTime<Utc>, session_timeout: Duration) -> Vec<SnapshotEntry> {
        let entries = self.read(|state| snapshot::entries(state.aggregates(), as_of, session_timeout));
        metrics::counter!("snapshot_queries_total").increment(1);
        metrics::gauge!("snapshot_entries").set(entries.len() as f64);
        entries
    }

    /// Map pins: searching identities without a reservation.
    pub fn pins(&self, as_of: DateTime<Utc>, session_timeout: Duration) -> Vec<SnapshotEntry> {
        self.read(|state| snapshot::pins(state.aggregates(), as_of, session_timeout))
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.read(IdentityState::last_timestamp)
    }

    pub fn aggregate_for(&self, id: &str) -> Option<Aggregate> {
        self.read(|state| state.aggregate_for(id).cloned())
    }

    pub fn merged_identity(&self, user_id: &str) -> Option<MergedIdentity> {
        self.read(|state| state.merged_identity(user_id).cloned())
    }

    pub fn records_for(&self, anonymous_id: &str) -> Vec<Arc<RawRecord>> {
        self.read(|state| state.index().records_for(anonymous_id).to_vec())
    }

    pub fn records_for_event(&self, kind: EventKind, name: &str) -> Vec<Arc<RawRecord>> {
        self.read(|state| state.index().records_for_event(kind, name).to_vec())
    }

    pub fn records_for_user(&self, user_id: &str) -> Vec<Arc<RawRecord>> {
        self.read(|state| state.index().records_for_user(user_id).to_vec())
    }

    pub fn records_for_reservation(&self, reservation_id: &str) -> Vec<Arc<RawRecord>> {
        self.read(|state| state.index().records_for_reservation(reservation_id).to_vec())
    }

    pub fn stats(&self) -> StoreStats {
        self.read(IdentityState::stats)
    }
}
