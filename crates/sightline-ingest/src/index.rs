//! In-memory record index keyed by identity.
//!
//! The [`IdentityIndex`] keeps every accepted record, in arrival order, under
//! the anonymous id that produced it. This history is what merges replay from.
//! Secondary append-only multimaps index the same records by event name,
//! authenticated user id and reservation id for inspection.
//!
//! Sequence numbers double as the dedupe key: a record re-delivered by the
//! partition is recognised and ignored.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use sightline_core::{EventKind, RawRecord, SequenceNumber};

/// Append-only record index.
#[derive(Debug, Default)]
pub struct IdentityIndex {
    seen: HashSet<SequenceNumber>,
    by_anonymous_id: HashMap<String, Vec<Arc<RawRecord>>>,
    by_event: HashMap<(EventKind, String), Vec<Arc<RawRecord>>>,
    by_user_id: HashMap<String, Vec<Arc<RawRecord>>>,
    by_reservation: HashMap<String, Vec<Arc<RawRecord>>>,
}

impl IdentityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a sequence number has not been indexed yet.
    pub fn is_new(&self, sequence: &SequenceNumber) -> bool {
        !self.seen.contains(sequence)
    }

    /// Index a record.
    ///
    /// Returns `true` if the record is new, `false` if its sequence number was
    /// already indexed (in which case nothing changes).
    pub fn append(&mut self, record: Arc<RawRecord>) -> bool {
        if !self.seen.insert(record.sequence.clone()) {
            return false;
        }

        let event = &record.event;
        push(
            &mut self.by_event,
            (event.kind, event.display_name().to_string()),
            &record,
        );
        if let Some(user_id) = &event.user_id {
            push(&mut self.by_user_id, user_id.clone(), &record);
        }
        if let Some(reservation_id) = event.reservation_id() {
            push(&mut self.by_reservation, reservation_id, &record);
        }
        push(
            &mut self.by_anonymous_id,
            event.anonymous_id.clone(),
            &record,
        );
        true
    }

    /// Full history for an anonymous id, in arrival order.
    pub fn records_for(&self, anonymous_id: &str) -> &[Arc<RawRecord>] {
        lookup(&self.by_anonymous_id, anonymous_id)
    }

    /// Records of the given kind and name. Unnamed events are indexed under
    /// their kind (`"identify"`, `"track"`).
    pub fn records_for_event(&self, kind: EventKind, name: &str) -> &[Arc<RawRecord>] {
        self.by_event
            .get(&(kind, name.to_string()))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Records carrying the given authenticated user id.
    pub fn records_for_user(&self, user_id: &str) -> &[Arc<RawRecord>] {
        lookup(&self.by_user_id, user_id)
    }

    /// Lifecycle records for a reservation.
    pub fn records_for_reservation(&self, reservation_id: &str) -> &[Arc<RawRecord>] {
        lookup(&self.by_reservation, reservation_id)
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            records: self.seen.len(),
            anonymous_ids: self.by_anonymous_id.len(),
            user_ids: self.by_user_id.len(),
            reservations: self.by_reservation.len(),
        }
    }
}

fn push<K: Eq + Hash>(map: &mut HashMap<K, Vec<Arc<RawRecord>>>, key: K, record: &Arc<RawRecord>) {
    map.entry(key).or_default().push(Arc::clone(record));
}

fn lookup<'a>(map: &'a HashMap<String, Vec<Arc<RawRecord>>>, key: &str) -> &'a [Arc<RawRecord>] {
    map.get(key).map(Vec::as_slice).unwrap_or_default()
}

/// Counts describing the index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct IndexStats {
    pub records: usize,
    pub anonymous_ids: usize,
    pub user_ids: usize,
    pub reservations: usize,
}
