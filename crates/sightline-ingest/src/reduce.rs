//! The per-identity fold.
//!
//! [`reduce`] is a pure function from the current [`Aggregate`] (or nothing)
//! and the next record to the new aggregate. All aggregates, standalone or
//! merged, are built by it, so replaying a history in sequence order always
//! reproduces the same state.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sightline_core::{
    GeoPoint, LATITUDE_TRAIT, LONGITUDE_TRAIT, RESERVATION_APPROVED, RESERVATION_REQUESTED,
    RawRecord, Result, SEARCH_COMPLETED, SequenceNumber,
};

/// Search activity seen for an identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchState {
    pub last_search_point: GeoPoint,
    pub search_path: Vec<GeoPoint>,
}

/// Lifecycle timestamps of a single reservation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub request_time: Option<DateTime<Utc>>,
    pub approval_time: Option<DateTime<Utc>>,
}

/// Derived state for one identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregate {
    /// Anonymous id of the most recently folded record.
    pub anonymous_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub event_count: u64,
    /// Every record folded into this aggregate, in fold order.
    #[serde(skip)]
    pub debug_trail: Vec<Arc<RawRecord>>,
    /// Names of the folded events, in fold order.
    pub event_names: Vec<String>,
    /// Sequence number of the most recently folded record.
    pub last_sequence: SequenceNumber,
    pub linked_user_id: Option<String>,
    pub search: Option<SearchState>,
    pub reservations: BTreeMap<String, Reservation>,
    pub traits: Map<String, Value>,
    pub derived_point: Option<GeoPoint>,
    pub consolidated_id: String,
}

impl Aggregate {
    fn empty(record: &RawRecord, timestamp: DateTime<Utc>) -> Self {
        Self {
            anonymous_id: record.event.anonymous_id.clone(),
            first_seen: timestamp,
            last_seen: timestamp,
            event_count: 0,
            debug_trail: Vec::new(),
            event_names: Vec::new(),
            last_sequence: record.sequence.clone(),
            linked_user_id: None,
            search: None,
            reservations: BTreeMap::new(),
            traits: Map::new(),
            derived_point: None,
            consolidated_id: record.event.anonymous_id.clone(),
        }
    }

    pub fn is_searching(&self) -> bool {
        self.search.is_some()
    }

    pub fn has_reservation(&self) -> bool {
        !self.reservations.is_empty()
    }

    /// Whether folding `record` next would keep the fold in sequence order.
    pub fn accepts_in_order(&self, record: &RawRecord) -> bool {
        record.sequence > self.last_sequence
    }

    fn trait_point(&self) -> Option<GeoPoint> {
        GeoPoint::from_values(
            self.traits.get(LATITUDE_TRAIT),
            self.traits.get(LONGITUDE_TRAIT),
        )
    }
}

/// Fold one record into an aggregate, starting a new one from `None`.
///
/// Fails with `MalformedEvent` if the record has no timestamp.
pub fn reduce(prev: Option<Aggregate>, record: &Arc<RawRecord>) -> Result<Aggregate> {
    let timestamp = record.event.timestamp()?;
    let mut agg = prev.unwrap_or_else(|| Aggregate::empty(record, timestamp));
    agg.fold(record, timestamp);
    Ok(agg)
}

impl Aggregate {
    /// In-place form of [`reduce`]. Leaves the aggregate untouched on error.
    pub fn apply(&mut self, record: &Arc<RawRecord>) -> Result<()> {
        let timestamp = record.event.timestamp()?;
        self.fold(record, timestamp);
        Ok(())
    }

    fn fold(&mut self, record: &Arc<RawRecord>, timestamp: DateTime<Utc>) {
        let event = &record.event;

        self.last_seen = timestamp;
        self.anonymous_id = event.anonymous_id.clone();
        self.event_count += 1;
        self.debug_trail.push(Arc::clone(record));
        self.event_names.push(event.display_name().to_string());
        self.last_sequence = record.sequence.clone();

        if let Some(user_id) = &event.user_id {
            self.linked_user_id = Some(user_id.clone());
        }

        if event.is_named(SEARCH_COMPLETED) {
            if let Some(point) = event.search_point() {
                match self.search.as_mut() {
                    Some(search) => {
                        search.last_search_point = point;
                        search.search_path.push(point);
                    }
                    None => {
                        self.search = Some(SearchState {
                            last_search_point: point,
                            search_path: vec![point],
                        });
                    }
                }
            } else {
                tracing::debug!(
                    sequence = %record.sequence,
                    "search event without coordinates, folding generically"
                );
            }
        }

        if let Some(reservation_id) = event.reservation_id() {
            let reservation = self.reservations.entry(reservation_id).or_default();
            if event.is_named(RESERVATION_REQUESTED) {
                reservation.request_time = Some(timestamp);
            }
            if event.is_named(RESERVATION_APPROVED) {
                reservation.approval_time = Some(timestamp);
            }
        }

        self.traits
            .extend(event.traits.iter().map(|(k, v)| (k.clone(), v.clone())));

        self.derived_point = match &self.search {
            Some(search) => Some(search.last_search_point),
            None => self.trait_point(),
        };
        self.consolidated_id = self
            .linked_user_id
            .clone()
            .unwrap_or_else(|| self.anonymous_id.clone());
    }
}

/// Rebuild an aggregate from scratch by folding `records` in sequence order.
///
/// Records that fail to fold are skipped. Returns `None` if nothing folded.
pub fn replay<'a, I>(records: I) -> Option<Aggregate>
where
    I: IntoIterator<Item = &'a Arc<RawRecord>>,
{
    let mut ordered: Vec<&Arc<RawRecord>> = records.into_iter().collect();
    ordered.sort_by(|a, b| a.replay_cmp(b));

    let mut agg: Option<Aggregate> = None;
    for record in ordered {
        let folded = match agg.as_mut() {
            Some(current) => current.apply(record),
            None => reduce(None, record).map(|first| agg = Some(first)),
        };
        if let Err(e) = folded {
            tracing::warn!(sequence = %record.sequence, error = %e, "skipping record during replay");
        }
    }
    agg
}
