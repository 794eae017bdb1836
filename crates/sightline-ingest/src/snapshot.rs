//! Time-windowed selection of the identities worth displaying.
//!
//! An aggregate is selected when it holds any reservation, or when it has
//! searched and its activity overlaps the session window:
//! `first_seen < as_of` and `last_seen > as_of - session_timeout`.
//! Both bounds are strict. Results are ordered by `first_seen`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::reduce::Aggregate;

/// One display record for the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub lat: f64,
    pub lng: f64,
    pub id: String,
}

impl SnapshotEntry {
    /// Project an aggregate; `None` if it has no location to show.
    pub fn from_aggregate(aggregate: &Aggregate) -> Option<Self> {
        let point = aggregate.derived_point?;
        Some(Self {
            lat: point.lat,
            lng: point.lng,
            id: aggregate.consolidated_id.clone(),
        })
    }
}

/// Whether `aggregate` belongs in the snapshot at `as_of`.
///
/// A window reaching past the earliest representable instant starts there.
pub fn is_selected(aggregate: &Aggregate, as_of: DateTime<Utc>, session_timeout: Duration) -> bool {
    if aggregate.has_reservation() {
        return true;
    }
    let window_start = as_of
        .checked_sub_signed(session_timeout)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    aggregate.is_searching() && aggregate.first_seen < as_of && aggregate.last_seen > window_start
}

/// Select and order aggregates for `as_of`.
///
/// Ties on `first_seen` are broken by consolidated id so repeated queries over
/// the same state agree regardless of map iteration order.
pub fn select<'a, I>(aggregates: I, as_of: DateTime<Utc>, session_timeout: Duration) -> Vec<&'a Aggregate>
where
    I: IntoIterator<Item = &'a Aggregate>,
{
    let mut selected: Vec<&Aggregate> = aggregates
        .into_iter()
        .filter(|a| is_selected(a, as_of, session_timeout))
        .collect();
    selected.sort_by(|a, b| {
        a.first_seen
            .cmp(&b.first_seen)
            .then_with(|| a.consolidated_id.cmp(&b.consolidated_id))
    });
    selected
}

/// Display records for the selected aggregates that have a location.
pub fn entries<'a, I>(aggregates: I, as_of: DateTime<Utc>, session_timeout: Duration) -> Vec<SnapshotEntry>
where
    I: IntoIterator<Item = &'a Aggregate>,
{
    select(aggregates, as_of, session_timeout)
        .into_iter()
        .filter_map(SnapshotEntry::from_aggregate)
        .collect()
}

/// What the map shows: searching identities without a reservation.
pub fn pins<'a, I>(aggregates: I, as_of: DateTime<Utc>, session_timeout: Duration) -> Vec<SnapshotEntry>
where
    I: IntoIterator<Item = &'a Aggregate>,
{
    select(aggregates, as_of, session_timeout)
        .into_iter()
        .filter(|a| a.is_searching() && !a.has_reservation())
        .filter_map(SnapshotEntry::from_aggregate)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduce::reduce;
    use crate::test_support::{record_at, t0};

    fn searching(id: &str, first: DateTime<Utc>, last: DateTime<Utc>) -> Aggregate {
        let search = r#""type":"track","event":"complete search","properties":{"lat":1,"lng":2}"#;
        let agg = reduce(None, &record_at(1, id, first, search)).unwrap();
        reduce(Some(agg), &record_at(2, id, last, r#""type":"track","event":"scroll""#)).unwrap()
    }

    #[test]
    fn test_window_boundary_is_exclusive() {
        let timeout = Duration::milliseconds(300_000);
        let as_of = t0() + Duration::seconds(600);
        let boundary = as_of - timeout;

        let on_boundary = searching("edge", t0(), boundary);
        let just_inside = searching("inside", t0(), boundary + Duration::milliseconds(1));

        assert!(!is_selected(&on_boundary, as_of, timeout));
        assert!(is_selected(&just_inside, as_of, timeout));
    }

    #[test]
    fn test_oversized_timeout_opens_window_to_the_beginning() {
        let as_of = t0() + Duration::seconds(600);
        let agg = searching("a1", t0(), t0() + Duration::seconds(10));

        assert!(is_selected(&agg, as_of, Duration::MAX));
        assert_eq!(pins([&agg], as_of, Duration::MAX).len(), 1);
    }

    #[test]
    fn test_first_seen_must_precede_as_of() {
        let timeout = Duration::minutes(5);
        let agg = searching("a1", t0(), t0() + Duration::seconds(10));
        assert!(!is_selected(&agg, t0(), timeout));
        assert!(is_selected(&agg, t0() + Duration::seconds(11), timeout));
    }

    #[test]
    fn test_reservation_always_selected() {
        let agg = reduce(
            None,
            &record_at(
                1,
                "a1",
                t0(),
                r#""type":"track","event":"complete reservation request","properties":{"reservationId":"r1"}"#,
            ),
        )
        .unwrap();
        let far_future = t0() + Duration::days(30);
        assert!(is_selected(&agg, far_future, Duration::minutes(5)));
        // No location, so no display record.
        assert!(entries([&agg], far_future, Duration::minutes(5)).is_empty());
    }

    #[test]
    fn test_ordering_by_first_seen() {
        let as_of = t0() + Duration::seconds(100);
        let later = searching("b", t0() + Duration::seconds(20), t0() + Duration::seconds(90));
        let earlier = searching("a", t0() + Duration::seconds(10), t0() + Duration::seconds(80));
        let ids: Vec<_> = entries([&later, &earlier], as_of, Duration::minutes(5))
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_pins_exclude_reservations() {
        let as_of = t0() + Duration::seconds(100);
        let searcher = searching("a", t0(), t0() + Duration::seconds(90));
        let reserved = reduce(
            Some(searching("b", t0(), t0() + Duration::seconds(90))),
            &record_at(
                3,
                "b",
                t0() + Duration::seconds(95),
                r#""type":"track","event":"complete reservation request","properties":{"reservationId":"r1"}"#,
            ),
        )
        .unwrap();

        assert_eq!(entries([&searcher, &reserved], as_of, Duration::minutes(5)).len(), 2);
        let pins = pins([&searcher, &reserved], as_of, Duration::minutes(5));
        assert_eq!(pins.len(), 1);
        assert_eq!(pins[0].id, "a");
    }
}
