//! Record builders shared by the unit tests.

use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use sightline_core::{RawRecord, SequenceNumber, decode_event};

/// Base time for test events; `record(n, ..)` lands `n` seconds after it.
pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2022, 3, 1, 10, 0, 0).unwrap()
}

/// JSON payload for an event from `anonymous_id` at `at`. `fields` is spliced
/// into the object and must not repeat `rudderId` or `timestamp`.
pub(crate) fn payload(anonymous_id: &str, at: DateTime<Utc>, fields: &str) -> String {
    format!(
        r#"{{"rudderId":"{anonymous_id}","timestamp":"{}",{fields}}}"#,
        at.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

/// A record with sequence number `seq` timestamped `seq` seconds after [`t0`].
pub(crate) fn record(seq: u64, anonymous_id: &str, fields: &str) -> Arc<RawRecord> {
    let at = t0() + Duration::seconds(seq as i64);
    record_at(seq, anonymous_id, at, fields)
}

pub(crate) fn record_at(
    seq: u64,
    anonymous_id: &str,
    at: DateTime<Utc>,
    fields: &str,
) -> Arc<RawRecord> {
    record_json(seq, &payload(anonymous_id, at, fields))
}

/// A record decoded from a complete JSON payload.
pub(crate) fn record_json(seq: u64, json: &str) -> Arc<RawRecord> {
    Arc::new(RawRecord {
        sequence: SequenceNumber::from(seq),
        arrival: seq,
        received_at: None,
        event: decode_event(json.as_bytes()).unwrap(),
    })
}
