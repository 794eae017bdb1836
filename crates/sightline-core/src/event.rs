//! The decoded event model and the record decoder.
//!
//! Partition records carry a JSON payload in the analytics pipeline's wire
//! shape:
//!
//! ```text
//! { "type": "track" | "identify", "event"?: string, "rudderId": string,
//!   "userId"?: string, "timestamp": ISO-8601, "properties"?: {...},
//!   "context"?: { "traits"?: {...} } }
//! ```
//!
//! Decoding validates the shape once, so everything downstream works with the
//! typed [`Event`] instead of poking at loose JSON.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Event name emitted when a user finishes a location search.
pub const SEARCH_COMPLETED: &str = "complete search";

/// Event name emitted when a reservation request is submitted.
pub const RESERVATION_REQUESTED: &str = "complete reservation request";

/// Event name emitted when a reservation request is approved.
pub const RESERVATION_APPROVED: &str = "receive reservation request approve";

/// Trait keys used as a fallback location when no search has been seen.
pub const LATITUDE_TRAIT: &str = "Latitude";
pub const LONGITUDE_TRAIT: &str = "Longitude";

/// The two record shapes the pipeline emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Track,
    Identify,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Track => "track",
            Self::Identify => "identify",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "track" => Ok(Self::Track),
            "identify" => Ok(Self::Identify),
            other => Err(format!("unknown event kind '{other}'")),
        }
    }
}

/// A partition-assigned sequence number.
///
/// Kinesis sequence numbers are decimal strings far wider than `u128`, so they
/// are kept as normalized digit strings and ordered numerically (shorter is
/// smaller, equal lengths compare lexically).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SequenceNumber(String);

impl SequenceNumber {
    /// Parse a decimal sequence number.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidSequence(raw.to_string()));
        }
        let trimmed = raw.trim_start_matches('0');
        if trimmed.is_empty() {
            Ok(Self("0".to_string()))
        } else {
            Ok(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for SequenceNumber {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A latitude/longitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    /// Build a point from two loosely-typed JSON values.
    ///
    /// Numbers are taken as-is; numeric strings are parsed since trait payloads
    /// sometimes carry coordinates as text.
    pub fn from_values(lat: Option<&Value>, lng: Option<&Value>) -> Option<Self> {
        Some(Self {
            lat: coordinate(lat?)?,
            lng: coordinate(lng?)?,
        })
    }
}

fn coordinate(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A decoded, validated event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub kind: EventKind,
    /// For `track` events, the event name.
    pub name: Option<String>,
    pub anonymous_id: String,
    pub user_id: Option<String>,
    /// `None` when the payload had no timestamp or an unparseable one; the
    /// reducer rejects such events.
    pub timestamp: Option<DateTime<Utc>>,
    pub properties: Map<String, Value>,
    /// Context traits, overlaid with the properties of `identify` events.
    pub traits: Map<String, Value>,
}

impl Event {
    /// The event timestamp, or [`Error::MalformedEvent`] if it is missing.
    pub fn timestamp(&self) -> Result<DateTime<Utc>> {
        self.timestamp
            .ok_or(Error::MalformedEvent { field: "timestamp" })
    }

    /// The event name, falling back to the kind for unnamed events.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.kind.as_str())
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.name.as_deref() == Some(name)
    }

    /// The reservation this event belongs to, if any.
    ///
    /// Numeric ids are rendered as strings so both forms index the same entry.
    pub fn reservation_id(&self) -> Option<String> {
        match self.properties.get("reservationId")? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// The searched location carried in the properties.
    pub fn search_point(&self) -> Option<GeoPoint> {
        GeoPoint::from_values(self.properties.get("lat"), self.properties.get("lng"))
    }

    /// Whether this event links its anonymous id to an authenticated user.
    pub fn is_identity_link(&self) -> bool {
        self.kind == EventKind::Identify && self.user_id.is_some()
    }
}

#[derive(Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: EventKind,
    #[serde(default)]
    event: Option<String>,
    #[serde(rename = "rudderId", alias = "anonymousId")]
    anonymous_id: String,
    #[serde(rename = "userId", default)]
    user_id: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    properties: Option<Map<String, Value>>,
    #[serde(default)]
    context: Option<WireContext>,
}

#[derive(Deserialize)]
struct WireContext {
    #[serde(default)]
    traits: Option<Map<String, Value>>,
}

/// Decode one record payload into an [`Event`].
///
/// Fails with [`Error::Decode`] when the payload is not a well-formed event and
/// with [`Error::MalformedEvent`] when the anonymous id is empty.
pub fn decode_event(data: &[u8]) -> Result<Event> {
    let wire: WireEvent = serde_json::from_slice(data)?;

    if wire.anonymous_id.is_empty() {
        return Err(Error::MalformedEvent {
            field: "rudderId",
        });
    }

    let timestamp = wire
        .timestamp
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc));

    let properties = wire.properties.unwrap_or_default();

    let mut traits = wire.context.and_then(|c| c.traits).unwrap_or_default();
    if wire.kind == EventKind::Identify {
        traits.extend(properties.clone());
    }

    Ok(Event {
        kind: wire.kind,
        name: wire.event.filter(|n| !n.is_empty()),
        anonymous_id: wire.anonymous_id,
        // The pipeline sends "" for users that have not authenticated.
        user_id: wire.user_id.filter(|u| !u.is_empty()),
        timestamp,
        properties,
        traits,
    })
}

/// A decoded record as it was received from the partition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawRecord {
    pub sequence: SequenceNumber,
    /// Decoder-assigned arrival index; breaks ties between equal sequence numbers.
    pub arrival: u64,
    /// When the partition accepted the record, if the source reports it.
    pub received_at: Option<DateTime<Utc>>,
    pub event: Event,
}

impl RawRecord {
    /// Replay order: sequence number, then arrival.
    pub fn replay_cmp(&self, other: &Self) -> Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then(self.arrival.cmp(&other.arrival))
    }
}

/// Turns partition records into [`RawRecord`]s, assigning arrival indices.
#[derive(Debug, Default)]
pub struct RecordDecoder {
    next_arrival: u64,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a record payload.
    ///
    /// The arrival index is consumed even when decoding fails so indices stay
    /// aligned with partition arrival order.
    pub fn decode(
        &mut self,
        sequence: &str,
        data: &[u8],
        received_at: Option<DateTime<Utc>>,
    ) -> Result<RawRecord> {
        let arrival = self.next_arrival;
        self.next_arrival += 1;

        let sequence = SequenceNumber::parse(sequence)?;
        let event = decode_event(data)?;

        Ok(RawRecord {
            sequence,
            arrival,
            received_at,
            event,
        })
    }

    /// Number of records seen so far.
    pub fn decoded(&self) -> u64 {
        self.next_arrival
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH: &str = r#"{
        "type": "track",
        "event": "complete search",
        "rudderId": "a1",
        "userId": "",
        "timestamp": "2022-03-01T10:00:00.000Z",
        "properties": {"lat": 10, "lng": 20.5},
        "context": {"traits": {"city": "Lisbon"}}
    }"#;

    #[test]
    fn test_decode_track_event() {
        let event = decode_event(SEARCH.as_bytes()).unwrap();
        assert_eq!(event.kind, EventKind::Track);
        assert!(event.is_named(SEARCH_COMPLETED));
        assert_eq!(event.anonymous_id, "a1");
        assert_eq!(event.user_id, None);
        assert_eq!(
            event.search_point(),
            Some(GeoPoint {
                lat: 10.0,
                lng: 20.5
            })
        );
        assert_eq!(event.traits.get("city"), Some(&Value::from("Lisbon")));
        assert!(event.timestamp().is_ok());
    }

    #[test]
    fn test_decode_identify_overlays_properties_on_traits() {
        let json = r#"{
            "type": "identify",
            "rudderId": "a1",
            "userId": "u1",
            "timestamp": "2022-03-01T10:00:00Z",
            "properties": {"plan": "pro"},
            "context": {"traits": {"plan": "free", "email": "x@example.com"}}
        }"#;
        let event = decode_event(json.as_bytes()).unwrap();
        assert!(event.is_identity_link());
        assert_eq!(event.traits.get("plan"), Some(&Value::from("pro")));
        assert_eq!(
            event.traits.get("email"),
            Some(&Value::from("x@example.com"))
        );
        assert_eq!(event.display_name(), "identify");
    }

    #[test]
    fn test_decode_rejects_invalid_json() {
        let err = decode_event(b"{not json").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let json = r#"{"type": "page", "rudderId": "a1", "timestamp": "2022-03-01T10:00:00Z"}"#;
        assert!(matches!(
            decode_event(json.as_bytes()),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_decode_keeps_event_without_timestamp() {
        let json = r#"{"type": "track", "event": "open app", "rudderId": "a1"}"#;
        let event = decode_event(json.as_bytes()).unwrap();
        assert!(matches!(
            event.timestamp(),
            Err(Error::MalformedEvent { field: "timestamp" })
        ));
    }

    #[test]
    fn test_decode_rejects_empty_anonymous_id() {
        let json = r#"{"type": "track", "rudderId": "", "timestamp": "2022-03-01T10:00:00Z"}"#;
        assert!(matches!(
            decode_event(json.as_bytes()),
            Err(Error::MalformedEvent { field: "rudderId" })
        ));
    }

    #[test]
    fn test_reservation_id_accepts_numbers() {
        let json = r#"{"type": "track", "rudderId": "a1", "properties": {"reservationId": 42}}"#;
        let event = decode_event(json.as_bytes()).unwrap();
        assert_eq!(event.reservation_id().as_deref(), Some("42"));
    }

    #[test]
    fn test_geo_point_from_string_values() {
        let lat = Value::from("38.7");
        let lng = Value::from(-9.1);
        assert_eq!(
            GeoPoint::from_values(Some(&lat), Some(&lng)),
            Some(GeoPoint { lat: 38.7, lng: -9.1 })
        );
        assert_eq!(GeoPoint::from_values(Some(&lat), None), None);
        assert_eq!(
            GeoPoint::from_values(Some(&Value::Bool(true)), Some(&lng)),
            None
        );
    }

    #[test]
    fn test_sequence_number_ordering() {
        let small = SequenceNumber::parse("9").unwrap();
        let large = SequenceNumber::parse("10").unwrap();
        assert!(small < large);

        let wide_a = SequenceNumber::parse("49590338271490256608559692538361571095921575989136588898").unwrap();
        let wide_b = SequenceNumber::parse("49590338271490256608559692540925702759324208523137515618").unwrap();
        assert!(wide_a < wide_b);

        assert_eq!(SequenceNumber::parse("007").unwrap(), SequenceNumber::from(7));
        assert_eq!(SequenceNumber::parse("000").unwrap().as_str(), "0");
        assert!(SequenceNumber::parse("12x").is_err());
        assert!(SequenceNumber::parse("").is_err());
    }

    #[test]
    fn test_decoder_assigns_arrival_even_on_failure() {
        let mut decoder = RecordDecoder::new();
        assert!(decoder.decode("1", b"garbage", None).is_err());
        let record = decoder.decode("2", SEARCH.as_bytes(), None).unwrap();
        assert_eq!(record.arrival, 1);
        assert_eq!(record.sequence, SequenceNumber::from(2));
        assert_eq!(decoder.decoded(), 2);
    }

    #[test]
    fn test_replay_cmp_breaks_ties_by_arrival() {
        let mut decoder = RecordDecoder::new();
        let first = decoder.decode("5", SEARCH.as_bytes(), None).unwrap();
        let second = decoder.decode("5", SEARCH.as_bytes(), None).unwrap();
        let earlier = decoder.decode("4", SEARCH.as_bytes(), None).unwrap();
        assert_eq!(first.replay_cmp(&second), Ordering::Less);
        assert_eq!(earlier.replay_cmp(&first), Ordering::Less);
    }
}
