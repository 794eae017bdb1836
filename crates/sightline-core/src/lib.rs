//! Core types and shared utilities for sightline.
//!
//! This crate provides:
//! - The typed event model decoded from partition records
//! - The [`RecordDecoder`] that validates payloads and assigns arrival order
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod event;
pub mod metrics;

pub use error::{Error, Result};
pub use event::{
    Event, EventKind, GeoPoint, LATITUDE_TRAIT, LONGITUDE_TRAIT, RESERVATION_APPROVED,
    RESERVATION_REQUESTED, RawRecord, RecordDecoder, SEARCH_COMPLETED, SequenceNumber,
    decode_event,
};
