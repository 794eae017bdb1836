//! Error types shared by the sightline crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding and validating records.
#[derive(Error, Debug)]
pub enum Error {
    /// The record payload is not valid structured data.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The payload decoded but is missing a field the fold depends on.
    #[error("malformed event: missing or invalid '{field}'")]
    MalformedEvent {
        /// The name of the offending field.
        field: &'static str,
    },

    /// A partition sequence number that is not a decimal integer.
    #[error("invalid sequence number '{0}'")]
    InvalidSequence(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
