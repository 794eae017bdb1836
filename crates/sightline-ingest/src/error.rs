//! Error types for the ingestion pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion.
#[derive(Error, Debug)]
pub enum Error {
    /// Record decoding or validation error.
    #[error(transparent)]
    Core(#[from] sightline_core::Error),

    /// The starting position could not be resolved. Not retried.
    #[error("initialization error: {0}")]
    Initialization(String),

    /// Transient upstream failure while fetching a batch. Retried with backoff.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// The loop was asked to poll before it was initialized.
    #[error("ingestion loop is not initialized")]
    NotInitialized,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_is_transparent() {
        let err: Error = sightline_core::Error::MalformedEvent { field: "timestamp" }.into();
        assert_eq!(
            err.to_string(),
            "malformed event: missing or invalid 'timestamp'"
        );
    }

    #[test]
    fn test_fetch_display() {
        let err = Error::Fetch("throttled".to_string());
        assert!(err.to_string().contains("throttled"));
    }
}
