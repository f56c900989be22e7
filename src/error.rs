//! Error types shared by the store seams and the HTTP layer.

use thiserror::Error;

/// Failure of an injected dependency (event store, repository, cache).
///
/// The selection path never surfaces these to callers; it logs them and
/// degrades to fewer ads.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("{0} timed out")]
    Timeout(&'static str),
}

/// Malformed client input, rejected before any store is touched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("limit must be between 1 and {max}, got {got}")]
    LimitOutOfRange { got: usize, max: usize },

    #[error("eventId must be at most {max} bytes")]
    EventIdTooLong { max: usize },
}
