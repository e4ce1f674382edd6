//! Error taxonomy shared across the relay.

use thiserror::Error;

/// Reason a candidate event was refused before storage.
///
/// The `Display` form is sent verbatim in the `OK` frame, so every variant
/// carries a machine-readable prefix (`invalid:`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("invalid: missing or malformed field: {0}")]
    MalformedField(&'static str),
    #[error("invalid: event too large: {0} bytes")]
    Oversized(usize),
    #[error("invalid: computed event id does not match")]
    InvalidId,
    #[error("invalid: signature verification failed")]
    InvalidSignature,
    #[error("invalid: created_at outside acceptable window")]
    TimestampOutOfRange,
}

/// Top-level error type for relay operations.
///
/// Validation errors are recovered locally (the client is told via `OK` or
/// `NOTICE` and the connection stays open); transport errors only ever
/// surface as a connection teardown.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error(transparent)]
    Validation(#[from] Rejection),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
