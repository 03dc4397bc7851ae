//! Error types for swtchbrd

use thiserror::Error;

/// Result type alias using the swtchbrd Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the interface driver, mapped from the platform's
/// status codes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    #[error("generic failure")]
    Generic,

    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("interface setup is not complete")]
    SetupIncomplete,

    #[error("permission denied")]
    PermissionDenied,

    #[error("packet size larger than MTU")]
    PacketTooLarge,

    #[error("buffers exhausted temporarily")]
    BuffersExhausted,

    #[error("packets larger than limit")]
    PacketsOverLimit,
}

/// Errors that can occur in swtchbrd operations
#[derive(Error, Debug)]
pub enum Error {
    /// A required field is missing or malformed
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An id, name, address, port, or tuple is already in use
    #[error("conflict: {0}")]
    Conflict(String),

    /// The ephemeral port pool for a host has no free slots
    #[error("port pool depleted")]
    PoolDepleted,

    /// Host (or other entity) lookup failed
    #[error("not found: {0}")]
    NotFound(String),

    /// L2-L7 decode failed
    #[error("parse error: {0}")]
    Parse(String),

    /// Interface driver errors
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// The pipeline is shutting down
    #[error("cancelled")]
    Cancelled,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The system randomness source failed
    #[error("randomness unavailable: {0}")]
    Entropy(String),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

impl From<getrandom::Error> for Error {
    fn from(err: getrandom::Error) -> Self {
        Self::Entropy(err.to_string())
    }
}
