//! Relay error types.
//!
//! Only `Unauthorized` and `Decode` end a connection. Offer failures turn
//! into `call-error` frames for the caller, and everything else is logged
//! and swallowed at the call site.

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    /// The addressed user has no live connection.
    #[error("user {0} is offline")]
    ReceiverOffline(String),

    /// The addressed user is already calling or in a call.
    #[error("user {0} is busy")]
    ReceiverBusy(String),

    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),

    /// Outbound queue of the named user was full or already closed.
    #[error("failed to enqueue frame for {0}: queue full or closed")]
    EnqueueFailed(String),

    #[error("malformed frame: {0}")]
    Decode(#[source] serde_json::Error),

    /// Identity verification failed at upgrade or on an API call.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Message store failure (SQLite or the remote data store).
    #[error("message store error: {0}")]
    Store(String),

    /// A well-formed frame whose content is not acceptable.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl From<rusqlite::Error> for RelayError {
    fn from(e: rusqlite::Error) -> Self {
        RelayError::Store(e.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        RelayError::Store(e.to_string())
    }
}
