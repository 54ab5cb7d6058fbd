//! Error types for sources, the durable store and the backend selector.

use thiserror::Error;

/// Errors raised while talking to a vitals or location source.
///
/// These are transient by nature: the feed and the poller degrade the
/// affected patient (offline / unknown connectivity) and keep retrying.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Failed to parse a payload.
    #[error("Failed to parse payload: {0}")]
    Parse(String),

    /// Connection failed.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Timeout waiting for response.
    #[error("Request timed out")]
    Timeout,

    /// The source has no data for this patient.
    #[error("Unknown patient: {0}")]
    UnknownPatient(String),

    /// Operation not offered by this source.
    #[error("Not supported: {0}")]
    Unsupported(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SourceError::Timeout
        } else if err.is_connect() {
            SourceError::Connection(err.to_string())
        } else if err.is_decode() {
            SourceError::Parse(err.to_string())
        } else {
            SourceError::Http(err.to_string())
        }
    }
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            SourceError::Timeout
        } else {
            SourceError::Connection(err.to_string())
        }
    }
}

/// Errors from the durable key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing file could not be read or written.
    #[error("Storage unavailable: {0}")]
    Io(#[from] std::io::Error),

    /// The backing file exists but is not a valid store.
    #[error("Corrupt store: {0}")]
    Corrupt(String),
}

/// Configuration failures surfaced by the backend selector.
///
/// The selector never falls back to another mode when one of these occurs.
#[derive(Debug, Error)]
pub enum SelectorError {
    /// Reading or writing the durable store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The persisted backend mode is not one we recognise.
    #[error("Invalid backend mode: {0:?}")]
    InvalidMode(String),

    /// A server address is not a valid `host:port` pair.
    #[error("Invalid server address: {0}")]
    InvalidAddress(String),
}
