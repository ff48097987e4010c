//! Error types for the sync layer

use std::time::Duration;
use thiserror::Error;

/// Why a single remote call failed.
///
/// Every variant collapses to `SyncStatus::Error` on the record; the variants
/// only exist so logs and `last_error` say something useful.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncFailure {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rejected by backend ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Remote record not found")]
    NotFound,

    #[error("Could not decode backend response: {0}")]
    Decode(String),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Sync operation failed: {0}")]
    Remote(#[from] SyncFailure),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
