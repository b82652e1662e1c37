//! Error types at the seams of the ingestion pipeline
//!
//! Each layer has its own error enum so the orchestrator can branch on
//! category: fetch errors drive the acquisition state machine, validation
//! errors are skip-and-count, store errors abort the run resumably.

use std::time::Duration;
use thiserror::Error;

use crate::models::ErrorKind;

/// Error returned by a source fetch adapter
///
/// The variant determines the state machine's reaction: rate limits cool
/// down and retry (bounded by the daily ceiling), transient errors retry
/// after a short fixed delay (bounded by attempt count), permanent errors
/// fail the run until operator intervention.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("rate limited by source{}", retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("permanent source error: {0}")]
    PermanentSource(String),
}

impl SourceError {
    /// The persisted error-kind category for this error
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            SourceError::RateLimited { .. } => ErrorKind::RateLimited,
            SourceError::TransientNetwork(_) => ErrorKind::TransientNetwork,
            SourceError::PermanentSource(_) => ErrorKind::PermanentSource,
        }
    }
}

/// Error rejecting a single raw record during normalization
///
/// Never aborts a run; rejected records are counted in the run summary.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("malformed record: {0}")]
    Malformed(String),
}

/// Error from the download state store
#[derive(Error, Debug)]
pub enum StateStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("version conflict for {source_id}: expected {expected}, found {found}")]
    VersionConflict {
        source_id: String,
        expected: u64,
        found: u64,
    },
}

/// Error from the canonical entity store
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Unavailable(e.to_string())
    }
}
