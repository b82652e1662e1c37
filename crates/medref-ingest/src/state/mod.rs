//! Durable per-source download state
//!
//! One [`DownloadState`] per source records where acquisition left off:
//! the resume cursor, completed-item count, retry counters, and the next
//! allowed attempt time. The orchestrator persists it after every state
//! machine transition through a [`StateStore`], which provides atomic
//! compare-and-swap semantics via a monotonic version counter.

mod file;
mod memory;

pub use file::FileStateStore;
pub use memory::InMemoryStateStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StateStoreError;
use crate::models::{DownloadStatus, ErrorKind};

/// Durable acquisition progress for one source
///
/// Created on the first run of a source, mutated exclusively by the
/// acquisition orchestrator, deleted only by operator reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadState {
    pub source_id: String,
    /// Opaque resume token; `None` before the first page
    pub cursor: Option<String>,
    pub completed_count: u64,
    pub status: DownloadStatus,
    /// Transient-error attempts for the in-flight page; reset on success
    pub retry_count: u32,
    /// Rate-limited attempts within the current UTC day
    pub daily_retry_count: u32,
    /// UTC day the daily counter belongs to
    pub retry_day: NaiveDate,
    pub next_allowed_attempt: Option<DateTime<Utc>>,
    pub last_error_kind: Option<ErrorKind>,
    /// Monotonic counter for compare-and-swap persistence
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl DownloadState {
    /// Fresh state for a source that has never run
    pub fn new(source_id: &str) -> Self {
        let now = Utc::now();
        Self {
            source_id: source_id.to_string(),
            cursor: None,
            completed_count: 0,
            status: DownloadStatus::Idle,
            retry_count: 0,
            daily_retry_count: 0,
            retry_day: now.date_naive(),
            next_allowed_attempt: None,
            last_error_kind: None,
            version: 0,
            updated_at: now,
        }
    }

    /// Reset the daily retry counter when the UTC day has rolled over
    pub fn roll_daily_window(&mut self, today: NaiveDate) {
        if self.retry_day != today {
            self.retry_day = today;
            self.daily_retry_count = 0;
        }
    }

    /// Discard all progress, keeping the identity (operator force-fresh)
    pub fn reset_progress(&mut self) {
        self.cursor = None;
        self.completed_count = 0;
        self.status = DownloadStatus::Idle;
        self.retry_count = 0;
        self.next_allowed_attempt = None;
        self.last_error_kind = None;
    }
}

/// Durable key-value store of download state, keyed by source id
///
/// `save` performs a compare-and-swap on `state.version`: the write
/// succeeds only if the stored version matches, then both the stored copy
/// and `state` advance to `version + 1`. Two orchestrators racing on the
/// same source cannot silently overwrite each other.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, source_id: &str) -> Result<Option<DownloadState>, StateStoreError>;

    async fn save(&self, state: &mut DownloadState) -> Result<(), StateStoreError>;

    async fn delete(&self, source_id: &str) -> Result<(), StateStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_starts_idle() {
        let state = DownloadState::new("openfda");
        assert_eq!(state.status, DownloadStatus::Idle);
        assert_eq!(state.version, 0);
        assert!(state.cursor.is_none());
    }

    #[test]
    fn test_roll_daily_window_resets_counter() {
        let mut state = DownloadState::new("openfda");
        state.daily_retry_count = 7;

        let same_day = state.retry_day;
        state.roll_daily_window(same_day);
        assert_eq!(state.daily_retry_count, 7);

        let next_day = same_day.succ_opt().unwrap();
        state.roll_daily_window(next_day);
        assert_eq!(state.daily_retry_count, 0);
        assert_eq!(state.retry_day, next_day);
    }

    #[test]
    fn test_reset_progress_keeps_identity_and_version() {
        let mut state = DownloadState::new("openfda");
        state.cursor = Some("300".to_string());
        state.completed_count = 300;
        state.status = DownloadStatus::Completed;
        state.version = 12;

        state.reset_progress();

        assert_eq!(state.source_id, "openfda");
        assert_eq!(state.version, 12);
        assert!(state.cursor.is_none());
        assert_eq!(state.completed_count, 0);
        assert_eq!(state.status, DownloadStatus::Idle);
    }
}
