//! File-backed download state store
//!
//! One JSON object per source at `{dir}/{source_id}.json`. Writes go to a
//! temp file in the same directory followed by an atomic rename, so a
//! crash mid-write never leaves a truncated state file behind.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use super::{DownloadState, StateStore};
use crate::error::StateStoreError;

/// Durable state store writing one JSON file per source
pub struct FileStateStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles so CAS checks are race-free
    // within this process
    write_lock: Mutex<()>,
}

impl FileStateStore {
    /// Create a store rooted at `dir`, creating the directory if needed
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StateStoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn state_path(&self, source_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", source_id))
    }

    async fn read_state(&self, source_id: &str) -> Result<Option<DownloadState>, StateStoreError> {
        let path = self.state_path(source_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, source_id: &str) -> Result<Option<DownloadState>, StateStoreError> {
        self.read_state(source_id).await
    }

    async fn save(&self, state: &mut DownloadState) -> Result<(), StateStoreError> {
        let _guard = self.write_lock.lock().await;

        if let Some(stored) = self.read_state(&state.source_id).await? {
            if stored.version != state.version {
                return Err(StateStoreError::VersionConflict {
                    source_id: state.source_id.clone(),
                    expected: state.version,
                    found: stored.version,
                });
            }
        } else if state.version != 0 {
            return Err(StateStoreError::VersionConflict {
                source_id: state.source_id.clone(),
                expected: state.version,
                found: 0,
            });
        }

        state.version += 1;
        state.updated_at = chrono::Utc::now();

        let path = self.state_path(&state.source_id);
        let tmp_path = self.dir.join(format!(".{}.json.tmp", state.source_id));
        let bytes = serde_json::to_vec_pretty(state)?;

        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        debug!(
            source_id = %state.source_id,
            status = state.status.as_str(),
            version = state.version,
            "Persisted download state"
        );

        Ok(())
    }

    async fn delete(&self, source_id: &str) -> Result<(), StateStoreError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.state_path(source_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DownloadStatus;

    #[tokio::test]
    async fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).unwrap();

        let mut state = DownloadState::new("openfda");
        state.cursor = Some("200".to_string());
        state.completed_count = 200;
        state.status = DownloadStatus::PageComplete;

        store.save(&mut state).await.unwrap();
        assert_eq!(state.version, 1);

        let loaded = store.load("openfda").await.unwrap().unwrap();
        assert_eq!(loaded.cursor.as_deref(), Some("200"));
        assert_eq!(loaded.completed_count, 200);
        assert_eq!(loaded.status, DownloadStatus::PageComplete);
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).unwrap();
        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).unwrap();

        let mut state = DownloadState::new("openfda");
        store.save(&mut state).await.unwrap();

        // A second writer still holding the old version must be refused
        let mut stale = DownloadState::new("openfda");
        let err = store.save(&mut stale).await.unwrap_err();
        assert!(matches!(err, StateStoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn test_save_survives_process_restart() {
        let dir = tempfile::tempdir().unwrap();

        let mut state = DownloadState::new("pubmed");
        state.completed_count = 50;
        {
            let store = FileStateStore::new(dir.path()).unwrap();
            store.save(&mut state).await.unwrap();
        }

        // New store instance over the same directory sees the state
        let store = FileStateStore::new(dir.path()).unwrap();
        let loaded = store.load("pubmed").await.unwrap().unwrap();
        assert_eq!(loaded.completed_count, 50);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).unwrap();

        let mut state = DownloadState::new("openfda");
        store.save(&mut state).await.unwrap();

        store.delete("openfda").await.unwrap();
        store.delete("openfda").await.unwrap();
        assert!(store.load("openfda").await.unwrap().is_none());
    }
}
