//! In-memory download state store for tests and dry runs

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{DownloadState, StateStore};
use crate::error::StateStoreError;

/// Non-durable state store with the same compare-and-swap semantics as the
/// file-backed one
#[derive(Default)]
pub struct InMemoryStateStore {
    inner: RwLock<HashMap<String, DownloadState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, source_id: &str) -> Result<Option<DownloadState>, StateStoreError> {
        Ok(self.inner.read().await.get(source_id).cloned())
    }

    async fn save(&self, state: &mut DownloadState) -> Result<(), StateStoreError> {
        let mut inner = self.inner.write().await;

        let found = inner.get(&state.source_id).map(|s| s.version).unwrap_or(0);
        if found != state.version {
            return Err(StateStoreError::VersionConflict {
                source_id: state.source_id.clone(),
                expected: state.version,
                found,
            });
        }

        state.version += 1;
        state.updated_at = chrono::Utc::now();
        inner.insert(state.source_id.clone(), state.clone());
        Ok(())
    }

    async fn delete(&self, source_id: &str) -> Result<(), StateStoreError> {
        self.inner.write().await.remove(source_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cas_round_trip() {
        let store = InMemoryStateStore::new();

        let mut state = DownloadState::new("openfda");
        store.save(&mut state).await.unwrap();
        assert_eq!(state.version, 1);

        state.completed_count = 10;
        store.save(&mut state).await.unwrap();
        assert_eq!(state.version, 2);

        let loaded = store.load("openfda").await.unwrap().unwrap();
        assert_eq!(loaded.completed_count, 10);
    }

    #[tokio::test]
    async fn test_stale_writer_rejected() {
        let store = InMemoryStateStore::new();

        let mut first = DownloadState::new("openfda");
        store.save(&mut first).await.unwrap();

        let mut stale = DownloadState::new("openfda");
        assert!(matches!(
            store.save(&mut stale).await,
            Err(StateStoreError::VersionConflict { .. })
        ));
    }
}
