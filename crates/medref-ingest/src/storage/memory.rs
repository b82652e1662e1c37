//! In-memory canonical store for tests and dry runs

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{merge_entities, AuditEntry, CanonicalStore, UpsertOutcome};
use crate::error::StorageError;
use crate::models::{CanonicalEntity, NormalizedRecord};

/// Non-durable canonical store with full upsert-merge semantics
#[derive(Default)]
pub struct InMemoryCanonicalStore {
    entities: RwLock<HashMap<String, CanonicalEntity>>,
    audit: RwLock<Vec<AuditEntry>>,
}

impl InMemoryCanonicalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Audit entries for one canonical key, in ingestion order
    pub async fn audit_for(&self, canonical_key: &str) -> Vec<AuditEntry> {
        self.audit
            .read()
            .await
            .iter()
            .filter(|e| e.canonical_key == canonical_key)
            .cloned()
            .collect()
    }

    /// Number of stored entities
    pub async fn len(&self) -> usize {
        self.entities.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entities.read().await.is_empty()
    }
}

#[async_trait]
impl CanonicalStore for InMemoryCanonicalStore {
    async fn get(&self, canonical_key: &str) -> Result<Option<CanonicalEntity>, StorageError> {
        Ok(self.entities.read().await.get(canonical_key).cloned())
    }

    async fn upsert_merge(&self, entity: CanonicalEntity) -> Result<UpsertOutcome, StorageError> {
        let mut entities = self.entities.write().await;
        match entities.get(&entity.canonical_key) {
            Some(stored) => {
                let merged = merge_entities(stored, &entity);
                entities.insert(entity.canonical_key.clone(), merged);
                Ok(UpsertOutcome::Updated)
            },
            None => {
                let mut entity = entity;
                entity.needs_reindex = true;
                entities.insert(entity.canonical_key.clone(), entity);
                Ok(UpsertOutcome::Created)
            },
        }
    }

    async fn append_audit(
        &self,
        canonical_key: &str,
        records: &[NormalizedRecord],
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        let mut audit = self.audit.write().await;
        for record in records {
            audit.push(AuditEntry {
                canonical_key: canonical_key.to_string(),
                source_id: record.source_id.clone(),
                ingestion_time: now,
                record: record.clone(),
            });
        }
        Ok(())
    }

    async fn pending_reindex(&self) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .entities
            .read()
            .await
            .values()
            .filter(|e| e.needs_reindex)
            .map(|e| e.canonical_key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn clear_reindex(&self, canonical_key: &str) -> Result<(), StorageError> {
        if let Some(entity) = self.entities.write().await.get_mut(canonical_key) {
            entity.needs_reindex = false;
        }
        Ok(())
    }
}
