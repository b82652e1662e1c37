//! PostgreSQL canonical store
//!
//! Entities live in `canonical_entities` keyed by `canonical_key` with the
//! full entity as a JSONB detail blob plus indexed scalar columns; the
//! audit trail lives in append-only `contributing_records`. Upsert-merge
//! takes a row-level lock (`FOR UPDATE`) so concurrent writers for the
//! same key serialize instead of losing updates.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use super::{merge_entities, CanonicalStore, UpsertOutcome};
use crate::error::StorageError;
use crate::models::{CanonicalEntity, NormalizedRecord};

/// Canonical store backed by PostgreSQL
pub struct PostgresCanonicalStore {
    pool: PgPool,
}

impl PostgresCanonicalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and ensure the schema exists
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and indexes if they do not exist
    pub async fn init_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS canonical_entities (
                canonical_key TEXT PRIMARY KEY,
                entity JSONB NOT NULL,
                confidence DOUBLE PRECISION NOT NULL,
                needs_reindex BOOLEAN NOT NULL DEFAULT TRUE,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS contributing_records (
                id BIGSERIAL PRIMARY KEY,
                canonical_key TEXT NOT NULL,
                source_id TEXT NOT NULL,
                ingestion_time TIMESTAMPTZ NOT NULL,
                record JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_contributing_records_key \
             ON contributing_records (canonical_key, source_id, ingestion_time)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl CanonicalStore for PostgresCanonicalStore {
    async fn get(&self, canonical_key: &str) -> Result<Option<CanonicalEntity>, StorageError> {
        let row = sqlx::query("SELECT entity FROM canonical_entities WHERE canonical_key = $1")
            .bind(canonical_key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let value: serde_json::Value = row.try_get("entity")?;
                Ok(Some(serde_json::from_value(value)?))
            },
            None => Ok(None),
        }
    }

    async fn upsert_merge(&self, entity: CanonicalEntity) -> Result<UpsertOutcome, StorageError> {
        let mut tx = self.pool.begin().await?;

        let stored_row = sqlx::query(
            "SELECT entity FROM canonical_entities WHERE canonical_key = $1 FOR UPDATE",
        )
        .bind(&entity.canonical_key)
        .fetch_optional(&mut *tx)
        .await?;

        let (merged, outcome) = match stored_row {
            Some(row) => {
                let value: serde_json::Value = row.try_get("entity")?;
                let stored: CanonicalEntity = serde_json::from_value(value)?;
                (merge_entities(&stored, &entity), UpsertOutcome::Updated)
            },
            None => {
                let mut entity = entity;
                entity.needs_reindex = true;
                (entity, UpsertOutcome::Created)
            },
        };

        sqlx::query(
            r#"
            INSERT INTO canonical_entities (canonical_key, entity, confidence, needs_reindex, updated_at)
            VALUES ($1, $2, $3, TRUE, $4)
            ON CONFLICT (canonical_key) DO UPDATE
            SET entity = EXCLUDED.entity,
                confidence = EXCLUDED.confidence,
                needs_reindex = TRUE,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&merged.canonical_key)
        .bind(serde_json::to_value(&merged)?)
        .bind(merged.confidence_score)
        .bind(merged.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(outcome)
    }

    async fn append_audit(
        &self,
        canonical_key: &str,
        records: &[NormalizedRecord],
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO contributing_records (canonical_key, source_id, ingestion_time, record)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(canonical_key)
            .bind(&record.source_id)
            .bind(now)
            .bind(serde_json::to_value(record)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn pending_reindex(&self) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query(
            "SELECT canonical_key FROM canonical_entities WHERE needs_reindex ORDER BY canonical_key",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.try_get::<String, _>("canonical_key").map_err(Into::into))
            .collect()
    }

    async fn clear_reindex(&self, canonical_key: &str) -> Result<(), StorageError> {
        sqlx::query("UPDATE canonical_entities SET needs_reindex = FALSE WHERE canonical_key = $1")
            .bind(canonical_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn entity(key: &str, confidence: f64) -> CanonicalEntity {
        CanonicalEntity {
            canonical_key: key.to_string(),
            aliases: vec![key.to_string()],
            source_ids: vec!["x".to_string()],
            fields: BTreeMap::new(),
            set_fields: BTreeMap::new(),
            contributing_records: Vec::new(),
            confidence_score: confidence,
            total_contributors: 0,
            needs_reindex: false,
            updated_at: Utc.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).unwrap(),
        }
    }

    async fn test_store() -> PostgresCanonicalStore {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/medref_test".to_string());
        PostgresCanonicalStore::connect(&url).await.unwrap()
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_upsert_round_trip() {
        let store = test_store().await;

        store.upsert_merge(entity("pg drug", 0.5)).await.unwrap();
        let loaded = store.get("pg drug").await.unwrap().unwrap();
        assert_eq!(loaded.canonical_key, "pg drug");

        let outcome = store.upsert_merge(entity("pg drug", 0.7)).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_reindex_flags() {
        let store = test_store().await;

        store.upsert_merge(entity("pg reindex", 0.5)).await.unwrap();
        assert!(store
            .pending_reindex()
            .await
            .unwrap()
            .contains(&"pg reindex".to_string()));

        store.clear_reindex("pg reindex").await.unwrap();
        assert!(!store
            .pending_reindex()
            .await
            .unwrap()
            .contains(&"pg reindex".to_string()));
    }
}
