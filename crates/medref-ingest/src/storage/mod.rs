//! Hybrid canonical + detail storage
//!
//! A [`CanonicalStore`] persists one entity per canonical key with O(1)
//! keyed lookup, keeps every contributing record queryable through an
//! append-only audit log, and makes repeated writes idempotent merges:
//! resolved scalar fields are replaced only when the incoming entity's
//! confidence is at least the stored one, while set-valued fields and
//! contributor lists are always unioned, never replaced.

mod memory;
mod postgres;

pub use memory::InMemoryCanonicalStore;
pub use postgres::PostgresCanonicalStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::warn;

use crate::consolidate::{union_case_insensitive, union_exact};
use crate::error::StorageError;
use crate::models::{CanonicalEntity, NormalizedRecord};

/// Whether an upsert-merge created a new entity or merged into one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// One audit-log row: a contributing record as it arrived
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub canonical_key: String,
    pub source_id: String,
    pub ingestion_time: DateTime<Utc>,
    pub record: NormalizedRecord,
}

/// Keyed canonical entity storage with upsert-merge semantics
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    /// Indexed lookup by canonical key
    async fn get(&self, canonical_key: &str) -> Result<Option<CanonicalEntity>, StorageError>;

    /// Insert or merge; never a blind overwrite
    async fn upsert_merge(&self, entity: CanonicalEntity) -> Result<UpsertOutcome, StorageError>;

    /// Append contributing records to the audit log
    async fn append_audit(
        &self,
        canonical_key: &str,
        records: &[NormalizedRecord],
    ) -> Result<(), StorageError>;

    /// Keys flagged for the external search indexer
    async fn pending_reindex(&self) -> Result<Vec<String>, StorageError>;

    /// Acknowledge a completed reindex for one key
    async fn clear_reindex(&self, canonical_key: &str) -> Result<(), StorageError>;
}

/// Merge an incoming entity into the stored one
///
/// The incoming resolved fields and confidence win only when the incoming
/// confidence is at least the stored confidence; a lower-confidence
/// incoming write keeps the stored resolution and is logged as a
/// consolidation conflict. Sets and contributors are always unioned.
pub fn merge_entities(stored: &CanonicalEntity, incoming: &CanonicalEntity) -> CanonicalEntity {
    let incoming_wins = incoming.confidence_score >= stored.confidence_score;
    if !incoming_wins {
        warn!(
            canonical_key = %stored.canonical_key,
            stored_confidence = stored.confidence_score,
            incoming_confidence = incoming.confidence_score,
            "Consolidation conflict: keeping higher-confidence stored resolution"
        );
    }

    let (fields, confidence_score) = if incoming_wins {
        (incoming.fields.clone(), incoming.confidence_score)
    } else {
        (stored.fields.clone(), stored.confidence_score)
    };

    let mut contributing_records = stored.contributing_records.clone();
    let mut seen: HashSet<String> = contributing_records
        .iter()
        .map(|r| r.fingerprint())
        .collect();
    for record in &incoming.contributing_records {
        if seen.insert(record.fingerprint()) {
            contributing_records.push(record.clone());
        }
    }

    let aliases = union_exact(&stored.aliases, incoming.aliases.iter().map(String::as_str));

    let mut source_ids: Vec<String> = stored
        .source_ids
        .iter()
        .chain(incoming.source_ids.iter())
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    source_ids.sort();

    let mut set_fields = stored.set_fields.clone();
    for (name, values) in &incoming.set_fields {
        let merged = union_case_insensitive(
            set_fields.get(name).map(Vec::as_slice).unwrap_or(&[]),
            values.iter().map(String::as_str),
        );
        set_fields.insert(name.clone(), merged);
    }

    CanonicalEntity {
        canonical_key: stored.canonical_key.clone(),
        aliases,
        source_ids,
        fields,
        set_fields,
        total_contributors: contributing_records.len(),
        contributing_records,
        confidence_score,
        needs_reindex: true,
        updated_at: stored.updated_at.max(incoming.updated_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn contributor(source: &str, desc: &str) -> NormalizedRecord {
        let mut fields = BTreeMap::new();
        fields.insert("description".to_string(), desc.to_string());
        NormalizedRecord {
            subject_key: "drug a".to_string(),
            source_id: source.to_string(),
            source_trust_weight: 0.5,
            fields,
            set_fields: BTreeMap::new(),
            fetch_time: Utc.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).unwrap(),
        }
    }

    fn entity(confidence: f64, desc: &str, contributors: Vec<NormalizedRecord>) -> CanonicalEntity {
        let mut fields = BTreeMap::new();
        fields.insert("description".to_string(), desc.to_string());
        CanonicalEntity {
            canonical_key: "drug a".to_string(),
            aliases: vec!["drug a".to_string()],
            source_ids: contributors.iter().map(|r| r.source_id.clone()).collect(),
            fields,
            set_fields: BTreeMap::new(),
            total_contributors: contributors.len(),
            contributing_records: contributors,
            confidence_score: confidence,
            needs_reindex: false,
            updated_at: Utc.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_higher_confidence_incoming_replaces_fields() {
        let stored = entity(0.5, "old", vec![contributor("x", "old")]);
        let incoming = entity(0.8, "new", vec![contributor("y", "new")]);

        let merged = merge_entities(&stored, &incoming);
        assert_eq!(merged.fields.get("description").unwrap(), "new");
        assert_eq!(merged.confidence_score, 0.8);
        assert_eq!(merged.contributing_records.len(), 2);
        assert!(merged.needs_reindex);
    }

    #[test]
    fn test_lower_confidence_incoming_keeps_stored_fields() {
        let stored = entity(0.8, "authoritative", vec![contributor("x", "authoritative")]);
        let incoming = entity(0.4, "weaker", vec![contributor("y", "weaker")]);

        let merged = merge_entities(&stored, &incoming);
        assert_eq!(merged.fields.get("description").unwrap(), "authoritative");
        assert_eq!(merged.confidence_score, 0.8);
        // Contributors union regardless of who wins resolution
        assert_eq!(merged.contributing_records.len(), 2);
    }

    #[test]
    fn test_duplicate_contributors_not_double_counted() {
        let shared = contributor("x", "same");
        let stored = entity(0.5, "same", vec![shared.clone()]);
        let incoming = entity(0.5, "same", vec![shared]);

        let merged = merge_entities(&stored, &incoming);
        assert_eq!(merged.contributing_records.len(), 1);
        assert_eq!(merged.total_contributors, 1);
    }
}
