//! Core types for the acquisition and consolidation pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use medref_common::fingerprint::fingerprint_parts;

/// Raw record as fetched from an upstream source
///
/// Ephemeral: raw records exist only between fetch and normalization and
/// are never persisted.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub source_id: String,
    pub fetch_time: DateTime<Utc>,
    /// Source-specific free-form payload
    pub payload: serde_json::Value,
}

/// Source-agnostic record produced by a validator
///
/// Immutable once created. `subject_key` is the domain natural identifier
/// (e.g. a generic drug name); `fields` hold scalar values, `set_fields`
/// multi-valued ones (warnings, categories, brand names).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub subject_key: String,
    pub source_id: String,
    /// Configured 0.0-1.0 authority of the source, used in conflict resolution
    pub source_trust_weight: f64,
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub set_fields: BTreeMap<String, Vec<String>>,
    pub fetch_time: DateTime<Utc>,
}

impl NormalizedRecord {
    /// Stable identity of this record's content, used to deduplicate
    /// contributors across runs
    pub fn fingerprint(&self) -> String {
        let mut parts: Vec<String> = vec![self.source_id.clone(), self.subject_key.clone()];
        for (name, value) in &self.fields {
            parts.push(format!("f:{}", name));
            parts.push(value.clone());
        }
        for (name, values) in &self.set_fields {
            parts.push(format!("s:{}", name));
            for value in values {
                parts.push(value.clone());
            }
        }
        fingerprint_parts(parts)
    }

    /// Number of scalar fields carrying a non-empty value
    pub fn non_empty_field_count(&self) -> usize {
        self.fields.values().filter(|v| !v.trim().is_empty()).count()
    }
}

/// One deduplicated canonical entity per real-world subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    /// Unique identity derived from subject-key normalization
    pub canonical_key: String,
    /// All subject-key spellings seen across contributors
    pub aliases: Vec<String>,
    /// All sources that contributed at least one record
    pub source_ids: Vec<String>,
    /// Resolved scalar fields, one value each
    pub fields: BTreeMap<String, String>,
    /// Unioned set-valued fields (warnings, categories, brand names)
    pub set_fields: BTreeMap<String, Vec<String>>,
    /// Every record ever grouped under this key, in first-seen order.
    /// Additive across runs, never shrinks.
    pub contributing_records: Vec<NormalizedRecord>,
    pub confidence_score: f64,
    pub total_contributors: usize,
    /// Set on every write; cleared by the external search indexer
    pub needs_reindex: bool,
    pub updated_at: DateTime<Utc>,
}

/// Persisted acquisition status of one source
///
/// Transitions only through the machine in the orchestrator; see
/// [`crate::orchestrator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Idle,
    Fetching,
    PageComplete,
    RateLimited,
    Retrying,
    SourceError,
    Draining,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &str {
        match self {
            DownloadStatus::Idle => "idle",
            DownloadStatus::Fetching => "fetching",
            DownloadStatus::PageComplete => "page_complete",
            DownloadStatus::RateLimited => "rate_limited",
            DownloadStatus::Retrying => "retrying",
            DownloadStatus::SourceError => "source_error",
            DownloadStatus::Draining => "draining",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
        }
    }

    /// Terminal for the current run (resume starts a fresh run)
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Failed)
    }
}

impl From<String> for DownloadStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "idle" => DownloadStatus::Idle,
            "fetching" => DownloadStatus::Fetching,
            "page_complete" => DownloadStatus::PageComplete,
            "rate_limited" => DownloadStatus::RateLimited,
            "retrying" => DownloadStatus::Retrying,
            "source_error" => DownloadStatus::SourceError,
            "draining" => DownloadStatus::Draining,
            "completed" => DownloadStatus::Completed,
            "failed" => DownloadStatus::Failed,
            _ => DownloadStatus::Idle,
        }
    }
}

/// Category of the last error a source run hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    TransientNetwork,
    PermanentSource,
    ValidationRejected,
    ConsolidationConflict,
    StorageUnavailable,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::PermanentSource => "permanent_source",
            ErrorKind::ValidationRejected => "validation_rejected",
            ErrorKind::ConsolidationConflict => "consolidation_conflict",
            ErrorKind::StorageUnavailable => "storage_unavailable",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

/// Result of one acquisition run for one source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: uuid::Uuid,
    pub source_id: String,
    pub items_fetched: u64,
    pub items_valid: u64,
    pub items_rejected: u64,
    pub final_status: DownloadStatus,
    pub last_error_kind: Option<ErrorKind>,
    pub duration_secs: f64,
}

/// Result of one consolidation pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationSummary {
    pub groups_processed: u64,
    pub entities_created: u64,
    pub entities_updated: u64,
    pub records_consolidated: u64,
    pub enrichment_failures: u64,
    pub duration_secs: f64,
}
