//! Consolidation engine
//!
//! Groups normalized records by canonical key, resolves field-level
//! conflicts with source-trust weighting, and produces one canonical
//! entity per subject. [`ConsolidationEngine::consolidate`] is pure:
//! the same inputs always yield the same entity, which is what makes
//! re-running consolidation after a partial failure safe.

use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ResolutionConfig;
use crate::enrich::Enricher;
use crate::error::StorageError;
use crate::models::{CanonicalEntity, ConsolidationSummary, NormalizedRecord};
use crate::normalize::canonical_key;
use crate::storage::{CanonicalStore, UpsertOutcome};

/// Deduplicating conflict-resolution engine
pub struct ConsolidationEngine {
    config: ResolutionConfig,
    // Serializes writes per canonical key across concurrent group workers
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConsolidationEngine {
    pub fn new(config: ResolutionConfig) -> Self {
        Self {
            config,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Group records by their derived canonical key
    ///
    /// Returns a BTreeMap so iteration order is deterministic.
    pub fn group_by_key(
        records: Vec<NormalizedRecord>,
    ) -> BTreeMap<String, Vec<NormalizedRecord>> {
        let mut groups: BTreeMap<String, Vec<NormalizedRecord>> = BTreeMap::new();
        for record in records {
            let key = canonical_key(&record.subject_key);
            groups.entry(key).or_default().push(record);
        }
        groups
    }

    /// Produce or update the canonical entity for one group
    ///
    /// Pure given its inputs: no clocks, no randomness, no shared state.
    /// The union of existing contributors and the new group is always
    /// preserved, deduplicated by content fingerprint so repeated batches
    /// do not double-count.
    pub fn consolidate(
        &self,
        group: &[NormalizedRecord],
        existing: Option<&CanonicalEntity>,
    ) -> CanonicalEntity {
        let mut contributors: Vec<NormalizedRecord> = Vec::new();
        let mut seen = HashSet::new();
        let prior = existing.map(|e| e.contributing_records.as_slice()).unwrap_or(&[]);
        for record in prior.iter().chain(group.iter()) {
            if seen.insert(record.fingerprint()) {
                contributors.push(record.clone());
            }
        }

        let key = existing
            .map(|e| e.canonical_key.clone())
            .or_else(|| contributors.first().map(|r| canonical_key(&r.subject_key)))
            .unwrap_or_default();

        // Aliases keep every distinct spelling, including casings
        let aliases = union_exact(
            existing.map(|e| e.aliases.as_slice()).unwrap_or(&[]),
            contributors.iter().map(|r| r.subject_key.as_str()),
        );

        let mut source_ids: Vec<String> = contributors
            .iter()
            .map(|r| r.source_id.clone())
            .chain(existing.iter().flat_map(|e| e.source_ids.iter().cloned()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        source_ids.sort();

        let fields = self.resolve_scalar_fields(&contributors);
        let set_fields = resolve_set_fields(&contributors, existing);
        let confidence_score = self.confidence(&contributors);

        let updated_at = contributors
            .iter()
            .map(|r| r.fetch_time)
            .chain(existing.map(|e| e.updated_at))
            .max()
            .unwrap_or(chrono::DateTime::UNIX_EPOCH);

        CanonicalEntity {
            canonical_key: key,
            aliases,
            source_ids,
            fields,
            set_fields,
            total_contributors: contributors.len(),
            contributing_records: contributors,
            confidence_score,
            needs_reindex: true,
            updated_at,
        }
    }

    /// Resolve one value per scalar field across all contributors
    ///
    /// Prefer-longest fields score `len(value) * trust`; everything else
    /// scores trust alone. Ties go to the earliest-seen contributor.
    fn resolve_scalar_fields(
        &self,
        contributors: &[NormalizedRecord],
    ) -> BTreeMap<String, String> {
        let universe: BTreeSet<&str> = contributors
            .iter()
            .flat_map(|r| r.fields.keys().map(String::as_str))
            .collect();

        let mut resolved = BTreeMap::new();
        for field in universe {
            let prefer_longest = self.config.prefer_longest_fields.contains(field);

            let mut best: Option<(f64, &str)> = None;
            for record in contributors {
                let Some(value) = record.fields.get(field) else {
                    continue;
                };
                if value.trim().is_empty() {
                    continue;
                }
                let score = if prefer_longest {
                    value.len() as f64 * record.source_trust_weight
                } else {
                    record.source_trust_weight
                };
                // Strictly greater: earliest-seen contributor wins ties
                if best.map(|(s, _)| score > s).unwrap_or(true) {
                    best = Some((score, value));
                }
            }

            if let Some((_, value)) = best {
                resolved.insert(field.to_string(), value.to_string());
            }
        }
        resolved
    }

    /// Confidence = weighted sum of source diversity, average field
    /// completeness, and average source trust
    fn confidence(&self, contributors: &[NormalizedRecord]) -> f64 {
        if contributors.is_empty() {
            return 0.0;
        }

        let distinct_sources = contributors
            .iter()
            .map(|r| r.source_id.as_str())
            .collect::<HashSet<_>>()
            .len();
        let diversity =
            (distinct_sources as f64 / self.config.diversity_cap as f64).min(1.0);

        let universe: BTreeSet<&str> = contributors
            .iter()
            .flat_map(|r| r.fields.keys().map(String::as_str))
            .collect();
        let completeness = if universe.is_empty() {
            0.0
        } else {
            contributors
                .iter()
                .map(|r| r.non_empty_field_count() as f64 / universe.len() as f64)
                .sum::<f64>()
                / contributors.len() as f64
        };

        let avg_trust = contributors
            .iter()
            .map(|r| r.source_trust_weight)
            .sum::<f64>()
            / contributors.len() as f64;

        self.config.diversity_weight * diversity
            + self.config.completeness_weight * completeness
            + self.config.trust_weight * avg_trust
    }

    /// Consolidate a batch of records into the store
    ///
    /// Groups are processed with bounded concurrency; writes to one
    /// canonical key are serialized by a per-key lock so concurrent
    /// batches feeding the same subject cannot lose updates.
    pub async fn run(
        &self,
        records: Vec<NormalizedRecord>,
        store: Arc<dyn CanonicalStore>,
        enricher: Option<Arc<dyn Enricher>>,
        enrich_timeout: Duration,
        workers: usize,
    ) -> Result<ConsolidationSummary, StorageError> {
        let started = std::time::Instant::now();
        let groups = Self::group_by_key(records);
        let group_count = groups.len();

        info!(groups = group_count, workers, "Starting consolidation pass");

        let outcomes: Vec<Result<GroupOutcome, StorageError>> = stream::iter(groups)
            .map(|(key, group)| {
                let store = store.clone();
                let enricher = enricher.clone();
                async move {
                    let _guard = self.lock_key(&key).await;

                    let existing = store.get(&key).await?;
                    let mut entity = self.consolidate(&group, existing.as_ref());

                    let mut enrichment_failed = false;
                    if let Some(enricher) = enricher {
                        match tokio::time::timeout(enrich_timeout, enricher.enrich(&entity)).await
                        {
                            Ok(Ok(patch)) => apply_enrichment_patch(&mut entity, patch),
                            Ok(Err(e)) => {
                                warn!(canonical_key = %key, error = %e, "Enrichment failed, skipping");
                                enrichment_failed = true;
                            },
                            Err(_) => {
                                warn!(canonical_key = %key, "Enrichment timed out, skipping");
                                enrichment_failed = true;
                            },
                        }
                    }

                    store.append_audit(&key, &group).await?;
                    let outcome = store.upsert_merge(entity).await?;

                    debug!(canonical_key = %key, records = group.len(), "Group consolidated");

                    Ok(GroupOutcome {
                        records: group.len() as u64,
                        created: matches!(outcome, UpsertOutcome::Created),
                        enrichment_failed,
                    })
                }
            })
            .buffer_unordered(workers.max(1))
            .collect()
            .await;

        let mut summary = ConsolidationSummary {
            groups_processed: 0,
            entities_created: 0,
            entities_updated: 0,
            records_consolidated: 0,
            enrichment_failures: 0,
            duration_secs: 0.0,
        };

        for outcome in outcomes {
            let outcome = outcome?;
            summary.groups_processed += 1;
            summary.records_consolidated += outcome.records;
            if outcome.created {
                summary.entities_created += 1;
            } else {
                summary.entities_updated += 1;
            }
            if outcome.enrichment_failed {
                summary.enrichment_failures += 1;
            }
        }
        summary.duration_secs = started.elapsed().as_secs_f64();

        info!(
            groups = summary.groups_processed,
            created = summary.entities_created,
            updated = summary.entities_updated,
            "Consolidation pass completed"
        );

        Ok(summary)
    }

    async fn lock_key(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.key_locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

struct GroupOutcome {
    records: u64,
    created: bool,
    enrichment_failed: bool,
}

/// Apply an enrichment patch: strings become scalar fields, string arrays
/// union into set fields, anything else is stored as its JSON rendering
fn apply_enrichment_patch(
    entity: &mut CanonicalEntity,
    patch: HashMap<String, serde_json::Value>,
) {
    for (name, value) in patch {
        match value {
            serde_json::Value::String(s) => {
                entity.fields.insert(name, s);
            },
            serde_json::Value::Array(items) => {
                let values: Vec<String> = items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect();
                let merged = union_case_insensitive(
                    entity.set_fields.get(&name).map(Vec::as_slice).unwrap_or(&[]),
                    values.iter().map(String::as_str),
                );
                entity.set_fields.insert(name, merged);
            },
            other => {
                entity.fields.insert(name, other.to_string());
            },
        }
    }
}

/// Union string values keeping every distinct spelling, deterministically
/// ordered; empty and whitespace-only entries are discarded
pub(crate) fn union_exact<'a>(
    existing: &'a [String],
    new: impl Iterator<Item = &'a str>,
) -> Vec<String> {
    let mut all: Vec<&str> = existing
        .iter()
        .map(String::as_str)
        .chain(new)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect();
    all.sort_by(|a, b| a.to_lowercase().cmp(&b.to_lowercase()).then(a.cmp(b)));
    all.dedup();
    all.into_iter().map(String::from).collect()
}

/// Union string values case-insensitively with a deterministic order
///
/// Empty and whitespace-only entries are discarded; of two casings the
/// lexicographically smaller original form is kept.
pub(crate) fn union_case_insensitive<'a>(
    existing: &'a [String],
    new: impl Iterator<Item = &'a str>,
) -> Vec<String> {
    let mut all: Vec<&str> = existing
        .iter()
        .map(String::as_str)
        .chain(new)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect();
    all.sort_by(|a, b| a.to_lowercase().cmp(&b.to_lowercase()).then(a.cmp(b)));

    let mut result: Vec<String> = Vec::new();
    let mut last_lower: Option<String> = None;
    for value in all {
        let lower = value.to_lowercase();
        if last_lower.as_deref() != Some(lower.as_str()) {
            result.push(value.to_string());
            last_lower = Some(lower);
        }
    }
    result
}

/// Union set-valued fields across all contributors and the existing entity
fn resolve_set_fields(
    contributors: &[NormalizedRecord],
    existing: Option<&CanonicalEntity>,
) -> BTreeMap<String, Vec<String>> {
    let mut names: BTreeSet<&str> = contributors
        .iter()
        .flat_map(|r| r.set_fields.keys().map(String::as_str))
        .collect();
    if let Some(entity) = existing {
        names.extend(entity.set_fields.keys().map(String::as_str));
    }

    let mut resolved = BTreeMap::new();
    for name in names {
        let prior = existing
            .and_then(|e| e.set_fields.get(name))
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let values = union_case_insensitive(
            prior,
            contributors
                .iter()
                .filter_map(|r| r.set_fields.get(name))
                .flat_map(|vs| vs.iter().map(String::as_str)),
        );
        if !values.is_empty() {
            resolved.insert(name.to_string(), values);
        }
    }
    resolved
}
