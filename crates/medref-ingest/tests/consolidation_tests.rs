//! End-to-end tests for the consolidation engine and hybrid storage
//!
//! These validate the core guarantees of consolidation:
//! - Zero data loss regardless of batching order
//! - Deterministic resolution (pure function behavior)
//! - Confidence-gated upsert-merge in storage
//! - Enrichment failures never block consolidation

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use medref_ingest::config::ResolutionConfig;
use medref_ingest::consolidate::ConsolidationEngine;
use medref_ingest::enrich::Enricher;
use medref_ingest::models::{CanonicalEntity, NormalizedRecord};
use medref_ingest::storage::{CanonicalStore, InMemoryCanonicalStore};

fn record(source: &str, subject: &str, trust: f64, desc: &str) -> NormalizedRecord {
    let mut fields = BTreeMap::new();
    if !desc.is_empty() {
        fields.insert("description".to_string(), desc.to_string());
    }
    NormalizedRecord {
        subject_key: subject.to_string(),
        source_id: source.to_string(),
        source_trust_weight: trust,
        fields,
        set_fields: BTreeMap::new(),
        fetch_time: Utc.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).unwrap(),
    }
}

fn engine() -> ConsolidationEngine {
    ConsolidationEngine::new(ResolutionConfig::default())
}

async fn consolidate_batches(
    batches: Vec<Vec<NormalizedRecord>>,
) -> (Arc<InMemoryCanonicalStore>, u64) {
    let engine = engine();
    let store = Arc::new(InMemoryCanonicalStore::new());
    let mut enrichment_failures = 0;

    for batch in batches {
        let summary = engine
            .run(
                batch,
                store.clone() as Arc<dyn CanonicalStore>,
                None,
                Duration::from_secs(5),
                4,
            )
            .await
            .unwrap();
        enrichment_failures += summary.enrichment_failures;
    }

    (store, enrichment_failures)
}

// ============================================================================
// Data Preservation
// ============================================================================

#[tokio::test]
async fn test_no_data_loss_regardless_of_batching() {
    let records = vec![
        record("x", "Drug A", 0.4, "short"),
        record("y", "Drug A", 0.9, "a considerably longer clinical description"),
        record("z", "drug a", 0.5, ""),
    ];

    // One batch
    let (single, _) = consolidate_batches(vec![records.clone()]).await;
    let entity = single.get("drug a").await.unwrap().unwrap();
    assert_eq!(entity.contributing_records.len(), 3);

    // Record-at-a-time, reversed order
    let mut reversed = records.clone();
    reversed.reverse();
    let (one_by_one, _) =
        consolidate_batches(reversed.into_iter().map(|r| vec![r]).collect()).await;
    let entity = one_by_one.get("drug a").await.unwrap().unwrap();
    assert_eq!(entity.contributing_records.len(), 3);

    // Re-running the same batch adds nothing
    let (rerun, _) = consolidate_batches(vec![records.clone(), records]).await;
    let entity = rerun.get("drug a").await.unwrap().unwrap();
    assert_eq!(entity.contributing_records.len(), 3);
    assert_eq!(entity.total_contributors, 3);
}

#[tokio::test]
async fn test_resolution_stable_across_batching_orders() {
    let records = vec![
        record("x", "Drug A", 0.4, "short"),
        record("y", "Drug A", 0.9, "a considerably longer clinical description"),
        record("z", "drug a", 0.5, ""),
    ];

    let (single, _) = consolidate_batches(vec![records.clone()]).await;
    let (split, _) = consolidate_batches(vec![records[..1].to_vec(), records[1..].to_vec()]).await;

    let a = single.get("drug a").await.unwrap().unwrap();
    let b = split.get("drug a").await.unwrap().unwrap();

    // Field resolution converges on the same values either way
    assert_eq!(a.fields, b.fields);
    assert_eq!(
        a.fields.get("description").unwrap(),
        "a considerably longer clinical description"
    );
    assert_eq!(a.aliases, b.aliases);
}

#[tokio::test]
async fn test_audit_log_keeps_every_arrival() {
    let records = vec![
        record("x", "Drug A", 0.4, "short"),
        record("y", "Drug A", 0.9, "longer"),
    ];

    // The same records consolidated twice: contributors dedup, audit does not
    let (store, _) = consolidate_batches(vec![records.clone(), records]).await;

    assert_eq!(store.audit_for("drug a").await.len(), 4);
    let entity = store.get("drug a").await.unwrap().unwrap();
    assert_eq!(entity.contributing_records.len(), 2);
}

// ============================================================================
// Storage Merge Semantics
// ============================================================================

#[tokio::test]
async fn test_weaker_late_writer_does_not_clobber_resolution() {
    let engine = engine();
    let store = Arc::new(InMemoryCanonicalStore::new());

    // Strong two-source group first
    engine
        .run(
            vec![
                record("x", "Drug A", 0.9, "authoritative description"),
                record("y", "Drug A", 0.8, "secondary description"),
            ],
            store.clone() as Arc<dyn CanonicalStore>,
            None,
            Duration::from_secs(5),
            2,
        )
        .await
        .unwrap();

    let strong = store.get("drug a").await.unwrap().unwrap();

    // A single weak contributor arrives later as its own batch
    engine
        .run(
            vec![record("z", "Drug A", 0.2, "weak description")],
            store.clone() as Arc<dyn CanonicalStore>,
            None,
            Duration::from_secs(5),
            2,
        )
        .await
        .unwrap();

    let merged = store.get("drug a").await.unwrap().unwrap();

    // The weak record is preserved but cannot weaken the entity
    assert_eq!(merged.contributing_records.len(), 3);
    assert!(merged.confidence_score >= strong.confidence_score);
    assert_eq!(
        merged.fields.get("description").unwrap(),
        "authoritative description"
    );
}

#[tokio::test]
async fn test_entities_marked_for_reindex() {
    let (store, _) = consolidate_batches(vec![vec![
        record("x", "Drug A", 0.5, "desc"),
        record("x", "Warfarin", 0.5, "desc"),
    ]])
    .await;

    assert_eq!(
        store.pending_reindex().await.unwrap(),
        vec!["drug a".to_string(), "warfarin".to_string()]
    );
}

// ============================================================================
// Enrichment Collaborator
// ============================================================================

struct FailingEnricher;

#[async_trait]
impl Enricher for FailingEnricher {
    async fn enrich(
        &self,
        _entity: &CanonicalEntity,
    ) -> anyhow::Result<HashMap<String, serde_json::Value>> {
        anyhow::bail!("enrichment tier unavailable")
    }
}

struct SlowEnricher;

#[async_trait]
impl Enricher for SlowEnricher {
    async fn enrich(
        &self,
        _entity: &CanonicalEntity,
    ) -> anyhow::Result<HashMap<String, serde_json::Value>> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(HashMap::new())
    }
}

#[tokio::test]
async fn test_failing_enricher_never_blocks_consolidation() {
    let engine = engine();
    let store = Arc::new(InMemoryCanonicalStore::new());

    let summary = engine
        .run(
            vec![record("x", "Drug A", 0.5, "desc")],
            store.clone() as Arc<dyn CanonicalStore>,
            Some(Arc::new(FailingEnricher)),
            Duration::from_secs(5),
            2,
        )
        .await
        .unwrap();

    assert_eq!(summary.enrichment_failures, 1);
    assert_eq!(summary.entities_created, 1);
    assert!(store.get("drug a").await.unwrap().is_some());
}

#[tokio::test]
async fn test_slow_enricher_times_out_and_is_skipped() {
    let engine = engine();
    let store = Arc::new(InMemoryCanonicalStore::new());

    let summary = engine
        .run(
            vec![record("x", "Drug A", 0.5, "desc")],
            store.clone() as Arc<dyn CanonicalStore>,
            Some(Arc::new(SlowEnricher)),
            Duration::from_millis(50),
            2,
        )
        .await
        .unwrap();

    assert_eq!(summary.enrichment_failures, 1);
    assert!(store.get("drug a").await.unwrap().is_some());
}

#[tokio::test]
async fn test_enricher_patch_lands_on_entity() {
    struct PatchingEnricher;

    #[async_trait]
    impl Enricher for PatchingEnricher {
        async fn enrich(
            &self,
            _entity: &CanonicalEntity,
        ) -> anyhow::Result<HashMap<String, serde_json::Value>> {
            let mut patch = HashMap::new();
            patch.insert(
                "drug_class".to_string(),
                serde_json::Value::String("biguanide".to_string()),
            );
            Ok(patch)
        }
    }

    let engine = engine();
    let store = Arc::new(InMemoryCanonicalStore::new());

    engine
        .run(
            vec![record("x", "Metformin", 0.5, "desc")],
            store.clone() as Arc<dyn CanonicalStore>,
            Some(Arc::new(PatchingEnricher)),
            Duration::from_secs(5),
            2,
        )
        .await
        .unwrap();

    let entity = store.get("metformin").await.unwrap().unwrap();
    assert_eq!(entity.fields.get("drug_class").unwrap(), "biguanide");
}
