//! Ingest service: the trigger surface
//!
//! Owns the per-source registry (fetcher + validator + orchestrator), the
//! shared state store, the staging buffer of normalized records, and the
//! consolidation engine. External callers (the CLI here, an HTTP handler
//! elsewhere) invoke `run_source` / `run_consolidation` and read the
//! summaries.

use anyhow::{Context, Result};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::IngestConfig;
use crate::consolidate::ConsolidationEngine;
use crate::enrich::Enricher;
use crate::fetch::SourceFetcher;
use crate::models::{ConsolidationSummary, NormalizedRecord, RunSummary};
use crate::normalize::RecordValidator;
use crate::orchestrator::AcquisitionOrchestrator;
use crate::sources::{OpenFdaFetcher, OpenFdaValidator, PubMedFetcher, PubMedValidator};
use crate::state::{DownloadState, FileStateStore, InMemoryStateStore, StateStore};
use crate::storage::{CanonicalStore, InMemoryCanonicalStore, PostgresCanonicalStore};

struct SourceRuntime {
    orchestrator: AcquisitionOrchestrator,
    fetcher: Arc<dyn SourceFetcher>,
    validator: Arc<dyn RecordValidator>,
}

/// Facade over acquisition and consolidation for all registered sources
pub struct IngestService {
    config: IngestConfig,
    sources: BTreeMap<String, SourceRuntime>,
    state_store: Arc<dyn StateStore>,
    canonical_store: Arc<dyn CanonicalStore>,
    engine: ConsolidationEngine,
    enricher: Option<Arc<dyn Enricher>>,
    staged: Mutex<Vec<NormalizedRecord>>,
    cancel: CancellationToken,
}

impl IngestService {
    /// Start building a service around a configuration
    pub fn builder(config: IngestConfig) -> IngestServiceBuilder {
        IngestServiceBuilder {
            config,
            state_store: None,
            canonical_store: None,
            enricher: None,
            registrations: Vec::new(),
        }
    }

    /// Run acquisition for one source
    pub async fn run_source(&self, source_id: &str, force_fresh: bool) -> Result<RunSummary> {
        let runtime = self
            .sources
            .get(source_id)
            .with_context(|| format!("Unknown source: {}", source_id))?;

        info!(source_id = %source_id, force_fresh, "Starting source run");

        let output = runtime
            .orchestrator
            .run(
                runtime.fetcher.as_ref(),
                runtime.validator.as_ref(),
                force_fresh,
                &self.cancel,
            )
            .await?;

        self.staged.lock().await.extend(output.records);

        info!(
            source_id = %source_id,
            status = output.summary.final_status.as_str(),
            fetched = output.summary.items_fetched,
            valid = output.summary.items_valid,
            rejected = output.summary.items_rejected,
            "Source run finished"
        );

        Ok(output.summary)
    }

    /// Run acquisition for every registered source concurrently
    ///
    /// Sources run in parallel; each source's own pages stay sequential
    /// inside its orchestrator.
    pub async fn run_all(&self, force_fresh: bool) -> Vec<Result<RunSummary>> {
        let source_ids: Vec<String> = self.sources.keys().cloned().collect();
        join_all(
            source_ids
                .iter()
                .map(|id| self.run_source(id, force_fresh)),
        )
        .await
    }

    /// Consolidate staged records into canonical entities
    ///
    /// With an empty `source_ids` filter, everything staged is consolidated;
    /// otherwise records from other sources stay staged for a later pass.
    pub async fn run_consolidation(&self, source_ids: &[String]) -> Result<ConsolidationSummary> {
        let batch = {
            let mut staged = self.staged.lock().await;
            if source_ids.is_empty() {
                std::mem::take(&mut *staged)
            } else {
                let (selected, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut *staged)
                    .into_iter()
                    .partition(|r| source_ids.contains(&r.source_id));
                *staged = rest;
                selected
            }
        };

        info!(records = batch.len(), "Starting consolidation");

        let summary = self
            .engine
            .run(
                batch,
                self.canonical_store.clone(),
                self.enricher.clone(),
                self.config.enrich_timeout(),
                self.config.consolidation_workers,
            )
            .await
            .context("Consolidation pass failed")?;

        Ok(summary)
    }

    /// Current persisted state of one source, if it has ever run
    pub async fn source_state(&self, source_id: &str) -> Result<Option<DownloadState>> {
        Ok(self
            .state_store
            .load(source_id)
            .await
            .with_context(|| format!("Failed to load state for {}", source_id))?)
    }

    /// Operator reset: discard the persisted download state of a source
    pub async fn reset_source(&self, source_id: &str) -> Result<()> {
        self.state_store
            .delete(source_id)
            .await
            .with_context(|| format!("Failed to reset state for {}", source_id))?;
        info!(source_id = %source_id, "Download state reset");
        Ok(())
    }

    /// Signal every in-flight run to stop at the next cancellable point
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Number of records staged and awaiting consolidation
    pub async fn staged_len(&self) -> usize {
        self.staged.lock().await.len()
    }

    /// Canonical store handle, for read access by callers
    pub fn canonical_store(&self) -> Arc<dyn CanonicalStore> {
        self.canonical_store.clone()
    }
}

/// Builder wiring stores, enricher, and source adapters into a service
pub struct IngestServiceBuilder {
    config: IngestConfig,
    state_store: Option<Arc<dyn StateStore>>,
    canonical_store: Option<Arc<dyn CanonicalStore>>,
    enricher: Option<Arc<dyn Enricher>>,
    registrations: Vec<(String, Arc<dyn SourceFetcher>, Arc<dyn RecordValidator>)>,
}

impl IngestServiceBuilder {
    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn canonical_store(mut self, store: Arc<dyn CanonicalStore>) -> Self {
        self.canonical_store = Some(store);
        self
    }

    pub fn enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// Register a source adapter pair; its id must exist in the config
    pub fn register(
        mut self,
        source_id: &str,
        fetcher: Arc<dyn SourceFetcher>,
        validator: Arc<dyn RecordValidator>,
    ) -> Self {
        self.registrations
            .push((source_id.to_string(), fetcher, validator));
        self
    }

    /// Build with the explicitly registered sources
    pub fn build(self) -> Result<IngestService> {
        let state_store = match self.state_store {
            Some(store) => store,
            None => Arc::new(InMemoryStateStore::new()) as Arc<dyn StateStore>,
        };
        let canonical_store = self
            .canonical_store
            .unwrap_or_else(|| Arc::new(InMemoryCanonicalStore::new()) as Arc<dyn CanonicalStore>);

        let mut sources = BTreeMap::new();
        for (source_id, fetcher, validator) in self.registrations {
            let source_config = self
                .config
                .source(&source_id)
                .with_context(|| format!("No configuration for source: {}", source_id))?
                .clone();

            let orchestrator = AcquisitionOrchestrator::new(
                source_config,
                self.config.run_deadline(),
                state_store.clone(),
            );

            sources.insert(
                source_id,
                SourceRuntime {
                    orchestrator,
                    fetcher,
                    validator,
                },
            );
        }

        let engine = ConsolidationEngine::new(self.config.resolution.clone());

        Ok(IngestService {
            sources,
            state_store,
            canonical_store,
            engine,
            enricher: self.enricher,
            staged: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            config: self.config,
        })
    }

    /// Build with the built-in adapters for every configured source,
    /// file-backed resume state, and PostgreSQL canonical storage when
    /// `DATABASE_URL` is set
    pub async fn build_default(mut self) -> Result<IngestService> {
        if self.state_store.is_none() {
            let store = FileStateStore::new(&self.config.state_dir)
                .context("Failed to open state directory")?;
            self.state_store = Some(Arc::new(store));
        }

        if self.canonical_store.is_none() {
            self.canonical_store = match std::env::var("DATABASE_URL") {
                Ok(url) => {
                    let store = PostgresCanonicalStore::connect(&url)
                        .await
                        .context("Failed to connect to canonical storage")?;
                    Some(Arc::new(store) as Arc<dyn CanonicalStore>)
                },
                Err(_) => {
                    tracing::warn!(
                        "DATABASE_URL not set, canonical entities will not be persisted"
                    );
                    Some(Arc::new(InMemoryCanonicalStore::new()) as Arc<dyn CanonicalStore>)
                },
            };
        }

        for source in self.config.sources.clone() {
            match source.source_id.as_str() {
                "openfda" => {
                    let fetcher = OpenFdaFetcher::new(&source)?;
                    self = self.register(
                        "openfda",
                        Arc::new(fetcher),
                        Arc::new(OpenFdaValidator::new(&source)),
                    );
                },
                "pubmed" => {
                    let fetcher = PubMedFetcher::new(&source)?;
                    self = self.register(
                        "pubmed",
                        Arc::new(fetcher),
                        Arc::new(PubMedValidator::new(&source)),
                    );
                },
                other => {
                    anyhow::bail!("No built-in adapter for source: {}", other);
                },
            }
        }

        self.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SourceError, ValidationError};
    use crate::fetch::FetchPage;
    use crate::models::RawRecord;
    use async_trait::async_trait;
    use std::collections::BTreeMap as Map;

    struct OnePageFetcher {
        source_id: String,
    }

    #[async_trait]
    impl SourceFetcher for OnePageFetcher {
        fn source_id(&self) -> &str {
            &self.source_id
        }

        async fn fetch_page(&self, _cursor: Option<&str>) -> Result<FetchPage, SourceError> {
            Ok(FetchPage {
                records: vec![RawRecord {
                    source_id: self.source_id.clone(),
                    fetch_time: chrono::Utc::now(),
                    payload: serde_json::json!({ "name": "Drug A", "desc": "a description" }),
                }],
                next_cursor: None,
            })
        }
    }

    struct SimpleValidator {
        source_id: String,
        trust: f64,
    }

    impl RecordValidator for SimpleValidator {
        fn source_id(&self) -> &str {
            &self.source_id
        }

        fn normalize(&self, raw: &RawRecord) -> Result<NormalizedRecord, ValidationError> {
            let name = raw
                .payload
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ValidationError::MissingField("name".to_string()))?;
            let mut fields = Map::new();
            if let Some(desc) = raw.payload.get("desc").and_then(|v| v.as_str()) {
                fields.insert("description".to_string(), desc.to_string());
            }
            Ok(NormalizedRecord {
                subject_key: name.to_string(),
                source_id: raw.source_id.clone(),
                source_trust_weight: self.trust,
                fields,
                set_fields: Map::new(),
                fetch_time: raw.fetch_time,
            })
        }
    }

    fn service() -> IngestService {
        let config = IngestConfig::default();
        IngestService::builder(config)
            .register(
                "openfda",
                Arc::new(OnePageFetcher {
                    source_id: "openfda".to_string(),
                }),
                Arc::new(SimpleValidator {
                    source_id: "openfda".to_string(),
                    trust: 0.9,
                }),
            )
            .register(
                "pubmed",
                Arc::new(OnePageFetcher {
                    source_id: "pubmed".to_string(),
                }),
                Arc::new(SimpleValidator {
                    source_id: "pubmed".to_string(),
                    trust: 0.7,
                }),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_source_stages_records() {
        let service = service();
        let summary = service.run_source("openfda", false).await.unwrap();
        assert_eq!(summary.items_valid, 1);
        assert_eq!(service.staged_len().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_source_rejected() {
        let service = service();
        assert!(service.run_source("nonexistent", false).await.is_err());
    }

    #[tokio::test]
    async fn test_consolidation_drains_staging() {
        let service = service();
        service.run_source("openfda", false).await.unwrap();
        service.run_source("pubmed", false).await.unwrap();
        assert_eq!(service.staged_len().await, 2);

        let summary = service.run_consolidation(&[]).await.unwrap();
        assert_eq!(summary.records_consolidated, 2);
        // Both sources supplied the same subject
        assert_eq!(summary.groups_processed, 1);
        assert_eq!(summary.entities_created, 1);
        assert_eq!(service.staged_len().await, 0);
    }

    #[tokio::test]
    async fn test_consolidation_filter_keeps_other_sources_staged() {
        let service = service();
        service.run_source("openfda", false).await.unwrap();
        service.run_source("pubmed", false).await.unwrap();

        let summary = service
            .run_consolidation(&["openfda".to_string()])
            .await
            .unwrap();
        assert_eq!(summary.records_consolidated, 1);
        assert_eq!(service.staged_len().await, 1);
    }

    #[tokio::test]
    async fn test_reset_source_clears_state() {
        let service = service();
        service.run_source("openfda", false).await.unwrap();
        assert!(service.source_state("openfda").await.unwrap().is_some());

        service.reset_source("openfda").await.unwrap();
        assert!(service.source_state("openfda").await.unwrap().is_none());
    }
}
