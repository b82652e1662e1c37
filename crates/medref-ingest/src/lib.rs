//! Medref Ingest Library
//!
//! Acquisition and consolidation core for medical reference datasets
//! (drug formulations, diagnostic codes, billing codes, literature records).
//!
//! The pipeline has two halves:
//!
//! 1. **Acquisition** — one [`orchestrator::AcquisitionOrchestrator`] per
//!    source drives a pluggable [`fetch::SourceFetcher`] through a resumable,
//!    rate-limit-aware state machine, persisting progress to a
//!    [`state::StateStore`] after every transition.
//! 2. **Consolidation** — the [`consolidate::ConsolidationEngine`] groups
//!    normalized records by canonical key, resolves field-level conflicts
//!    with source-trust weighting, and writes one canonical entity per
//!    subject through a [`storage::CanonicalStore`], preserving every
//!    contributing record.
//!
//! # Example
//!
//! ```no_run
//! use medref_ingest::config::IngestConfig;
//! use medref_ingest::service::IngestService;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let service = IngestService::builder(config).build_default().await?;
//!     let summary = service.run_source("openfda", false).await?;
//!     println!("fetched {} records", summary.items_fetched);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consolidate;
pub mod enrich;
pub mod error;
pub mod fetch;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod rate_limit;
pub mod service;
pub mod sources;
pub mod state;
pub mod storage;
