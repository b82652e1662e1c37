//! Ingestion configuration
//!
//! Typed, validated configuration for the acquisition orchestrator and the
//! consolidation engine, loaded from environment variables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Main ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Directory for per-source resume state files
    pub state_dir: PathBuf,
    /// Overall deadline for one source run in seconds
    pub run_deadline_secs: u64,
    /// Bounded concurrency for consolidation groups
    pub consolidation_workers: usize,
    /// Timeout for one enrichment call in seconds
    pub enrich_timeout_secs: u64,
    /// Per-source configuration
    pub sources: Vec<SourceConfig>,
    /// Conflict-resolution and confidence weighting
    pub resolution: ResolutionConfig,
}

/// Configuration for one upstream source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Stable identifier, lowercase alphanumeric plus `_`/`-`
    pub source_id: String,
    /// Base URL of the upstream API
    pub base_url: String,
    /// Optional query restricting what the source fetches (literature sources)
    pub query: Option<String>,
    /// 0.0-1.0 authority weight used by conflict resolution
    pub trust_weight: f64,
    /// Records requested per page
    pub page_size: usize,
    /// Requests allowed per rate-limit window
    pub rate_limit_requests: u32,
    /// Rate-limit window in seconds
    pub rate_limit_window_secs: u64,
    /// Cool-down after the source signals a rate limit, in seconds
    pub cooldown_secs: u64,
    /// Fixed delay before retrying a transient network error, in seconds
    pub transient_retry_delay_secs: u64,
    /// Bounded attempts for transient network errors
    pub max_transient_retries: u32,
    /// Daily ceiling on rate-limited retry attempts
    pub max_daily_retries: u32,
    /// HTTP request timeout in seconds
    pub timeout_secs: u64,
}

impl SourceConfig {
    /// Validate one source entry
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.source_id.is_empty() {
            anyhow::bail!("source_id cannot be empty");
        }
        if !self
            .source_id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            anyhow::bail!(
                "source_id must be lowercase alphanumeric with '_'/'-', got: {}",
                self.source_id
            );
        }
        if self.base_url.is_empty() {
            anyhow::bail!("base_url cannot be empty for source {}", self.source_id);
        }
        if !(0.0..=1.0).contains(&self.trust_weight) {
            anyhow::bail!(
                "trust_weight must be within 0.0-1.0 for source {}, got: {}",
                self.source_id,
                self.trust_weight
            );
        }
        if self.page_size == 0 {
            anyhow::bail!("page_size must be greater than 0 for source {}", self.source_id);
        }
        if self.rate_limit_requests == 0 {
            anyhow::bail!(
                "rate_limit_requests must be greater than 0 for source {}",
                self.source_id
            );
        }
        if self.max_daily_retries == 0 {
            anyhow::bail!(
                "max_daily_retries must be greater than 0 for source {}",
                self.source_id
            );
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn transient_retry_delay(&self) -> Duration {
        Duration::from_secs(self.transient_retry_delay_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Weighting for field resolution and confidence scoring
///
/// The literal defaults mirror the historical formula; nothing in the
/// engine assumes them, so operators may rebalance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionConfig {
    /// Weight of source diversity in the confidence score
    pub diversity_weight: f64,
    /// Weight of average field completeness in the confidence score
    pub completeness_weight: f64,
    /// Weight of average source trust in the confidence score
    pub trust_weight: f64,
    /// Number of distinct sources at which diversity saturates
    pub diversity_cap: u32,
    /// Scalar fields resolved by `len(value) * trust` instead of trust alone
    pub prefer_longest_fields: BTreeSet<String>,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        let prefer_longest_fields = [
            "description",
            "indications",
            "clinical_notes",
            "abstract",
            "dosage",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        Self {
            diversity_weight: 0.3,
            completeness_weight: 0.4,
            trust_weight: 0.3,
            diversity_cap: 3,
            prefer_longest_fields,
        }
    }
}

impl ResolutionConfig {
    /// Validate weighting invariants
    pub fn validate(&self) -> anyhow::Result<()> {
        let sum = self.diversity_weight + self.completeness_weight + self.trust_weight;
        if (sum - 1.0).abs() > 1e-6 {
            anyhow::bail!("resolution weights must sum to 1.0, got: {}", sum);
        }
        if self.diversity_cap == 0 {
            anyhow::bail!("diversity_cap must be greater than 0");
        }
        Ok(())
    }
}

impl IngestConfig {
    /// Load ingestion configuration from environment variables
    ///
    /// Environment variables:
    /// - `MEDREF_STATE_DIR`: directory for resume state files
    /// - `MEDREF_RUN_DEADLINE_SECS`: per-run deadline
    /// - `MEDREF_CONSOLIDATION_WORKERS`: consolidation pool size
    /// - `MEDREF_ENRICH_TIMEOUT_SECS`: enrichment call timeout
    /// - `MEDREF_OPENFDA_*` / `MEDREF_PUBMED_*`: per-source overrides
    ///   (BASE_URL, TRUST_WEIGHT, PAGE_SIZE, COOLDOWN_SECS, MAX_DAILY_RETRIES)
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            state_dir: std::env::var("MEDREF_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/state")),
            run_deadline_secs: env_parse("MEDREF_RUN_DEADLINE_SECS", 3600),
            consolidation_workers: env_parse("MEDREF_CONSOLIDATION_WORKERS", 5),
            enrich_timeout_secs: env_parse("MEDREF_ENRICH_TIMEOUT_SECS", 30),
            sources: vec![
                source_from_env("openfda", "https://api.fda.gov", 0.9),
                source_from_env("pubmed", "https://eutils.ncbi.nlm.nih.gov", 0.7),
            ],
            resolution: ResolutionConfig::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.run_deadline_secs == 0 {
            anyhow::bail!("MEDREF_RUN_DEADLINE_SECS must be greater than 0");
        }
        if self.consolidation_workers == 0 {
            anyhow::bail!("MEDREF_CONSOLIDATION_WORKERS must be greater than 0");
        }
        let mut seen = BTreeSet::new();
        for source in &self.sources {
            source.validate()?;
            if !seen.insert(&source.source_id) {
                anyhow::bail!("duplicate source_id: {}", source.source_id);
            }
        }
        self.resolution.validate()?;
        Ok(())
    }

    /// Look up a source by id
    pub fn source(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.run_deadline_secs)
    }

    pub fn enrich_timeout(&self) -> Duration {
        Duration::from_secs(self.enrich_timeout_secs)
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("./data/state"),
            run_deadline_secs: 3600,
            consolidation_workers: 5,
            enrich_timeout_secs: 30,
            sources: vec![
                source_defaults("openfda", "https://api.fda.gov", 0.9),
                source_defaults("pubmed", "https://eutils.ncbi.nlm.nih.gov", 0.7),
            ],
            resolution: ResolutionConfig::default(),
        }
    }
}

fn source_defaults(source_id: &str, base_url: &str, trust_weight: f64) -> SourceConfig {
    SourceConfig {
        source_id: source_id.to_string(),
        base_url: base_url.to_string(),
        query: None,
        trust_weight,
        page_size: 100,
        rate_limit_requests: 40,
        rate_limit_window_secs: 60,
        cooldown_secs: 60,
        transient_retry_delay_secs: 5,
        max_transient_retries: 3,
        max_daily_retries: 10,
        timeout_secs: 30,
    }
}

fn source_from_env(source_id: &str, default_base_url: &str, default_trust: f64) -> SourceConfig {
    let prefix = format!("MEDREF_{}", source_id.to_uppercase());
    let mut config = source_defaults(source_id, default_base_url, default_trust);

    if let Ok(url) = std::env::var(format!("{}_BASE_URL", prefix)) {
        config.base_url = url;
    }
    if let Ok(query) = std::env::var(format!("{}_QUERY", prefix)) {
        config.query = Some(query);
    }
    config.trust_weight = env_parse(&format!("{}_TRUST_WEIGHT", prefix), config.trust_weight);
    config.page_size = env_parse(&format!("{}_PAGE_SIZE", prefix), config.page_size);
    config.cooldown_secs = env_parse(&format!("{}_COOLDOWN_SECS", prefix), config.cooldown_secs);
    config.max_daily_retries = env_parse(
        &format!("{}_MAX_DAILY_RETRIES", prefix),
        config.max_daily_retries,
    );

    config
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_config_default() {
        let config = IngestConfig::default();
        assert_eq!(config.consolidation_workers, 5);
        assert_eq!(config.sources.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_source_lookup() {
        let config = IngestConfig::default();
        assert!(config.source("openfda").is_some());
        assert!(config.source("unknown").is_none());
    }

    #[test]
    fn test_source_validation_bad_trust_weight() {
        let mut source = source_defaults("openfda", "https://api.fda.gov", 0.9);
        source.trust_weight = 1.5;
        assert!(source.validate().is_err());
    }

    #[test]
    fn test_source_validation_bad_id() {
        let mut source = source_defaults("openfda", "https://api.fda.gov", 0.9);
        source.source_id = "Open FDA".to_string();
        assert!(source.validate().is_err());
    }

    #[test]
    fn test_source_validation_zero_page_size() {
        let mut source = source_defaults("openfda", "https://api.fda.gov", 0.9);
        source.page_size = 0;
        assert!(source.validate().is_err());
    }

    #[test]
    fn test_duplicate_source_ids_rejected() {
        let mut config = IngestConfig::default();
        config
            .sources
            .push(source_defaults("openfda", "https://api.fda.gov", 0.5));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolution_weights_must_sum_to_one() {
        let mut resolution = ResolutionConfig::default();
        resolution.trust_weight = 0.5;
        assert!(resolution.validate().is_err());
    }

    #[test]
    fn test_duration_accessors() {
        let source = source_defaults("openfda", "https://api.fda.gov", 0.9);
        assert_eq!(source.cooldown(), Duration::from_secs(60));
        assert_eq!(source.transient_retry_delay(), Duration::from_secs(5));

        let config = IngestConfig::default();
        assert_eq!(config.run_deadline(), Duration::from_secs(3600));
    }
}
