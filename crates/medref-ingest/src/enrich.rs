//! Enrichment collaborator interface
//!
//! Enrichment (NLP/LLM post-processing of canonical entities) runs outside
//! this crate. The engine invokes it through [`Enricher`] with a timeout;
//! an unavailable, failing, or slow enricher is counted and skipped, never
//! fatal to consolidation.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::models::CanonicalEntity;

/// External enrichment collaborator
///
/// Returns a patch of field name to value; string values land in the
/// entity's scalar fields, string arrays are unioned into set fields.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(
        &self,
        entity: &CanonicalEntity,
    ) -> anyhow::Result<HashMap<String, serde_json::Value>>;
}

/// Enricher that does nothing, for deployments without an enrichment tier
pub struct NoopEnricher;

#[async_trait]
impl Enricher for NoopEnricher {
    async fn enrich(
        &self,
        _entity: &CanonicalEntity,
    ) -> anyhow::Result<HashMap<String, serde_json::Value>> {
        Ok(HashMap::new())
    }
}
