//! Source fetch adapter interface
//!
//! One [`SourceFetcher`] implementation per upstream source. The adapter
//! owns the wire format; the orchestrator owns pacing, retries, and resume
//! state. Adapters signal rate limits and categorize failures through
//! [`crate::error::SourceError`] rather than reacting to them.

use async_trait::async_trait;

use crate::error::SourceError;
use crate::models::RawRecord;

/// One page of raw records plus the cursor for the next page
#[derive(Debug, Clone, Default)]
pub struct FetchPage {
    pub records: Vec<RawRecord>,
    /// `None` when the source is drained
    pub next_cursor: Option<String>,
}

/// Pluggable per-source page fetcher
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Stable identifier matching the source's configuration entry
    fn source_id(&self) -> &str;

    /// Retrieve the page at `cursor` (`None` for the first page)
    ///
    /// Implementations must be stateless with respect to paging: the same
    /// cursor always addresses the same page, which is what makes resume
    /// idempotent.
    async fn fetch_page(&self, cursor: Option<&str>) -> Result<FetchPage, SourceError>;
}
