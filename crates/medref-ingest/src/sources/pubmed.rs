//! PubMed literature source adapter
//!
//! Two-step paging over the NCBI E-utilities: `esearch` resolves the next
//! window of PMIDs for the configured query, `esummary` fetches their
//! summaries. The cursor is the esearch `retstart` offset.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use super::{classify_status, str_list, transport_error, USER_AGENT};
use crate::config::SourceConfig;
use crate::error::{SourceError, ValidationError};
use crate::fetch::{FetchPage, SourceFetcher};
use crate::models::{NormalizedRecord, RawRecord};
use crate::normalize::RecordValidator;

const DEFAULT_QUERY: &str = "drug interactions[MeSH Terms]";

/// Fetcher for PubMed article summaries
pub struct PubMedFetcher {
    client: Client,
    source_id: String,
    base_url: String,
    query: String,
    page_size: usize,
}

impl PubMedFetcher {
    pub fn new(config: &SourceConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            source_id: config.source_id.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            query: config
                .query
                .clone()
                .unwrap_or_else(|| DEFAULT_QUERY.to_string()),
            page_size: config.page_size,
        })
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, SourceError> {
        let response = self.client.get(url).send().await.map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(classify_status(&response));
        }
        response
            .json()
            .await
            .map_err(|e| SourceError::PermanentSource(format!("malformed response body: {}", e)))
    }
}

#[async_trait]
impl SourceFetcher for PubMedFetcher {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> Result<FetchPage, SourceError> {
        let retstart: u64 = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);

        let search_url = format!(
            "{}/entrez/eutils/esearch.fcgi?db=pubmed&retmode=json&term={}&retstart={}&retmax={}",
            self.base_url,
            self.query.replace(' ', "+"),
            retstart,
            self.page_size
        );
        debug!(url = %search_url, "Searching PubMed window");

        let search = self.get_json(&search_url).await?;
        let ids: Vec<String> = search
            .get("esearchresult")
            .and_then(|r| r.get("idlist"))
            .map(str_list)
            .ok_or_else(|| {
                SourceError::PermanentSource("esearch response missing idlist".to_string())
            })?;

        if ids.is_empty() {
            return Ok(FetchPage::default());
        }

        let summary_url = format!(
            "{}/entrez/eutils/esummary.fcgi?db=pubmed&retmode=json&id={}",
            self.base_url,
            ids.join(",")
        );
        debug!(url = %summary_url, "Fetching PubMed summaries");

        let summaries = self.get_json(&summary_url).await?;
        let result = summaries.get("result").ok_or_else(|| {
            SourceError::PermanentSource("esummary response missing result".to_string())
        })?;

        let fetch_time = Utc::now();
        let records: Vec<RawRecord> = ids
            .iter()
            .filter_map(|id| result.get(id))
            .map(|payload| RawRecord {
                source_id: self.source_id.clone(),
                fetch_time,
                payload: payload.clone(),
            })
            .collect();

        let next_cursor = if ids.len() < self.page_size {
            None
        } else {
            Some((retstart + ids.len() as u64).to_string())
        };

        Ok(FetchPage {
            records,
            next_cursor,
        })
    }
}

/// Validator for PubMed summary payloads
pub struct PubMedValidator {
    source_id: String,
    trust_weight: f64,
}

impl PubMedValidator {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            source_id: config.source_id.clone(),
            trust_weight: config.trust_weight,
        }
    }
}

impl RecordValidator for PubMedValidator {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn normalize(&self, raw: &RawRecord) -> Result<NormalizedRecord, ValidationError> {
        let title = raw
            .payload
            .get("title")
            .and_then(|v| v.as_str())
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ValidationError::MissingField("title".to_string()))?;

        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), title.to_string());
        if let Some(journal) = raw.payload.get("fulljournalname").and_then(|v| v.as_str()) {
            fields.insert("journal".to_string(), journal.to_string());
        }
        if let Some(pubdate) = raw.payload.get("pubdate").and_then(|v| v.as_str()) {
            fields.insert("publication_date".to_string(), pubdate.to_string());
        }
        if let Some(uid) = raw.payload.get("uid").and_then(|v| v.as_str()) {
            fields.insert("pubmed_id".to_string(), uid.to_string());
        }

        let mut set_fields = BTreeMap::new();
        if let Some(types) = raw.payload.get("pubtype") {
            let types = str_list(types);
            if !types.is_empty() {
                set_fields.insert("article_types".to_string(), types);
            }
        }
        if let Some(authors) = raw.payload.get("authors").and_then(|v| v.as_array()) {
            let names: Vec<String> = authors
                .iter()
                .filter_map(|a| a.get("name").and_then(|n| n.as_str()).map(String::from))
                .collect();
            if !names.is_empty() {
                set_fields.insert("authors".to_string(), names);
            }
        }

        Ok(NormalizedRecord {
            subject_key: title.to_string(),
            source_id: raw.source_id.clone(),
            source_trust_weight: self.trust_weight,
            fields,
            set_fields,
            fetch_time: raw.fetch_time,
        })
    }
}
