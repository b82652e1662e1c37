//! openFDA drug-label source adapter
//!
//! Pages through `/drug/label.json` with the skip/limit cursor. Subject
//! identity comes from the generic name, falling back to the brand name;
//! brand names and label warnings land in set-valued fields.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use super::{classify_status, first_str, str_list, transport_error, USER_AGENT};
use crate::config::SourceConfig;
use crate::error::{SourceError, ValidationError};
use crate::fetch::{FetchPage, SourceFetcher};
use crate::models::{NormalizedRecord, RawRecord};
use crate::normalize::RecordValidator;

/// Fetcher for openFDA drug labels
pub struct OpenFdaFetcher {
    client: Client,
    source_id: String,
    base_url: String,
    page_size: usize,
}

impl OpenFdaFetcher {
    pub fn new(config: &SourceConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            source_id: config.source_id.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            page_size: config.page_size,
        })
    }
}

#[async_trait]
impl SourceFetcher for OpenFdaFetcher {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> Result<FetchPage, SourceError> {
        let skip: u64 = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let url = format!(
            "{}/drug/label.json?limit={}&skip={}",
            self.base_url, self.page_size, skip
        );

        debug!(url = %url, "Fetching openFDA page");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(transport_error)?;

        // openFDA answers 404 once skip passes the last result
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(FetchPage::default());
        }
        if !response.status().is_success() {
            return Err(classify_status(&response));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SourceError::PermanentSource(format!("malformed response body: {}", e)))?;

        let results = body
            .get("results")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                SourceError::PermanentSource("response missing 'results' array".to_string())
            })?;

        let fetch_time = Utc::now();
        let records: Vec<RawRecord> = results
            .iter()
            .map(|payload| RawRecord {
                source_id: self.source_id.clone(),
                fetch_time,
                payload: payload.clone(),
            })
            .collect();

        let next_cursor = if records.len() < self.page_size {
            None
        } else {
            Some((skip + records.len() as u64).to_string())
        };

        Ok(FetchPage {
            records,
            next_cursor,
        })
    }
}

/// Validator for openFDA label payloads
pub struct OpenFdaValidator {
    source_id: String,
    trust_weight: f64,
}

impl OpenFdaValidator {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            source_id: config.source_id.clone(),
            trust_weight: config.trust_weight,
        }
    }
}

impl RecordValidator for OpenFdaValidator {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn normalize(&self, raw: &RawRecord) -> Result<NormalizedRecord, ValidationError> {
        let openfda = raw.payload.get("openfda");

        let generic = openfda
            .and_then(|o| o.get("generic_name"))
            .and_then(first_str);
        let brand = openfda
            .and_then(|o| o.get("brand_name"))
            .and_then(first_str);

        let subject_key = generic
            .or(brand)
            .ok_or_else(|| ValidationError::MissingField("openfda.generic_name".to_string()))?
            .to_string();

        let mut fields = BTreeMap::new();
        if let Some(desc) = raw.payload.get("description").and_then(first_str) {
            fields.insert("description".to_string(), desc.to_string());
        }
        if let Some(indications) = raw
            .payload
            .get("indications_and_usage")
            .and_then(first_str)
        {
            fields.insert("indications".to_string(), indications.to_string());
        }
        if let Some(route) = openfda.and_then(|o| o.get("route")).and_then(first_str) {
            fields.insert("route".to_string(), route.to_string());
        }
        if let Some(manufacturer) = openfda
            .and_then(|o| o.get("manufacturer_name"))
            .and_then(first_str)
        {
            fields.insert("manufacturer".to_string(), manufacturer.to_string());
        }

        let mut set_fields = BTreeMap::new();
        if let Some(brands) = openfda.and_then(|o| o.get("brand_name")) {
            let brands = str_list(brands);
            if !brands.is_empty() {
                set_fields.insert("brand_names".to_string(), brands);
            }
        }
        if let Some(warnings) = raw.payload.get("warnings") {
            let warnings = str_list(warnings);
            if !warnings.is_empty() {
                set_fields.insert("warnings".to_string(), warnings);
            }
        }

        Ok(NormalizedRecord {
            subject_key,
            source_id: raw.source_id.clone(),
            source_trust_weight: self.trust_weight,
            fields,
            set_fields,
            fetch_time: raw.fetch_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;

    fn validator() -> OpenFdaValidator {
        let config = IngestConfig::default();
        OpenFdaValidator::new(config.source("openfda").unwrap())
    }

    fn raw(payload: serde_json::Value) -> RawRecord {
        RawRecord {
            source_id: "openfda".to_string(),
            fetch_time: Utc::now(),
            payload,
        }
    }

    #[test]
    fn test_normalize_full_label() {
        let record = raw(serde_json::json!({
            "description": ["Metformin hydrochloride is an oral antihyperglycemic agent."],
            "indications_and_usage": ["Adjunct to diet and exercise in type 2 diabetes."],
            "warnings": ["Lactic acidosis", "Renal impairment"],
            "openfda": {
                "generic_name": ["METFORMIN HYDROCHLORIDE"],
                "brand_name": ["Glucophage"],
                "route": ["ORAL"],
                "manufacturer_name": ["Example Pharma"]
            }
        }));

        let normalized = validator().normalize(&record).unwrap();
        assert_eq!(normalized.subject_key, "METFORMIN HYDROCHLORIDE");
        assert!(normalized
            .fields
            .get("description")
            .unwrap()
            .starts_with("Metformin"));
        assert_eq!(normalized.fields.get("route").unwrap(), "ORAL");
        assert_eq!(
            normalized.set_fields.get("brand_names").unwrap(),
            &vec!["Glucophage".to_string()]
        );
        assert_eq!(normalized.set_fields.get("warnings").unwrap().len(), 2);
    }

    #[test]
    fn test_normalize_falls_back_to_brand_name() {
        let record = raw(serde_json::json!({
            "openfda": { "brand_name": ["Tylenol"] }
        }));

        let normalized = validator().normalize(&record).unwrap();
        assert_eq!(normalized.subject_key, "Tylenol");
    }

    #[test]
    fn test_normalize_rejects_nameless_label() {
        let record = raw(serde_json::json!({ "description": ["orphan label"] }));
        assert!(matches!(
            validator().normalize(&record),
            Err(ValidationError::MissingField(_))
        ));
    }
}
