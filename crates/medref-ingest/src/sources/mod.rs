//! Built-in source fetch adapters
//!
//! One module per upstream source. Adapters translate wire-level failures
//! into the orchestrator's error taxonomy: HTTP 429 is a rate-limit
//! signal, 5xx and transport errors are transient, auth and schema
//! problems are permanent.

mod openfda;
mod pubmed;

pub use openfda::{OpenFdaFetcher, OpenFdaValidator};
pub use pubmed::{PubMedFetcher, PubMedValidator};

use std::time::Duration;

use crate::error::SourceError;

/// User agent sent to every upstream source
pub(crate) const USER_AGENT: &str = "medref-ingest/0.1";

/// Categorize a non-success HTTP response
pub(crate) fn classify_status(response: &reqwest::Response) -> SourceError {
    let status = response.status();

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        return SourceError::RateLimited { retry_after };
    }

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return SourceError::PermanentSource(format!("authentication rejected: {}", status));
    }

    if status.is_server_error() {
        return SourceError::TransientNetwork(format!("server error: {}", status));
    }

    SourceError::PermanentSource(format!("unexpected status: {}", status))
}

/// Categorize a reqwest transport error
pub(crate) fn transport_error(e: reqwest::Error) -> SourceError {
    SourceError::TransientNetwork(e.to_string())
}

/// First string out of a JSON array field, e.g. openFDA's `["value"]` shape
pub(crate) fn first_str(value: &serde_json::Value) -> Option<&str> {
    match value {
        serde_json::Value::Array(items) => items.first().and_then(|v| v.as_str()),
        serde_json::Value::String(s) => Some(s),
        _ => None,
    }
}

/// All strings out of a JSON array field
pub(crate) fn str_list(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        serde_json::Value::String(s) => vec![s.clone()],
        _ => Vec::new(),
    }
}
