/*!
 * NPI Registry API client
 *
 * [`RegistryApi`] is the seam the poller pages through; [`NpiRegistryClient`]
 * implements it over HTTP with reqwest. Every failure of a single page
 * request (transport, timeout, status, payload) comes back as a
 * [`FetchError`] for the poller to retry.
 */

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::PollerConfig;
use crate::{IngestError, Result};

/// One page request for one query term
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery<'a> {
    pub term: &'a str,
    pub limit: usize,
    pub skip: usize,
}

/// Why a single page request failed; always retryable
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Source of raw provider results, one page at a time
#[async_trait]
pub trait RegistryApi: Send + Sync {
    async fn fetch_page(&self, query: &PageQuery<'_>) -> std::result::Result<Vec<Value>, FetchError>;
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    results: Option<Vec<Value>>,
    #[serde(default, rename = "Errors")]
    errors: Option<Vec<Value>>,
}

/// HTTP client for https://npiregistry.cms.hhs.gov/api/
#[derive(Debug, Clone)]
pub struct NpiRegistryClient {
    client: Client,
    base_url: String,
    version: String,
    timeout: Duration,
}

impl NpiRegistryClient {
    pub fn new(config: &PollerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| IngestError::Http {
                message: format!("Failed to create HTTP client: {}", e),
                url: None,
            })?;

        Ok(Self {
            client,
            base_url: config.api_url.clone(),
            version: config.api_version.clone(),
            timeout: config.request_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl RegistryApi for NpiRegistryClient {
    async fn fetch_page(&self, query: &PageQuery<'_>) -> std::result::Result<Vec<Value>, FetchError> {
        let limit = query.limit.to_string();
        let skip = query.skip.to_string();
        let params = [
            ("version", self.version.as_str()),
            ("taxonomy_description", query.term),
            ("limit", limit.as_str()),
            ("skip", skip.as_str()),
        ];

        let response = self
            .client
            .get(&self.base_url)
            .query(&params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout(self.timeout)
                } else {
                    FetchError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let parsed: ApiResponse = response.json().await.map_err(|e| {
            if e.is_decode() {
                FetchError::Malformed(e.to_string())
            } else {
                FetchError::Transport(e.to_string())
            }
        })?;

        if let Some(errors) = parsed.errors.filter(|e| !e.is_empty()) {
            return Err(FetchError::Malformed(format!("API reported errors: {}", Value::Array(errors))));
        }

        let results = parsed.results.unwrap_or_default();
        debug!(term = query.term, skip = query.skip, count = results.len(), "Fetched page");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use serde_json::json;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> NpiRegistryClient {
        let config = ConfigBuilder::new().api_url(format!("{}/api/", server.uri())).build().unwrap();
        NpiRegistryClient::new(&config.poller).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_page_sends_query_and_parses_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("version", "2.1"))
            .and(query_param("taxonomy_description", "Mental Health"))
            .and(query_param("limit", "200"))
            .and(query_param("skip", "400"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result_count": 2,
                "results": [{"number": 1}, {"number": 2}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let page = client
            .fetch_page(&PageQuery { term: "Mental Health", limit: 200, skip: 400 })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_results_is_empty_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result_count": 0})))
            .mount(&server)
            .await;

        let page = client_for(&server)
            .fetch_page(&PageQuery { term: "x", limit: 200, skip: 0 })
            .await
            .unwrap();
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn test_status_and_payload_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("taxonomy_description", "down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("taxonomy_description", "garbage"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("taxonomy_description", "rejected"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Errors": [{"description": "No valid search criteria", "field": "generic"}]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let fetch = |term: &'static str| {
            let client = client.clone();
            async move { client.fetch_page(&PageQuery { term, limit: 10, skip: 0 }).await }
        };

        assert!(matches!(fetch("down").await, Err(FetchError::Status { status: 503, .. })));
        assert!(matches!(fetch("garbage").await, Err(FetchError::Malformed(_))));
        assert!(matches!(fetch("rejected").await, Err(FetchError::Malformed(_))));
    }
}
