use std::time::Duration;

use reqwest::{header, StatusCode};

use crate::error::FetchError;
use crate::models::catalog::{CatalogResponse, RawModelRecord};
use crate::models::classified::COPILOT_HEADERS;
use crate::services::token_provider::TokenProvider;

/// One initial attempt plus a single retry on transient failures.
const MAX_ATTEMPTS: u32 = 2;

/// Client for the upstream `GET /models` catalog.
#[derive(Clone)]
pub struct CatalogFetcher {
    client: reqwest::Client,
    endpoint: String,
    retry_backoff: Duration,
}

impl CatalogFetcher {
    pub fn new(endpoint: &str, timeout: Duration, retry_backoff: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            endpoint: endpoint.to_string(),
            retry_backoff,
        }
    }

    /// Fetch the raw catalog. The token is looked up once per call; an
    /// authentication failure is never retried.
    pub async fn fetch_catalog(
        &self,
        tokens: &dyn TokenProvider,
    ) -> Result<Vec<RawModelRecord>, FetchError> {
        let api_key = tokens.api_key()?;

        let mut attempt = 1;
        loop {
            match self.fetch_once(&api_key).await {
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    tracing::warn!(
                        "Catalog fetch attempt {}/{} failed: {}; retrying in {:?}",
                        attempt,
                        MAX_ATTEMPTS,
                        e,
                        self.retry_backoff
                    );
                    tokio::time::sleep(self.retry_backoff).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn fetch_once(&self, api_key: &str) -> Result<Vec<RawModelRecord>, FetchError> {
        let mut req = self
            .client
            .get(&self.endpoint)
            .header(header::AUTHORIZATION, format!("Bearer {api_key}"))
            .header(header::ACCEPT, "application/json");
        for (name, value) in COPILOT_HEADERS {
            req = req.header(name, value);
        }

        let resp = req.send().await.map_err(|e| {
            FetchError::UpstreamUnavailable(format!("request to {} failed: {e}", self.endpoint))
        })?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FetchError::AuthenticationFailed(format!(
                "catalog returned {status}"
            )));
        }
        if status.is_server_error() {
            return Err(FetchError::UpstreamUnavailable(format!(
                "catalog returned {status}"
            )));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::error!("Catalog returned {}: {}", status, body);
            return Err(FetchError::UpstreamProtocolError(format!(
                "catalog returned {status}"
            )));
        }

        let body = resp.text().await.map_err(|e| {
            FetchError::UpstreamUnavailable(format!("failed to read catalog body: {e}"))
        })?;

        parse_catalog(&body)
    }
}

/// Parse a catalog body. The envelope must be an object with a `data` array;
/// array items that are not objects are dropped.
pub fn parse_catalog(body: &str) -> Result<Vec<RawModelRecord>, FetchError> {
    let envelope: CatalogResponse = serde_json::from_str(body).map_err(|e| {
        FetchError::UpstreamProtocolError(format!("unexpected catalog body: {e}"))
    })?;

    let total = envelope.data.len();
    let records: Vec<RawModelRecord> = envelope
        .data
        .into_iter()
        .filter(|v| v.is_object())
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect();

    if records.len() < total {
        tracing::warn!(
            "Dropped {} catalog items that were not model objects",
            total - records.len()
        );
    }
    tracing::info!("Fetched {} models from upstream catalog", records.len());
    Ok(records)
}
