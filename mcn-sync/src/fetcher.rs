//! Remote dataset client
//!
//! Fetches the shared MCN dataset (a JSON object of subject id →
//! affiliation) from a fixed URL, normally a raw GitHub file.

use async_trait::async_trait;
use mcn_common::dataset::dataset_from_json;
use mcn_common::Dataset;
use std::time::Duration;

use crate::error::FetchError;

const USER_AGENT: &str = concat!("mcn-sync/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Anything that can produce the authoritative dataset
#[async_trait]
pub trait DatasetSource: Send + Sync {
    async fn fetch(&self) -> Result<Dataset, FetchError>;
}

/// HTTP client for the shared dataset
pub struct RemoteDatasetFetcher {
    http_client: reqwest::Client,
    url: String,
}

impl RemoteDatasetFetcher {
    pub fn new(url: impl Into<String>) -> Result<Self, FetchError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl DatasetSource for RemoteDatasetFetcher {
    async fn fetch(&self) -> Result<Dataset, FetchError> {
        tracing::debug!(url = %self.url, "Fetching remote dataset");

        let response = self
            .http_client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Network(format!("HTTP {}", status.as_u16())));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let dataset = dataset_from_json(&body).map_err(|e| FetchError::Parse(e.to_string()))?;

        tracing::info!(entries = dataset.len(), "Remote dataset fetched");

        Ok(dataset)
    }
}
