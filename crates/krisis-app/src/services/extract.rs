//! Full-text extraction adapter.
//!
//! Wraps a Mercury-compatible content extraction endpoint. Extraction
//! performs no retry of its own; a failure here is terminal for the request.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

use crate::config::{CacheConfig, ExtractConfig};
use crate::services::cache;
use crate::services::store::KvStore;

const PARSE_CACHE_PREFIX: &str = "parse:";
const PARSER_ENDPOINT: &str = "parser";
const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Failed to parse article content")]
    EmptyContent,
    #[error("Error parsing article: request timed out")]
    Timeout,
    #[error("Error parsing article: {0}")]
    Upstream(String),
}

#[derive(Debug, Deserialize)]
struct ExtractPayload {
    content: Option<String>,
}

#[derive(Clone)]
pub struct ExtractClient<S> {
    store: S,
    http: Client,
    cfg: ExtractConfig,
    cache_ttl: Duration,
}

impl<S: KvStore> ExtractClient<S> {
    pub fn new(store: S, cfg: ExtractConfig, cache: &CacheConfig) -> Result<Self, ExtractError> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|err| ExtractError::Upstream(err.to_string()))?;
        Ok(Self {
            store,
            http,
            cfg,
            cache_ttl: Duration::from_secs(cache.parse_ttl_secs),
        })
    }

    /// Extract plain text for `url`, reading through the 24h cache. The
    /// cached value is the trimmed text itself.
    pub async fn parse(&self, url: &str) -> Result<String, ExtractError> {
        debug_assert!(!url.is_empty());
        let key = format!("{PARSE_CACHE_PREFIX}{url}");
        cache::fetch_through(&self.store, &key, self.cache_ttl, || self.fetch(url)).await
    }

    async fn fetch(&self, url: &str) -> Result<String, ExtractError> {
        tracing::info!(%url, "parsing article");
        let endpoint = format!("{}/{PARSER_ENDPOINT}", self.cfg.base_url.trim_end_matches('/'));

        let mut request = self
            .http
            .get(endpoint)
            .query(&[("url", url), ("contentType", "text")]);
        if let Some(api_key) = &self.cfg.api_key {
            request = request.header(API_KEY_HEADER, api_key);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExtractError::Upstream(format!(
                "extraction service returned {status}"
            )));
        }

        let payload = response
            .json::<ExtractPayload>()
            .await
            .map_err(classify_transport)?;

        let content = payload
            .content
            .as_deref()
            .map(str::trim)
            .filter(|content| !content.is_empty())
            .ok_or(ExtractError::EmptyContent)?;

        Ok(content.to_string())
    }
}

fn classify_transport(error: reqwest::Error) -> ExtractError {
    if error.is_timeout() {
        ExtractError::Timeout
    } else {
        ExtractError::Upstream(error.to_string())
    }
}
