//! Search adapter for the external news provider.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use krisis_server::Article;

use crate::config::{CacheConfig, NewsConfig};
use crate::services::cache;
use crate::services::store::KvStore;

const SEARCH_CACHE_PREFIX: &str = "search:";
const SEARCH_ENDPOINT: &str = "everything";
const API_KEY_HEADER: &str = "X-Api-Key";

const DEFAULT_AUTHOR: &str = "Unknown";
const DEFAULT_PUBLISHER: &str = "Unknown Source";

#[derive(Debug, Error)]
pub enum NewsError {
    #[error("Invalid News API key")]
    InvalidApiKey,
    #[error("News API rate limit exceeded")]
    RateLimited,
    #[error("News API request timed out")]
    Timeout,
    #[error("News API error: {0}")]
    Provider(String),
    #[error("Error searching articles: {0}")]
    Transport(String),
}

/// Raw provider payload. Cached as-is so a repeated query within the TTL
/// makes no second provider call; normalization happens after the cache read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPayload {
    pub status: Option<String>,
    #[serde(rename = "totalResults")]
    pub total_results: Option<u64>,
    #[serde(default)]
    pub articles: Vec<RawArticle>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawArticle {
    #[serde(default)]
    pub source: Option<RawSource>,
    pub author: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    #[serde(rename = "publishedAt")]
    pub published_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSource {
    pub id: Option<String>,
    pub name: Option<String>,
}

#[derive(Clone)]
pub struct NewsClient<S> {
    store: S,
    http: Client,
    cfg: NewsConfig,
    cache_ttl: Duration,
}

impl<S: KvStore> NewsClient<S> {
    pub fn new(store: S, cfg: NewsConfig, cache: &CacheConfig) -> Result<Self, NewsError> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|err| NewsError::Transport(err.to_string()))?;
        Ok(Self {
            store,
            http,
            cfg,
            cache_ttl: Duration::from_secs(cache.search_ttl_secs),
        })
    }

    /// Cached provider search with fixed parameters: English language, sorted
    /// by publication date, configured page size.
    pub async fn search(&self, query: &str) -> Result<SearchPayload, NewsError> {
        debug_assert!(!query.trim().is_empty());
        let key = format!("{SEARCH_CACHE_PREFIX}{query}");
        cache::fetch_through(&self.store, &key, self.cache_ttl, || self.fetch(query)).await
    }

    async fn fetch(&self, query: &str) -> Result<SearchPayload, NewsError> {
        tracing::info!(%query, "fetching search results from News API");
        let url = format!("{}/{SEARCH_ENDPOINT}", self.cfg.base_url.trim_end_matches('/'));
        let page_size = self.cfg.page_size.to_string();

        let response = self
            .http
            .get(url)
            .header(API_KEY_HEADER, &self.cfg.api_key)
            .query(&[
                ("q", query),
                ("language", "en"),
                ("sortBy", "publishedAt"),
                ("pageSize", page_size.as_str()),
            ])
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|body| body.get("message")?.as_str().map(str::to_string));
            return Err(classify_status(status, message));
        }

        response
            .json::<SearchPayload>()
            .await
            .map_err(classify_transport)
    }
}

fn classify_transport(error: reqwest::Error) -> NewsError {
    if error.is_timeout() {
        NewsError::Timeout
    } else {
        NewsError::Transport(error.to_string())
    }
}

fn classify_status(status: StatusCode, provider_message: Option<String>) -> NewsError {
    match status {
        StatusCode::UNAUTHORIZED => NewsError::InvalidApiKey,
        StatusCode::TOO_MANY_REQUESTS => NewsError::RateLimited,
        _ => NewsError::Provider(
            provider_message.unwrap_or_else(|| "Unknown error".to_string()),
        ),
    }
}

/// Shape provider articles for the frontend: index-based id and documented
/// defaults for the fields the provider habitually leaves null.
pub fn normalize_articles(articles: &[RawArticle]) -> Vec<Article> {
    articles
        .iter()
        .enumerate()
        .map(|(id, article)| Article {
            id,
            title: article.title.clone(),
            url: article.url.clone(),
            author: article
                .author
                .clone()
                .unwrap_or_else(|| DEFAULT_AUTHOR.to_string()),
            publisher: article
                .source
                .as_ref()
                .and_then(|source| source.name.clone())
                .unwrap_or_else(|| DEFAULT_PUBLISHER.to_string()),
            published_at: article.published_at.clone(),
            description: article.description.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(author: Option<&str>, source_name: Option<&str>) -> RawArticle {
        RawArticle {
            source: Some(RawSource {
                id: None,
                name: source_name.map(str::to_string),
            }),
            author: author.map(str::to_string),
            title: Some("title".to_string()),
            description: Some("desc".to_string()),
            url: Some("https://example.com".to_string()),
            published_at: Some("2024-01-01T00:00:00Z".to_string()),
        }
    }

    #[test]
    fn normalization_assigns_index_ids_and_defaults() {
        let articles = vec![
            raw(Some("Jane Doe"), Some("The Example Times")),
            raw(None, None),
            RawArticle {
                source: None,
                author: None,
                title: None,
                description: None,
                url: None,
                published_at: None,
            },
        ];

        let normalized = normalize_articles(&articles);
        assert_eq!(normalized.len(), 3);
        assert_eq!(normalized[0].id, 0);
        assert_eq!(normalized[0].author, "Jane Doe");
        assert_eq!(normalized[0].publisher, "The Example Times");
        assert_eq!(normalized[1].id, 1);
        assert_eq!(normalized[1].author, "Unknown");
        assert_eq!(normalized[1].publisher, "Unknown Source");
        assert_eq!(normalized[2].publisher, "Unknown Source");
        assert!(normalized[2].title.is_none());
    }

    #[test]
    fn status_classification_matches_the_provider_contract() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None),
            NewsError::InvalidApiKey
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, None),
            NewsError::RateLimited
        ));

        let err = classify_status(
            StatusCode::BAD_REQUEST,
            Some("queries must be shorter".to_string()),
        );
        assert_eq!(err.to_string(), "News API error: queries must be shorter");

        let err = classify_status(StatusCode::INTERNAL_SERVER_ERROR, None);
        assert_eq!(err.to_string(), "News API error: Unknown error");
    }

    #[test]
    fn payload_tolerates_missing_fields() {
        let payload: SearchPayload =
            serde_json::from_str(r#"{"status":"ok"}"#).expect("payload parses");
        assert!(payload.articles.is_empty());
        assert_eq!(payload.total_results, None);
    }
}
