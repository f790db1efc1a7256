//! Configuration loading.
//!
//! Defaults live on the structs; an optional `config/krisis.*` file and
//! `KRISIS__`-prefixed environment variables (`__` as the nesting separator,
//! e.g. `KRISIS__REDIS__URL`) override them, so every operational threshold
//! can be changed without touching code.

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

use krisis_server::ServerConfig;

const CONFIG_FILE: &str = "config/krisis";
const ENV_PREFIX: &str = "KRISIS";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub news: NewsConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "RedisConfig::default_url")]
    pub url: String,
}

impl RedisConfig {
    fn default_url() -> String {
        "redis://127.0.0.1:6379".to_string()
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NewsConfig {
    #[serde(default = "NewsConfig::default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "NewsConfig::default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "NewsConfig::default_page_size")]
    pub page_size: u32,
}

impl NewsConfig {
    fn default_base_url() -> String {
        "https://newsapi.org/v2".to_string()
    }

    fn default_timeout_ms() -> u64 {
        5_000
    }

    fn default_page_size() -> u32 {
        50
    }
}

impl Default for NewsConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            api_key: String::new(),
            timeout_ms: Self::default_timeout_ms(),
            page_size: Self::default_page_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractConfig {
    #[serde(default = "ExtractConfig::default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "ExtractConfig::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl ExtractConfig {
    fn default_base_url() -> String {
        "https://mercury.postlight.com".to_string()
    }

    fn default_timeout_ms() -> u64 {
        10_000
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            api_key: None,
            timeout_ms: Self::default_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "AnalysisConfig::default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default = "AnalysisConfig::default_model")]
    pub model: String,
    #[serde(default = "AnalysisConfig::default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "AnalysisConfig::default_temperature")]
    pub temperature: f32,
    #[serde(default = "AnalysisConfig::default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "AnalysisConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "AnalysisConfig::default_initial_delay_ms")]
    pub initial_delay_ms: u64,
}

impl AnalysisConfig {
    fn default_base_url() -> String {
        "https://api.openai.com/v1".to_string()
    }

    fn default_model() -> String {
        "gpt-4o-mini-2024-07-18".to_string()
    }

    fn default_max_tokens() -> u32 {
        1_000
    }

    fn default_temperature() -> f32 {
        0.7
    }

    fn default_timeout_ms() -> u64 {
        60_000
    }

    fn default_max_attempts() -> u32 {
        3
    }

    fn default_initial_delay_ms() -> u64 {
        1_000
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            api_key: String::new(),
            org_id: None,
            model: Self::default_model(),
            max_tokens: Self::default_max_tokens(),
            temperature: Self::default_temperature(),
            timeout_ms: Self::default_timeout_ms(),
            max_attempts: Self::default_max_attempts(),
            initial_delay_ms: Self::default_initial_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "CacheConfig::default_search_ttl_secs")]
    pub search_ttl_secs: u64,
    #[serde(default = "CacheConfig::default_parse_ttl_secs")]
    pub parse_ttl_secs: u64,
    #[serde(default = "CacheConfig::default_analysis_ttl_secs")]
    pub analysis_ttl_secs: u64,
}

impl CacheConfig {
    fn default_search_ttl_secs() -> u64 {
        5 * 60
    }

    fn default_parse_ttl_secs() -> u64 {
        24 * 60 * 60
    }

    fn default_analysis_ttl_secs() -> u64 {
        24 * 60 * 60
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            search_ttl_secs: Self::default_search_ttl_secs(),
            parse_ttl_secs: Self::default_parse_ttl_secs(),
            analysis_ttl_secs: Self::default_analysis_ttl_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "QueueConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "QueueConfig::default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "QueueConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "QueueConfig::default_failed_retention")]
    pub failed_retention: usize,
}

impl QueueConfig {
    fn default_max_attempts() -> u32 {
        3
    }

    fn default_backoff_base_ms() -> u64 {
        5_000
    }

    fn default_poll_interval_ms() -> u64 {
        500
    }

    fn default_failed_retention() -> usize {
        100
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            backoff_base_ms: Self::default_backoff_base_ms(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            failed_retention: Self::default_failed_retention(),
        }
    }
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(CONFIG_FILE).required(false))
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let cfg = builder.build()?.try_deserialize()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_budgets() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.cache.search_ttl_secs, 300);
        assert_eq!(cfg.cache.parse_ttl_secs, 86_400);
        assert_eq!(cfg.cache.analysis_ttl_secs, 86_400);
        assert_eq!(cfg.queue.max_attempts, 3);
        assert_eq!(cfg.queue.backoff_base_ms, 5_000);
        assert_eq!(cfg.analysis.max_attempts, 3);
        assert_eq!(cfg.analysis.initial_delay_ms, 1_000);
        assert_eq!(cfg.analysis.max_tokens, 1_000);
        assert_eq!(cfg.news.page_size, 50);
        assert_eq!(cfg.server.rate_limit.search.max_requests.get(), 10);
        assert_eq!(cfg.server.rate_limit.analysis.max_requests.get(), 5);
    }
}
