use std::net::IpAddr;
use std::num::{NonZeroU32, NonZeroU64};

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "ServerConfig::default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl ServerConfig {
    fn default_listen_addr() -> String {
        "127.0.0.1:3000".to_string()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: Self::default_listen_addr(),
            rate_limit: RateLimitConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

/// The four rate-limit tiers from the original deployment: a global DDoS
/// guard, a generic API budget, and stricter per-endpoint budgets for the two
/// expensive operations.
#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "RateLimitConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "RateLimitConfig::default_basic")]
    pub basic: TierLimitConfig,
    #[serde(default = "RateLimitConfig::default_api")]
    pub api: TierLimitConfig,
    #[serde(default = "RateLimitConfig::default_search")]
    pub search: TierLimitConfig,
    #[serde(default = "RateLimitConfig::default_analysis")]
    pub analysis: TierLimitConfig,
    #[serde(default)]
    pub proxy_mode: ProxyMode,
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

impl RateLimitConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_basic() -> TierLimitConfig {
        TierLimitConfig::new(200, 60)
    }

    fn default_api() -> TierLimitConfig {
        TierLimitConfig::new(100, 15 * 60)
    }

    fn default_search() -> TierLimitConfig {
        TierLimitConfig::new(10, 5 * 60)
    }

    fn default_analysis() -> TierLimitConfig {
        TierLimitConfig::new(5, 10 * 60)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            basic: Self::default_basic(),
            api: Self::default_api(),
            search: Self::default_search(),
            analysis: Self::default_analysis(),
            proxy_mode: ProxyMode::Off,
            trusted_proxies: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct TierLimitConfig {
    #[serde(default = "TierLimitConfig::default_max_requests")]
    pub max_requests: NonZeroU32,
    #[serde(default = "TierLimitConfig::default_window_secs")]
    pub window_secs: NonZeroU64,
}

impl TierLimitConfig {
    fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests: NonZeroU32::new(max_requests).expect("tier budget must be non-zero"),
            window_secs: NonZeroU64::new(window_secs).expect("tier window must be non-zero"),
        }
    }

    fn default_max_requests() -> NonZeroU32 {
        NonZeroU32::new(1).expect("default tier budget must be non-zero")
    }

    fn default_window_secs() -> NonZeroU64 {
        NonZeroU64::new(60).expect("default tier window must be non-zero")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allow_origins: Vec<String>,
    #[serde(default = "CorsConfig::default_allow_methods")]
    pub allow_methods: Vec<String>,
    #[serde(default = "CorsConfig::default_allow_headers")]
    pub allow_headers: Vec<String>,
    #[serde(default = "CorsConfig::default_max_age_secs")]
    pub max_age_secs: u64,
}

impl CorsConfig {
    fn default_allow_methods() -> Vec<String> {
        vec!["GET".to_string(), "POST".to_string()]
    }

    fn default_allow_headers() -> Vec<String> {
        vec!["content-type".to_string(), "authorization".to_string()]
    }

    fn default_max_age_secs() -> u64 {
        600
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_origins: Vec::new(),
            allow_methods: Self::default_allow_methods(),
            allow_headers: Self::default_allow_headers(),
            max_age_secs: Self::default_max_age_secs(),
        }
    }
}

/// How the client address used for rate-limit keys is derived. Header-based
/// modes only trust forwarding headers from known proxy addresses.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    #[default]
    Off,
    XForwardedFor,
}
