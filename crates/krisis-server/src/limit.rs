use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{RateLimitConfig, TierLimitConfig};

/// Windowed request counters backed by the shared store.
///
/// Counters must live in the store rather than process memory so that every
/// server process enforces one logical budget per (tier, client) pair. The
/// implementation relies on the store's per-key atomicity only; no cross-key
/// coordination is required.
#[async_trait]
pub trait RateCounterStore: Send + Sync + 'static {
    /// Increment the counter for `key`, starting its expiry window on the
    /// first hit, and return the count observed within the current window.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64, RateCounterError>;
}

/// A store failure during a rate-limit check is fatal to the request being
/// gated; the middleware surfaces it instead of letting traffic through.
#[derive(Debug, Error)]
#[error("rate-limit store error: {0}")]
pub struct RateCounterError(pub String);

/// One independently budgeted gate. Ordering of the enum is the evaluation
/// order when several tiers apply to the same request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Basic,
    Api,
    Search,
    Analysis,
}

impl Tier {
    pub(crate) fn key_prefix(self) -> &'static str {
        match self {
            Tier::Basic => "rl:basic",
            Tier::Api => "rl:api",
            Tier::Search => "rl:search",
            Tier::Analysis => "rl:analysis",
        }
    }

    pub(crate) fn limit(self, cfg: &RateLimitConfig) -> TierLimitConfig {
        match self {
            Tier::Basic => cfg.basic,
            Tier::Api => cfg.api,
            Tier::Search => cfg.search,
            Tier::Analysis => cfg.analysis,
        }
    }

    /// Rejection text mirrors the messages clients of the original service
    /// already handle.
    pub(crate) fn rejection_message(self) -> &'static str {
        match self {
            Tier::Basic => "Too many requests from this IP, please try again after a minute",
            Tier::Api => "Too many requests, please try again later",
            Tier::Search => {
                "Search rate limit exceeded. Maximum 10 searches per 5 minutes allowed."
            }
            Tier::Analysis => {
                "Analysis rate limit exceeded. Maximum 5 analyses per 10 minutes allowed."
            }
        }
    }
}
