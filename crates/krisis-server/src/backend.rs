use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// One normalized search result, shaped for the frontend.
///
/// The upstream provider returns loosely-typed nested JSON; missing author and
/// publisher fields are replaced with the documented defaults during
/// normalization, everything else stays optional.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Article {
    pub id: usize,
    pub title: Option<String>,
    pub url: Option<String>,
    pub author: String,
    pub publisher: String,
    #[serde(rename = "publishedAt")]
    pub published_at: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub articles: Vec<Article>,
    pub total_results: u64,
}

/// Client-visible lifecycle state of an analysis task.
///
/// Terminal results are single-delivery: the backend consumes the stored
/// result on the first poll that observes it, so a repeated poll for the same
/// id reports `NotFound`.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskStatus {
    Completed { result: Value },
    Failed { error: String },
    Queued,
    Active,
    NotFound,
}

/// The application backend behind the HTTP surface.
///
/// Inputs arrive already validated (trimmed non-empty query, absolute URL,
/// bounded content, well-formed task id); implementations only deal with the
/// store and the external providers.
#[async_trait]
pub trait NewsBackend: Send + Sync + 'static {
    async fn search(&self, query: &str) -> Result<SearchOutcome, BackendError>;
    async fn parse(&self, url: &str) -> Result<String, BackendError>;
    /// Enqueue an analysis job and return the generated task id. Must not
    /// block on analysis completion.
    async fn start_analysis(&self, content: &str) -> Result<String, BackendError>;
    async fn check_analysis(&self, task_id: &str) -> Result<TaskStatus, BackendError>;
    /// Lightweight store connectivity probe for the detailed health report.
    /// Must not touch the job queue.
    async fn store_healthy(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Provider rejected our credentials; operator-facing, never retried.
    Auth,
    /// The provider itself throttled us.
    UpstreamRateLimit,
    Timeout,
    Upstream,
    /// The shared store was unreachable for an operation requiring durability.
    Store,
}

#[derive(Debug, Clone)]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn auth(message: impl Into<String>) -> Self {
        BackendError {
            kind: BackendErrorKind::Auth,
            message: message.into(),
        }
    }

    pub fn upstream_rate_limit(message: impl Into<String>) -> Self {
        BackendError {
            kind: BackendErrorKind::UpstreamRateLimit,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        BackendError {
            kind: BackendErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        BackendError {
            kind: BackendErrorKind::Upstream,
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        BackendError {
            kind: BackendErrorKind::Store,
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for BackendError {}
