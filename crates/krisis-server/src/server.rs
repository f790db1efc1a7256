//! Web server entrypoints live here.

use std::{
    collections::HashSet,
    future::Future,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{MatchedPath, Path, Query, State, connect_info::ConnectInfo, rejection::JsonRejection},
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{
    add_extension::AddExtensionLayer,
    classify::ServerErrorsFailureClass,
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::backend::{BackendError, BackendErrorKind, NewsBackend, TaskStatus};
use crate::config::{CorsConfig, ProxyMode, RateLimitConfig, ServerConfig};
use crate::limit::{RateCounterStore, Tier};

const SEARCH_PATH: &str = "/api/search";
const PARSE_PATH: &str = "/api/parse";
const START_ANALYSIS_PATH: &str = "/api/start-analysis";
const CHECK_ANALYSIS_PATH: &str = "/api/check-analysis/{task_id}";
const HEALTH_PATH: &str = "/health";
const HEALTH_DETAILED_PATH: &str = "/health/detailed";

const MAX_CONTENT_CHARS: usize = 50_000;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_ID_HEADER: &str = "x-request-id";
const WILDCARD_ORIGIN: &str = "*";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ShutdownEvent {
    Pending,
    CtrlC,
    SigTerm,
    ListenerFailed,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listen address may not be empty")]
    EmptyListenAddr,
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to determine local address: {source}")]
    LocalAddr {
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
    #[error("invalid CORS configuration: {reason}")]
    CorsConfig { reason: String },
}

type BackendHandle = Arc<dyn NewsBackend>;
type CounterHandle = Arc<dyn RateCounterStore>;

#[derive(Clone)]
struct ApiState {
    backend: BackendHandle,
    started_at: Instant,
}

type ApiStateHandle = Arc<ApiState>;

impl ApiState {
    fn new(backend: BackendHandle) -> Self {
        Self {
            backend,
            started_at: Instant::now(),
        }
    }
}

#[derive(Clone)]
struct RateLimitState {
    store: CounterHandle,
    cfg: RateLimitConfig,
    trusted: Arc<HashSet<IpAddr>>,
}

impl RateLimitState {
    fn new(store: CounterHandle, cfg: RateLimitConfig) -> Arc<Self> {
        let trusted = cfg.trusted_proxies.iter().copied().collect();
        Arc::new(Self {
            store,
            cfg,
            trusted: Arc::new(trusted),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct ApiErrorBody {
    status: &'static str,
    message: String,
}

#[derive(Debug, Clone)]
struct ApiError {
    status: StatusCode,
    body: ApiErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            body: ApiErrorBody {
                status: "error",
                message: message.into(),
            },
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, message)
    }

    fn rate_limited(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::TOO_MANY_REQUESTS, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn resource_not_found(path: &str) -> Self {
        debug_assert!(path.starts_with('/'));
        ApiError::new(StatusCode::NOT_FOUND, format!("Not Found - {path}"))
    }

    fn method_not_allowed(method: &str, path: &str) -> Self {
        ApiError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("method `{method}` not allowed for `{path}`"),
        )
    }
}

impl From<BackendError> for ApiError {
    fn from(error: BackendError) -> Self {
        match error.kind {
            BackendErrorKind::Store => {
                tracing::error!(message = %error.message, "store failure while handling request");
            }
            _ => {
                tracing::warn!(kind = ?error.kind, message = %error.message, "provider call failed");
            }
        }
        ApiError::internal(error.message)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(_: JsonRejection) -> Self {
        ApiError::bad_request("Invalid JSON in request body")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: Option<String>,
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    status: &'static str,
    articles: Vec<crate::backend::Article>,
    #[serde(rename = "totalResults")]
    total_results: u64,
}

#[derive(Debug, Deserialize)]
struct ParseQuery {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StartAnalysisRequest {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct StartAnalysisResponse {
    status: &'static str,
    #[serde(rename = "taskId")]
    task_id: String,
    message: &'static str,
}

#[derive(Debug, Serialize)]
struct CheckAnalysisResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<TaskStatus> for CheckAnalysisResponse {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Completed { result } => CheckAnalysisResponse {
                status: "completed",
                result: Some(result),
                error: None,
            },
            TaskStatus::Failed { error } => CheckAnalysisResponse {
                status: "failed",
                result: None,
                error: Some(error),
            },
            TaskStatus::Queued => CheckAnalysisResponse {
                status: "queued",
                result: None,
                error: None,
            },
            TaskStatus::Active => CheckAnalysisResponse {
                status: "active",
                result: None,
                error: None,
            },
            TaskStatus::NotFound => CheckAnalysisResponse {
                status: "not_found",
                result: None,
                error: None,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct DetailedHealthResponse {
    status: &'static str,
    version: &'static str,
    timestamp: String,
    uptime: UptimeReport,
    process: ProcessReport,
    dependencies: DependencyReport,
}

#[derive(Debug, Serialize)]
struct UptimeReport {
    seconds: u64,
    formatted: String,
}

#[derive(Debug, Serialize)]
struct ProcessReport {
    pid: u32,
}

#[derive(Debug, Serialize)]
struct DependencyReport {
    redis: &'static str,
}

/// Which gates apply to a request, in tier order. The two endpoints that
/// carry their own stricter budget opt out of the basic tier so one request
/// is not charged against two unrelated counters; health stays exempt so it
/// remains observable when the store is down.
fn applicable_tiers(path: &str) -> &'static [Tier] {
    if path.starts_with(HEALTH_PATH) {
        return &[];
    }
    if path == SEARCH_PATH {
        return &[Tier::Api, Tier::Search];
    }
    if path == START_ANALYSIS_PATH {
        return &[Tier::Api, Tier::Analysis];
    }
    if path.starts_with("/api/") {
        return &[Tier::Basic, Tier::Api];
    }
    &[Tier::Basic]
}

async fn rate_limit_middleware(
    State(state): State<Arc<RateLimitState>>,
    req: Request<Body>,
    next: Next,
) -> axum::response::Response {
    let path = matched_path_or_uri(&req);
    let tiers = applicable_tiers(&path);
    if tiers.is_empty() {
        return next.run(req).await;
    }

    let ip = extract_client_ip(&req, state.cfg.proxy_mode, state.trusted.as_ref())
        .unwrap_or_else(|| IpAddr::from([0, 0, 0, 0]));

    for tier in tiers {
        let limit = tier.limit(&state.cfg);
        let key = format!("{}:{ip}", tier.key_prefix());
        let window = Duration::from_secs(limit.window_secs.get());
        let count = match state.store.incr_window(&key, window).await {
            Ok(count) => count,
            Err(error) => {
                // A counter we cannot read is a counter we cannot enforce;
                // reject rather than letting traffic through unmetered.
                tracing::error!(%error, %path, "rate-limit store unavailable");
                return ApiError::internal("rate limiter unavailable").into_response();
            }
        };
        if count > u64::from(limit.max_requests.get()) {
            tracing::warn!(tier = ?tier, %ip, %path, count, "rate limit exceeded");
            return ApiError::rate_limited(tier.rejection_message()).into_response();
        }
    }

    next.run(req).await
}

fn extract_client_ip(
    req: &Request<Body>,
    mode: ProxyMode,
    trusted: &HashSet<IpAddr>,
) -> Option<IpAddr> {
    let peer_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())?;

    match mode {
        ProxyMode::Off => Some(peer_ip),
        ProxyMode::XForwardedFor => {
            // Only trust the forwarding header when the peer is a known proxy.
            if trusted.contains(&peer_ip) {
                parse_xff(req.headers()).or(Some(peer_ip))
            } else {
                Some(peer_ip)
            }
        }
    }
}

fn parse_xff(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .and_then(|ip| ip.parse::<IpAddr>().ok())
}

fn trim_non_empty(value: Option<String>, message: &'static str) -> Result<String, ApiError> {
    let trimmed = value.as_deref().map(str::trim).unwrap_or_default();
    if trimmed.is_empty() {
        return Err(ApiError::bad_request(message));
    }
    Ok(trimmed.to_string())
}

/// 36-character hyphenated UUID shape, case-insensitive. Deliberately matches
/// the wire format task ids are issued in; other textual UUID encodings are
/// rejected.
fn is_valid_task_id(task_id: &str) -> bool {
    if task_id.len() != 36 {
        return false;
    }
    task_id.char_indices().all(|(idx, ch)| match idx {
        8 | 13 | 18 | 23 => ch == '-',
        _ => ch.is_ascii_hexdigit(),
    })
}

async fn search(
    Extension(state): Extension<ApiStateHandle>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, ApiError> {
    let Json(request) = payload?;
    let query = trim_non_empty(request.query, "Search query must be a non-empty string")?;

    tracing::info!(%query, "processing search request");
    let outcome = state.backend.search(&query).await?;

    Ok(Json(SearchResponse {
        status: "success",
        articles: outcome.articles,
        total_results: outcome.total_results,
    }))
}

async fn parse(
    Extension(state): Extension<ApiStateHandle>,
    Query(query): Query<ParseQuery>,
) -> Result<Json<String>, ApiError> {
    let Some(raw) = query.url else {
        return Err(ApiError::bad_request("URL is required"));
    };
    if url::Url::parse(&raw).is_err() {
        tracing::warn!(url = %raw, "invalid URL received");
        return Err(ApiError::bad_request("Invalid URL format"));
    }

    tracing::info!(url = %raw, "processing parse request");
    let content = state.backend.parse(&raw).await?;
    Ok(Json(content))
}

async fn start_analysis(
    Extension(state): Extension<ApiStateHandle>,
    payload: Result<Json<StartAnalysisRequest>, JsonRejection>,
) -> Result<Json<StartAnalysisResponse>, ApiError> {
    let Json(request) = payload?;
    let Some(content) = request.content else {
        return Err(ApiError::bad_request("Content must be a non-empty string"));
    };
    if content.trim().is_empty() {
        return Err(ApiError::bad_request("Content must be a non-empty string"));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        tracing::warn!(content_chars = content.chars().count(), "content too long for analysis");
        return Err(ApiError::bad_request(
            "Content is too long. Maximum 50,000 characters allowed.",
        ));
    }

    let task_id = state.backend.start_analysis(&content).await?;
    tracing::info!(%task_id, "analysis task started");

    Ok(Json(StartAnalysisResponse {
        status: "success",
        task_id,
        message: "Analysis task started",
    }))
}

async fn check_analysis(
    Extension(state): Extension<ApiStateHandle>,
    Path(task_id): Path<String>,
) -> Result<Json<CheckAnalysisResponse>, ApiError> {
    if !is_valid_task_id(&task_id) {
        tracing::warn!(%task_id, "invalid task ID received");
        return Err(ApiError::bad_request("Invalid task ID format"));
    }

    tracing::debug!(%task_id, "checking analysis task status");
    let status = state.backend.check_analysis(&task_id).await?;
    Ok(Json(CheckAnalysisResponse::from(status)))
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn health_detailed(Extension(state): Extension<ApiStateHandle>) -> impl IntoResponse {
    let redis = if state.backend.store_healthy().await {
        "ok"
    } else {
        "error"
    };
    let uptime_secs = state.started_at.elapsed().as_secs();

    Json(DetailedHealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime: UptimeReport {
            seconds: uptime_secs,
            formatted: format_uptime(uptime_secs),
        },
        process: ProcessReport {
            pid: std::process::id(),
        },
        dependencies: DependencyReport { redis },
    })
}

fn format_uptime(mut seconds: u64) -> String {
    let days = seconds / 86_400;
    seconds %= 86_400;
    let hours = seconds / 3_600;
    seconds %= 3_600;
    let minutes = seconds / 60;
    seconds %= 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    parts.push(format!("{seconds}s"));
    parts.join(" ")
}

async fn method_not_allowed_handler(request: Request<Body>) -> axum::response::Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    ApiError::method_not_allowed(&method, &path).into_response()
}

async fn not_found_handler(request: Request<Body>) -> axum::response::Response {
    let path = request.uri().path().to_string();
    ApiError::resource_not_found(&path).into_response()
}

fn matched_path_or_uri<B>(request: &Request<B>) -> String {
    if let Some(path) = request.extensions().get::<MatchedPath>() {
        return path.as_str().to_string();
    }
    request.uri().path().to_string()
}

fn header_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

fn build_api_router() -> Router {
    Router::new()
        .route(SEARCH_PATH, post(search).fallback(method_not_allowed_handler))
        .route(PARSE_PATH, get(parse).fallback(method_not_allowed_handler))
        .route(
            START_ANALYSIS_PATH,
            post(start_analysis).fallback(method_not_allowed_handler),
        )
        .route(
            CHECK_ANALYSIS_PATH,
            get(check_analysis).fallback(method_not_allowed_handler),
        )
        .route(HEALTH_PATH, get(health).fallback(method_not_allowed_handler))
        .route(
            HEALTH_DETAILED_PATH,
            get(health_detailed).fallback(method_not_allowed_handler),
        )
}

/// Assemble the full application router. Public so embedders and integration
/// tests can drive the exact request pipeline without binding a socket.
pub fn build_router(
    config: &ServerConfig,
    backend: BackendHandle,
    counters: CounterHandle,
) -> Result<Router, ServerError> {
    let state: ApiStateHandle = Arc::new(ApiState::new(backend));

    let mut router = Router::new()
        .merge(build_api_router())
        .fallback(not_found_handler);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            let path = matched_path_or_uri(request);
            let request_id =
                header_request_id(request.headers()).unwrap_or_else(|| "-".to_string());
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                path = %path,
                request_id = %request_id
            )
        })
        .on_response(
            |response: &axum::response::Response, latency: Duration, span: &tracing::Span| {
                let status = response.status().as_u16();
                let latency_ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
                tracing::info!(parent: span, status, latency_ms, "request completed");
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, span: &tracing::Span| {
                let latency_ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
                tracing::error!(parent: span, latency_ms, error = %error, "request failed");
            },
        );

    if config.rate_limit.enabled {
        let limiter_state = RateLimitState::new(counters, config.rate_limit.clone());
        let rate_layer = middleware::from_fn_with_state(limiter_state, rate_limit_middleware);
        router = router.layer(rate_layer);
    }

    if config.cors.enabled {
        let cors_layer = build_cors_layer(&config.cors)?;
        router = router.layer(cors_layer);
    }

    router = router.layer(trace_layer);

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);
    router = router
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid));

    Ok(router.layer(AddExtensionLayer::new(state)))
}

pub async fn serve(
    config: ServerConfig,
    backend: BackendHandle,
    counters: CounterHandle,
) -> Result<(), ServerError> {
    let listen_addr = parse_listen_addr(&config.listen_addr)?;
    let listener = bind_listener(listen_addr).await?;

    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::LocalAddr { source })?;
    tracing::info!(%local_addr, "krisis server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownEvent::Pending);
    let shutdown_future = broadcast_shutdown(shutdown_tx);

    let app = build_router(&config, backend, counters)?;
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    let mut server_future = Box::pin(async move {
        axum::serve(listener, make_service)
            .with_graceful_shutdown(shutdown_future)
            .await
    });

    let drain_rx = shutdown_rx.clone();
    let mut drain_timeout = Box::pin(drain_timeout_future(drain_rx));

    tokio::select! {
        result = server_future.as_mut() => {
            if let Err(source) = result {
                return Err(ServerError::Serve { source });
            }
        }
        _ = drain_timeout.as_mut() => {
            // Timeout elapsed; dropping the server future forces termination.
        }
    }

    let final_event = *shutdown_rx.borrow();
    if final_event == ShutdownEvent::Pending {
        tracing::info!("server stopped without external shutdown signal");
    } else {
        tracing::info!(?final_event, "server shutdown complete");
    }

    Ok(())
}

fn build_cors_layer(config: &CorsConfig) -> Result<CorsLayer, ServerError> {
    let origins = if config
        .allow_origins
        .iter()
        .any(|origin| origin == WILDCARD_ORIGIN)
    {
        AllowOrigin::any()
    } else {
        let list: Vec<HeaderValue> = config
            .allow_origins
            .iter()
            .map(|origin| {
                HeaderValue::from_str(origin).map_err(|err| ServerError::CorsConfig {
                    reason: format!("origin `{origin}` is not a valid header value: {err}"),
                })
            })
            .collect::<Result<_, _>>()?;
        AllowOrigin::list(list)
    };

    let methods: Vec<Method> = config
        .allow_methods
        .iter()
        .map(|method| {
            Method::from_bytes(method.as_bytes()).map_err(|_| ServerError::CorsConfig {
                reason: format!("invalid HTTP method `{method}` in CORS allow_methods"),
            })
        })
        .collect::<Result<_, _>>()?;

    let allow_headers: Vec<HeaderName> = config
        .allow_headers
        .iter()
        .map(|name| {
            HeaderName::from_bytes(name.as_bytes()).map_err(|err| ServerError::CorsConfig {
                reason: format!("header `{name}` is invalid: {err}"),
            })
        })
        .collect::<Result<_, _>>()?;

    let mut cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(AllowMethods::list(methods))
        .max_age(Duration::from_secs(config.max_age_secs));

    if !allow_headers.is_empty() {
        cors = cors.allow_headers(AllowHeaders::list(allow_headers));
    }

    Ok(cors)
}

async fn wait_for_shutdown() -> ShutdownEvent {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownEvent::CtrlC,
            Err(error) => {
                tracing::warn!(%error, "failed to capture Ctrl+C signal");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => match term.recv().await {
                Some(_) => ShutdownEvent::SigTerm,
                None => ShutdownEvent::ListenerFailed,
            },
            Err(error) => {
                tracing::warn!(%error, "failed to capture SIGTERM");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending();

    tokio::select! {
        event = ctrl_c => event,
        event = sigterm => event,
    }
}

fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    let trimmed = addr.trim();
    if trimmed.is_empty() {
        return Err(ServerError::EmptyListenAddr);
    }

    trimmed
        .parse()
        .map_err(|source| ServerError::InvalidListenAddr {
            address: trimmed.to_string(),
            source,
        })
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: addr.to_string(),
            source,
        })
}

fn broadcast_shutdown(
    sender: watch::Sender<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        let event = wait_for_shutdown().await;
        debug_assert!(event != ShutdownEvent::Pending);
        if let Err(error) = sender.send(event) {
            tracing::warn!(?event, %error, "failed to broadcast shutdown event");
        }
    }
}

fn drain_timeout_future(
    mut receiver: watch::Receiver<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        if receiver.changed().await.is_ok() {
            let event = *receiver.borrow_and_update();
            tracing::info!(?event, "shutdown signal received; draining connections");
            tokio::time::sleep(DRAIN_TIMEOUT).await;
            tracing::warn!(
                ?event,
                seconds = DRAIN_TIMEOUT.as_secs(),
                "graceful shutdown timed out; continuing shutdown"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Article, SearchOutcome};
    use crate::config::TierLimitConfig;
    use crate::limit::RateCounterError;
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::num::{NonZeroU32, NonZeroU64};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    struct MockBackend {
        search_calls: AtomicUsize,
        parse_calls: AtomicUsize,
        status: TaskStatus,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                search_calls: AtomicUsize::new(0),
                parse_calls: AtomicUsize::new(0),
                status: TaskStatus::NotFound,
            }
        }

        fn with_status(status: TaskStatus) -> Self {
            Self {
                status,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl NewsBackend for MockBackend {
        async fn search(&self, query: &str) -> Result<SearchOutcome, BackendError> {
            self.search_calls.fetch_add(1, Ordering::SeqCst);
            Ok(SearchOutcome {
                articles: vec![Article {
                    id: 0,
                    title: Some(format!("about {query}")),
                    url: Some("https://example.com/a".to_string()),
                    author: "Unknown".to_string(),
                    publisher: "Unknown Source".to_string(),
                    published_at: None,
                    description: None,
                }],
                total_results: 1,
            })
        }

        async fn parse(&self, _url: &str) -> Result<String, BackendError> {
            self.parse_calls.fetch_add(1, Ordering::SeqCst);
            Ok("extracted text".to_string())
        }

        async fn start_analysis(&self, _content: &str) -> Result<String, BackendError> {
            Ok("6fa459ea-ee8a-4ca4-894e-db77e160355e".to_string())
        }

        async fn check_analysis(&self, _task_id: &str) -> Result<TaskStatus, BackendError> {
            Ok(self.status.clone())
        }

        async fn store_healthy(&self) -> bool {
            true
        }
    }

    /// In-process counter double; windows are tracked with `Instant` so they
    /// behave like store TTLs within a test's lifetime.
    struct MemoryCounters {
        counts: Mutex<HashMap<String, (u64, Instant)>>,
    }

    impl MemoryCounters {
        fn new() -> Self {
            Self {
                counts: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl RateCounterStore for MemoryCounters {
        async fn incr_window(
            &self,
            key: &str,
            window: Duration,
        ) -> Result<u64, RateCounterError> {
            let mut counts = self.counts.lock().await;
            let now = Instant::now();
            let entry = counts
                .entry(key.to_string())
                .or_insert_with(|| (0, now + window));
            if entry.1 <= now {
                *entry = (0, now + window);
            }
            entry.0 += 1;
            Ok(entry.0)
        }
    }

    struct FailingCounters;

    #[async_trait]
    impl RateCounterStore for FailingCounters {
        async fn incr_window(
            &self,
            _key: &str,
            _window: Duration,
        ) -> Result<u64, RateCounterError> {
            Err(RateCounterError("connection refused".to_string()))
        }
    }

    fn tier(max_requests: u32, window_secs: u64) -> TierLimitConfig {
        TierLimitConfig {
            max_requests: NonZeroU32::new(max_requests).expect("non-zero"),
            window_secs: NonZeroU64::new(window_secs).expect("non-zero"),
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig::default()
    }

    fn router_with(config: &ServerConfig, backend: Arc<MockBackend>) -> Router {
        build_router(config, backend, Arc::new(MemoryCounters::new())).expect("router builds")
    }

    async fn read_json(response: axum::response::Response) -> Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body readable")
            .to_bytes();
        serde_json::from_slice(bytes.as_ref()).expect("body is valid JSON")
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request builds")
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .expect("request builds")
    }

    #[tokio::test]
    async fn health_returns_ok_json() {
        let app = router_with(&test_config(), Arc::new(MockBackend::new()));
        let response = app.oneshot(get_request(HEALTH_PATH)).await.expect("responds");

        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["status"], "ok");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn detailed_health_reports_store_status() {
        let app = router_with(&test_config(), Arc::new(MockBackend::new()));
        let response = app
            .oneshot(get_request(HEALTH_DETAILED_PATH))
            .await
            .expect("responds");

        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["dependencies"]["redis"], "ok");
        assert!(body["uptime"]["seconds"].is_u64());
        assert!(body["process"]["pid"].is_u64());
    }

    #[tokio::test]
    async fn search_returns_normalized_articles() {
        let app = router_with(&test_config(), Arc::new(MockBackend::new()));
        let response = app
            .oneshot(post_json(SEARCH_PATH, json!({"query": "rust"})))
            .await
            .expect("responds");

        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["totalResults"], 1);
        assert_eq!(body["articles"][0]["title"], "about rust");
        assert_eq!(body["articles"][0]["publisher"], "Unknown Source");
    }

    #[tokio::test]
    async fn search_rejects_empty_query() {
        let backend = Arc::new(MockBackend::new());
        let app = router_with(&test_config(), backend.clone());
        let response = app
            .oneshot(post_json(SEARCH_PATH, json!({"query": "   "})))
            .await
            .expect("responds");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = read_json(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["message"], "Search query must be a non-empty string");
        assert_eq!(backend.search_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn search_rejects_invalid_json_body() {
        let app = router_with(&test_config(), Arc::new(MockBackend::new()));
        let request = Request::builder()
            .method("POST")
            .uri(SEARCH_PATH)
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .expect("request builds");
        let response = app.oneshot(request).await.expect("responds");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = read_json(response).await;
        assert_eq!(body["message"], "Invalid JSON in request body");
    }

    #[tokio::test]
    async fn parse_requires_absolute_url() {
        let app = router_with(&test_config(), Arc::new(MockBackend::new()));

        let missing = app
            .clone()
            .oneshot(get_request(PARSE_PATH))
            .await
            .expect("responds");
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(missing).await["message"], "URL is required");

        let invalid = app
            .clone()
            .oneshot(get_request("/api/parse?url=not-a-url"))
            .await
            .expect("responds");
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(invalid).await["message"], "Invalid URL format");

        let valid = app
            .oneshot(get_request("/api/parse?url=https%3A%2F%2Fexample.com%2Fstory"))
            .await
            .expect("responds");
        assert_eq!(valid.status(), StatusCode::OK);
        assert_eq!(read_json(valid).await, json!("extracted text"));
    }

    #[tokio::test]
    async fn content_length_boundary_is_inclusive() {
        let app = router_with(&test_config(), Arc::new(MockBackend::new()));

        let at_limit = "x".repeat(MAX_CONTENT_CHARS);
        let response = app
            .clone()
            .oneshot(post_json(START_ANALYSIS_PATH, json!({"content": at_limit})))
            .await
            .expect("responds");
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["status"], "success");
        assert!(is_valid_task_id(body["taskId"].as_str().expect("task id")));
        assert_eq!(body["message"], "Analysis task started");

        let over_limit = "x".repeat(MAX_CONTENT_CHARS + 1);
        let response = app
            .oneshot(post_json(START_ANALYSIS_PATH, json!({"content": over_limit})))
            .await
            .expect("responds");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = read_json(response).await;
        assert_eq!(
            body["message"],
            "Content is too long. Maximum 50,000 characters allowed."
        );
    }

    #[tokio::test]
    async fn whitespace_only_content_is_rejected() {
        let app = router_with(&test_config(), Arc::new(MockBackend::new()));
        let response = app
            .oneshot(post_json(START_ANALYSIS_PATH, json!({"content": " \n\t "})))
            .await
            .expect("responds");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = read_json(response).await;
        assert_eq!(body["message"], "Content must be a non-empty string");
    }

    #[tokio::test]
    async fn check_analysis_validates_task_id_shape() {
        let app = router_with(&test_config(), Arc::new(MockBackend::new()));
        let response = app
            .oneshot(get_request("/api/check-analysis/not-a-uuid"))
            .await
            .expect("responds");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(response).await["message"], "Invalid task ID format");
    }

    #[tokio::test]
    async fn check_analysis_renders_terminal_and_pending_states() {
        let task = "6fa459ea-ee8a-4ca4-894e-db77e160355e";

        let completed = MockBackend::with_status(TaskStatus::Completed {
            result: json!({"model": "test"}),
        });
        let app = router_with(&test_config(), Arc::new(completed));
        let body = read_json(
            app.oneshot(get_request(&format!("/api/check-analysis/{task}")))
                .await
                .expect("responds"),
        )
        .await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["result"]["model"], "test");
        assert!(body.get("error").is_none());

        let failed = MockBackend::with_status(TaskStatus::Failed {
            error: "analysis failed after 3 attempts: timeout".to_string(),
        });
        let app = router_with(&test_config(), Arc::new(failed));
        let body = read_json(
            app.oneshot(get_request(&format!("/api/check-analysis/{task}")))
                .await
                .expect("responds"),
        )
        .await;
        assert_eq!(body["status"], "failed");
        assert!(body.get("result").is_none());

        let queued = MockBackend::with_status(TaskStatus::Queued);
        let app = router_with(&test_config(), Arc::new(queued));
        let body = read_json(
            app.oneshot(get_request(&format!("/api/check-analysis/{task}")))
                .await
                .expect("responds"),
        )
        .await;
        assert_eq!(body, json!({"status": "queued"}));
    }

    #[tokio::test]
    async fn search_budget_rejects_eleventh_request_without_calling_provider() {
        let backend = Arc::new(MockBackend::new());
        let app = router_with(&test_config(), backend.clone());

        for _ in 0..10 {
            let response = app
                .clone()
                .oneshot(post_json(SEARCH_PATH, json!({"query": "rust"})))
                .await
                .expect("responds");
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .oneshot(post_json(SEARCH_PATH, json!({"query": "rust"})))
            .await
            .expect("responds");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = read_json(response).await;
        assert_eq!(
            body["message"],
            "Search rate limit exceeded. Maximum 10 searches per 5 minutes allowed."
        );
        assert_eq!(backend.search_calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn basic_tier_guards_unbudgeted_routes() {
        let mut config = test_config();
        config.rate_limit.basic = tier(3, 60);
        let backend = Arc::new(MockBackend::new());
        let app = router_with(&config, backend.clone());

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(get_request("/api/parse?url=https%3A%2F%2Fexample.com"))
                .await
                .expect("responds");
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .oneshot(get_request("/api/parse?url=https%3A%2F%2Fexample.com"))
            .await
            .expect("responds");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = read_json(response).await;
        assert_eq!(
            body["message"],
            "Too many requests from this IP, please try again after a minute"
        );
        assert_eq!(backend.parse_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn health_is_exempt_from_rate_limiting() {
        let mut config = test_config();
        config.rate_limit.basic = tier(1, 60);
        let app = router_with(&config, Arc::new(MockBackend::new()));

        for _ in 0..5 {
            let response = app
                .clone()
                .oneshot(get_request(HEALTH_PATH))
                .await
                .expect("responds");
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn counter_store_failure_rejects_the_request() {
        let config = test_config();
        let app = build_router(
            &config,
            Arc::new(MockBackend::new()),
            Arc::new(FailingCounters),
        )
        .expect("router builds");

        let response = app
            .oneshot(post_json(SEARCH_PATH, json!({"query": "rust"})))
            .await
            .expect("responds");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn unknown_route_returns_json_not_found() {
        let app = router_with(&test_config(), Arc::new(MockBackend::new()));
        let response = app
            .oneshot(get_request("/api/unknown"))
            .await
            .expect("responds");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = read_json(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["message"], "Not Found - /api/unknown");
    }

    #[test]
    fn task_id_shape_validation() {
        assert!(is_valid_task_id("6fa459ea-ee8a-4ca4-894e-db77e160355e"));
        assert!(is_valid_task_id("6FA459EA-EE8A-4CA4-894E-DB77E160355E"));
        assert!(!is_valid_task_id("6fa459eaee8a4ca4894edb77e160355e"));
        assert!(!is_valid_task_id("6fa459ea-ee8a-4ca4-894e-db77e160355"));
        assert!(!is_valid_task_id("6fa459ea-ee8a-4ca4-894e-db77e160355g"));
        assert!(!is_valid_task_id(""));
    }

    #[test]
    fn uptime_formatting_drops_leading_zero_units() {
        assert_eq!(format_uptime(0), "0s");
        assert_eq!(format_uptime(59), "59s");
        assert_eq!(format_uptime(61), "1m 1s");
        assert_eq!(format_uptime(3_661), "1h 1m 1s");
        assert_eq!(format_uptime(90_061), "1d 1h 1m 1s");
    }

    #[test]
    fn tier_selection_honors_opt_outs() {
        assert_eq!(applicable_tiers(HEALTH_PATH), &[] as &[Tier]);
        assert_eq!(applicable_tiers(HEALTH_DETAILED_PATH), &[] as &[Tier]);
        assert_eq!(applicable_tiers(SEARCH_PATH), &[Tier::Api, Tier::Search]);
        assert_eq!(
            applicable_tiers(START_ANALYSIS_PATH),
            &[Tier::Api, Tier::Analysis]
        );
        assert_eq!(applicable_tiers(PARSE_PATH), &[Tier::Basic, Tier::Api]);
        assert_eq!(applicable_tiers("/other"), &[Tier::Basic]);
    }
}
