use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::{header, HeaderMap, Method, Request, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::BodyExt;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::{
    catalog, load,
    state::{AppState, HttpClient},
};

const MAX_BODY_SIZE: usize = 10 * 1024 * 1024; // 10 MB

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Model ID extracted from the request, riding in a request extension.
#[derive(Clone)]
pub struct RequestedModel(pub String);

/// Backend URL chosen by the dispatcher, riding in a response extension.
#[derive(Clone)]
pub struct SelectedBackend(pub String);

// Partial zero-copy deserialization: only the 'model' field is captured,
// borrowed from the body buffer.
#[derive(Deserialize)]
struct ModelProbe<'a> {
    #[serde(borrow)]
    model: Option<&'a str>,
}

/// Pull the requested model out of the request and stash it in an extension.
///
/// Chat and text completions carry the model in the JSON body, which is read
/// once and reattached; everything else is checked for a `model` query
/// parameter. Any decoding failure means "no model specified", never an
/// error to the client.
pub async fn extract_model(mut req: Request<Body>, next: Next) -> Response {
    let reads_body = req.method() == Method::POST
        && matches!(
            req.uri().path(),
            "/v1/chat/completions" | "/v1/completions"
        );

    if reads_body {
        let (parts, body) = req.into_parts();
        let body_bytes = match to_bytes(body, MAX_BODY_SIZE).await {
            Ok(bytes) => bytes,
            Err(_) => {
                return next.run(Request::from_parts(parts, Body::empty())).await;
            }
        };

        let model = serde_json::from_slice::<ModelProbe>(&body_bytes)
            .ok()
            .and_then(|probe| probe.model.map(str::to_string));

        req = Request::from_parts(parts, Body::from(body_bytes));
        if let Some(model) = model {
            req.extensions_mut().insert(RequestedModel(model));
        }
        return next.run(req).await;
    }

    if let Some(model) = req.uri().query().and_then(query_model) {
        req.extensions_mut().insert(RequestedModel(model));
    }
    next.run(req).await
}

fn query_model(query: &str) -> Option<String> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("model="))
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub async fn log_requests(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let model = req.extensions().get::<RequestedModel>().cloned();

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed();

    let backend = response.extensions().get::<SelectedBackend>().cloned();

    match (model, backend) {
        (Some(RequestedModel(m)), Some(SelectedBackend(b))) => info!(
            "{} {} {} {:?} model={} backend={}",
            method,
            path,
            response.status(),
            duration,
            m,
            b
        ),
        (Some(RequestedModel(m)), None) => info!(
            "{} {} {} {:?} model={}",
            method,
            path,
            response.status(),
            duration,
            m
        ),
        (None, Some(SelectedBackend(b))) => info!(
            "{} {} {} {:?} backend={}",
            method,
            path,
            response.status(),
            duration,
            b
        ),
        (None, None) => info!("{} {} {} {:?}", method, path, response.status(), duration),
    }

    response
}

pub async fn track_metrics(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let model = req
        .extensions()
        .get::<RequestedModel>()
        .map(|m| m.0.clone())
        .unwrap_or_else(|| "none".to_string());

    let response = next.run(req).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();
    let backend = response
        .extensions()
        .get::<SelectedBackend>()
        .map(|b| b.0.clone())
        .unwrap_or_else(|| "none".to_string());

    histogram!("router_request_duration_seconds", "model" => model.clone(), "backend" => backend.clone()).record(duration);
    counter!("router_requests_total", "method" => method, "status" => status, "model" => model, "backend" => backend).increment(1);

    response
}

/// Sanitized error body: the client never sees a raw backend error.
pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let kind = if status == StatusCode::INTERNAL_SERVER_ERROR {
        "internal_error"
    } else {
        "http_error"
    };
    let mut response = Json(serde_json::json!({
        "error": {
            "message": message.into(),
            "type": kind,
            "code": status.as_u16(),
        }
    }))
    .into_response();
    *response.status_mut() = status;
    response
}

enum AttemptError {
    Transport(String),
    Timeout,
    Status(StatusCode),
    Internal(String),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Transport(msg) => write!(f, "{}", msg),
            AttemptError::Timeout => write!(f, "request timed out"),
            AttemptError::Status(status) => write!(f, "backend returned status {}", status),
            AttemptError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

/// One forwarding attempt against a specific backend.
async fn attempt_forward(
    client: &HttpClient,
    backend_url: &str,
    method: &Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: &Bytes,
    request_timeout: Duration,
) -> Result<Response, AttemptError> {
    let target = format!("{}{}", backend_url.trim_end_matches('/'), path_and_query);
    let uri: Uri = target
        .parse()
        .map_err(|e| AttemptError::Internal(format!("Invalid backend URI '{}': {}", target, e)))?;

    let host_value = uri.host().map(|host| match uri.port_u16() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    });

    let req_body = if method == Method::POST || method == Method::PUT || method == Method::PATCH {
        Body::from(body.clone())
    } else {
        Body::empty()
    };

    let mut req = Request::builder()
        .method(method.clone())
        .uri(uri)
        .body(req_body)
        .map_err(|e| AttemptError::Internal(format!("Failed to build request: {}", e)))?;
    *req.headers_mut() = headers.clone();

    // Host must match the backend, not the router
    if let Some(value) = host_value.and_then(|v| v.parse().ok()) {
        req.headers_mut().insert(header::HOST, value);
    }

    let response = match timeout(request_timeout, client.request(req)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return Err(AttemptError::Transport(e.to_string())),
        Err(_) => return Err(AttemptError::Timeout),
    };

    let status = response.status();
    if status.as_u16() >= 400 {
        return Err(AttemptError::Status(status));
    }

    let is_event_stream = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/event-stream"))
        .unwrap_or(false);

    if is_event_stream {
        // Streaming pass-through: status, headers, and chunks verbatim.
        // A mid-stream backend error is logged and ends the client stream;
        // no retry once any bytes have been delivered.
        let stream_source = backend_url.to_string();
        let (parts, body) = response.into_parts();
        let stream = body.into_data_stream().inspect_err(move |e| {
            warn!("Error streaming response from {}: {}", stream_source, e);
        });
        return Ok(Response::from_parts(parts, Body::from_stream(stream)));
    }

    let (parts, body) = response.into_parts();
    let collected = match timeout(request_timeout, body.collect()).await {
        Ok(Ok(collected)) => collected.to_bytes(),
        Ok(Err(e)) => {
            return Err(AttemptError::Transport(format!(
                "Failed to read response body: {}",
                e
            )))
        }
        Err(_) => return Err(AttemptError::Timeout),
    };

    Ok(Response::from_parts(parts, Body::from(collected)))
}

/// Select, forward, and retry with resignation across backends.
async fn forward_with_retry(
    state: &AppState,
    method: Method,
    path_and_query: String,
    headers: HeaderMap,
    body: Bytes,
    model: Option<String>,
) -> Response {
    let config = state.app_config();
    let request_timeout = Duration::from_secs(config.request_timeout);
    let mut attempt: u32 = 0;

    loop {
        let backend = match state.select_backend(model.as_deref()) {
            Ok(backend) => backend,
            Err(e) => {
                warn!("{} for {} {}", e.message(), method, path_and_query);
                return error_response(StatusCode::SERVICE_UNAVAILABLE, e.message());
            }
        };
        let backend_url = backend.config.url.clone();

        info!(
            "Forwarding {} {} to {} (attempt {}/{})",
            method,
            path_and_query,
            backend_url,
            attempt + 1,
            config.max_retries + 1
        );

        match attempt_forward(
            &state.client,
            &backend_url,
            &method,
            &path_and_query,
            &headers,
            &body,
            request_timeout,
        )
        .await
        {
            Ok(mut response) => {
                response
                    .extensions_mut()
                    .insert(SelectedBackend(backend_url));
                return response;
            }
            Err(AttemptError::Internal(msg)) => {
                error!(
                    "Unexpected error for request {} {}: {}",
                    method, path_and_query, msg
                );
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
            }
            Err(e) => {
                warn!("Request failed on {}: {}", backend_url, e);

                if let Some(false) = backend.update_health(false, &config) {
                    warn!(
                        "Server {} marked as unhealthy after forwarding failures",
                        backend_url
                    );
                }

                if attempt >= config.max_retries {
                    error!(
                        "Request {} {} exceeded max retry count ({})",
                        method, path_and_query, config.max_retries
                    );
                    return if matches!(e, AttemptError::Timeout) {
                        error_response(
                            StatusCode::GATEWAY_TIMEOUT,
                            format!(
                                "Upstream request timed out after {}s",
                                config.request_timeout
                            ),
                        )
                    } else {
                        error_response(
                            StatusCode::BAD_GATEWAY,
                            "Bad gateway - max retries exceeded",
                        )
                    };
                }

                attempt += 1;
                sleep(RETRY_BACKOFF).await;
            }
        }
    }
}

/// Forwarding entry point for the OpenAI surface.
pub async fn forward(State(state): State<Arc<AppState>>, req: Request<Body>) -> Response {
    let model = req.extensions().get::<RequestedModel>().map(|m| m.0.clone());
    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut headers = req.headers().clone();
    headers.remove(header::HOST);

    let body = match to_bytes(req.into_body(), MAX_BODY_SIZE).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to read request body for {}: {}", path_and_query, e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
        }
    };

    forward_with_retry(&state, method, path_and_query, headers, body, model).await
}

#[derive(Serialize)]
pub struct ServerHealth {
    pub url: String,
    pub healthy: bool,
    pub last_check: Option<u64>,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub avg_response_time: f64,
    pub last_response_time: Option<f64>,
    pub total_checks: u64,
    pub supported_models: Vec<String>,
    pub models_last_updated: Option<u64>,
}

#[derive(Serialize)]
pub struct HealthCheckSettings {
    pub health_check_enabled: bool,
    pub health_check_interval: u64,
    pub min_success_rate: f64,
    pub max_response_time: f64,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub health_score: f64,
    pub total_servers: usize,
    pub healthy_servers: usize,
    pub unhealthy_servers: usize,
    pub servers: Vec<ServerHealth>,
    pub config: HealthCheckSettings,
}

pub async fn health_endpoint(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let current = state.state.load();
    let config = current.app_config;

    let total_servers = current.backends.len();
    let healthy_servers = current.backends.iter().filter(|b| b.is_healthy()).count();

    let (status, health_score) = if total_servers == 0 {
        ("no_servers", 0.0)
    } else {
        let ratio = healthy_servers as f64 / total_servers as f64;
        let status = if ratio >= 0.8 {
            "healthy"
        } else if ratio >= 0.5 {
            "degraded"
        } else {
            "unhealthy"
        };
        (status, ratio)
    };

    let servers = current
        .backends
        .iter()
        .map(|backend| {
            let snapshot = backend.snapshot();
            ServerHealth {
                url: backend.config.url.clone(),
                healthy: backend.is_healthy(),
                last_check: snapshot.last_check.map(load::epoch_secs),
                consecutive_failures: snapshot.consecutive_failures,
                success_rate: snapshot.stats.success_rate,
                avg_response_time: snapshot.stats.avg_response_time,
                last_response_time: snapshot.stats.last_response_time,
                total_checks: snapshot.stats.total_checks,
                supported_models: snapshot.supported_models,
                models_last_updated: snapshot.models_last_updated.map(load::epoch_secs),
            }
        })
        .collect();

    Json(HealthResponse {
        status: status.to_string(),
        health_score,
        total_servers,
        healthy_servers,
        unhealthy_servers: total_servers - healthy_servers,
        servers,
        config: HealthCheckSettings {
            health_check_enabled: config.enable_active_health_check,
            health_check_interval: config.health_check_interval,
            min_success_rate: config.health_check_min_success_rate,
            max_response_time: config.health_check_max_response_time,
        },
    })
}

/// Synthesized OpenAI model listing: the union of every model the healthy
/// fleet advertises, refreshed on demand.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    let current = state.state.load_full();
    let config = current.app_config;

    catalog::refresh_healthy(&state.client, &current.backends, config.health_check_timeout).await;

    let data: Vec<serde_json::Value> = catalog::model_union(&current.backends)
        .into_iter()
        .map(|(id, created)| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": "vllm-router",
            })
        })
        .collect();

    Json(serde_json::json!({ "object": "list", "data": data })).into_response()
}

pub async fn load_stats_endpoint(State(state): State<Arc<AppState>>) -> Json<load::LoadStats> {
    let current = state.state.load();
    Json(load::collect_load_stats(&current))
}

/// Forced catalog refresh, then a dump of every backend's model list.
pub async fn server_models_endpoint(State(state): State<Arc<AppState>>) -> Response {
    let current = state.state.load_full();
    let config = current.app_config;

    catalog::refresh_all(&state.client, &current.backends, config.health_check_timeout).await;

    let mut servers = serde_json::Map::new();
    for backend in &current.backends {
        servers.insert(
            backend.config.url.clone(),
            serde_json::json!({
                "supported_models": backend.models(),
                "models_last_updated": backend.models_last_updated().map(load::epoch_secs),
                "healthy": backend.is_healthy(),
            }),
        );
    }

    let healthy = current.backends.iter().filter(|b| b.is_healthy()).count();
    Json(serde_json::json!({
        "servers": servers,
        "total_servers": current.backends.len(),
        "healthy_servers": healthy,
    }))
    .into_response()
}

pub async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "vLLM Router",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

/// Assemble the public router. The metrics handle is optional so tests can
/// build the full surface without installing a recorder.
pub fn build_router(state: Arc<AppState>, metrics: Option<PrometheusHandle>) -> Router {
    use tower_http::cors::CorsLayer;

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_endpoint))
        .route("/load-stats", get(load_stats_endpoint))
        .route("/server-models", get(server_models_endpoint))
        .route(
            "/metrics",
            get(move || {
                let handle = metrics.clone();
                async move { handle.map(|h| h.render()).unwrap_or_default() }
            }),
        )
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(forward))
        .route("/v1/completions", post(forward))
        .route("/v1/embeddings", post(forward))
        .route("/v1/*path", any(forward))
        .layer(middleware::from_fn(track_metrics))
        .layer(middleware::from_fn(log_requests))
        .layer(middleware::from_fn(extract_model))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
