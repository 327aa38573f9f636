use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use axum::{
    body::{Body, Bytes},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream;

/// A configurable in-process vLLM stand-in for tests and benchmarks.
///
/// Serves the endpoints the router consumes: `/health`, `/v1/models`,
/// `/metrics`, and the forwarded OpenAI paths.
#[derive(Clone)]
pub struct MockVllm {
    pub models: Vec<String>,
    pub running: u64,
    pub waiting: u64,
    pub max_fds: u64,
    pub gpu_cache_usage: f64,
    /// Status forced onto every completion response, e.g. 500.
    pub fail_status: Option<u16>,
    /// Delay applied before answering completion requests.
    pub delay_ms: u64,
    /// When set, chat completions respond as an SSE stream of these chunks.
    pub sse_chunks: Option<Vec<String>>,
    /// Whether `/health` reports success.
    pub healthy: bool,
}

impl Default for MockVllm {
    fn default() -> Self {
        Self {
            models: vec!["mock-model".to_string()],
            running: 0,
            waiting: 0,
            max_fds: 65535,
            gpu_cache_usage: 0.0,
            fail_status: None,
            delay_ms: 0,
            sse_chunks: None,
            healthy: true,
        }
    }
}

/// Handle to a spawned mock backend.
pub struct MockVllmHandle {
    pub url: String,
    hits: Arc<AtomicUsize>,
}

impl MockVllmHandle {
    /// Number of completion requests this backend has served.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }
}

impl MockVllm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_load(mut self, running: u64, waiting: u64) -> Self {
        self.running = running;
        self.waiting = waiting;
        self
    }

    pub fn with_fail_status(mut self, status: u16) -> Self {
        self.fail_status = Some(status);
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_sse_chunks(mut self, chunks: &[&str]) -> Self {
        self.sse_chunks = Some(chunks.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    fn metrics_text(&self) -> String {
        format!(
            "# HELP vllm:num_requests_running Number of requests currently running.\n\
             # TYPE vllm:num_requests_running gauge\n\
             vllm:num_requests_running{{model_name=\"mock\"}} {}\n\
             vllm:num_requests_waiting{{model_name=\"mock\"}} {}\n\
             vllm:gpu_cache_usage_perc{{model_name=\"mock\"}} {}\n\
             process_max_fds {}\n",
            self.running, self.waiting, self.gpu_cache_usage, self.max_fds
        )
    }

    /// Bind a random local port and serve until the handle is dropped.
    pub async fn spawn(self) -> MockVllmHandle {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock backend");
        let addr = listener.local_addr().expect("mock backend addr");
        let hits = Arc::new(AtomicUsize::new(0));

        let app = self.into_router(Arc::clone(&hits));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        MockVllmHandle {
            url: format!("http://{}", addr),
            hits,
        }
    }

    fn into_router(self, hits: Arc<AtomicUsize>) -> Router {
        let config = Arc::new(self);

        let health_config = Arc::clone(&config);
        let models_config = Arc::clone(&config);
        let metrics_config = Arc::clone(&config);
        let completion_config = Arc::clone(&config);

        let completion = move || {
            let config = Arc::clone(&completion_config);
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::Relaxed);

                if config.delay_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(config.delay_ms)).await;
                }

                if let Some(status) = config.fail_status {
                    let status =
                        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                    return (status, "mock failure").into_response();
                }

                if let Some(chunks) = &config.sse_chunks {
                    let frames: Vec<Result<Bytes, Infallible>> = chunks
                        .iter()
                        .map(|c| Ok(Bytes::from(format!("data: {}\n\n", c))))
                        .collect();
                    return Response::builder()
                        .status(StatusCode::OK)
                        .header(header::CONTENT_TYPE, "text/event-stream")
                        .body(Body::from_stream(stream::iter(frames)))
                        .expect("mock sse response")
                        .into_response();
                }

                Json(serde_json::json!({
                    "id": "cmpl-mock",
                    "object": "chat.completion",
                    "model": config.models.first().cloned().unwrap_or_default(),
                    "choices": [
                        {"index": 0, "message": {"role": "assistant", "content": "ok"}}
                    ],
                }))
                .into_response()
            }
        };

        Router::new()
            .route(
                "/health",
                get(move || {
                    let config = Arc::clone(&health_config);
                    async move {
                        if config.healthy {
                            (StatusCode::OK, "ok").into_response()
                        } else {
                            (StatusCode::INTERNAL_SERVER_ERROR, "down").into_response()
                        }
                    }
                }),
            )
            .route(
                "/v1/models",
                get(move || {
                    let config = Arc::clone(&models_config);
                    async move {
                        let data: Vec<serde_json::Value> = config
                            .models
                            .iter()
                            .map(|m| serde_json::json!({"id": m, "object": "model"}))
                            .collect();
                        Json(serde_json::json!({"object": "list", "data": data}))
                    }
                }),
            )
            .route(
                "/metrics",
                get(move || {
                    let config = Arc::clone(&metrics_config);
                    async move { config.metrics_text() }
                }),
            )
            .route("/v1/chat/completions", post(completion.clone()))
            .route("/v1/completions", post(completion.clone()))
            .route("/v1/embeddings", post(completion))
    }
}
