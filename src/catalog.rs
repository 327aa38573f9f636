use std::{sync::Arc, time::Duration};

use axum::body::Body;
use futures_util::future;
use http_body_util::BodyExt;
use hyper::Request;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::state::{Backend, HttpClient};

/// Fetch the model list a backend advertises on `GET /v1/models`.
///
/// Expects the OpenAI list shape: `{"data": [{"id": "...", ...}, ...]}`.
pub async fn fetch_models(
    client: &HttpClient,
    url: &str,
    timeout_secs: u64,
) -> Result<Vec<String>, String> {
    let models_url = format!("{}/v1/models", url.trim_end_matches('/'));
    let req = Request::builder()
        .method("GET")
        .uri(&models_url)
        .body(Body::empty())
        .map_err(|e| format!("Failed to build request: {}", e))?;

    let response = match timeout(Duration::from_secs(timeout_secs), client.request(req)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return Err(format!("Model list fetch failed: {}", e)),
        Err(_) => return Err(format!("Model list fetch timed out after {}s", timeout_secs)),
    };

    if !response.status().is_success() {
        return Err(format!(
            "Model list fetch returned status: {}",
            response.status()
        ));
    }

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| format!("Failed to read model list body: {}", e))?
        .to_bytes();

    let json: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| format!("Failed to parse model list JSON: {}", e))?;

    let models = json
        .get("data")
        .and_then(|d| d.as_array())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.get("id").and_then(|id| id.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(models)
}

/// Refresh one backend's model list; a failed fetch retains the previous
/// value.
pub async fn refresh_backend(client: &HttpClient, backend: &Backend, timeout_secs: u64) {
    match fetch_models(client, &backend.config.url, timeout_secs).await {
        Ok(models) => {
            info!(
                "Updated models for {}: {} models - {:?}",
                backend.config.url,
                models.len(),
                models
            );
            backend.set_models(models);
        }
        Err(e) => {
            warn!("Failed to fetch models from {}: {}", backend.config.url, e);
        }
    }
}

/// Refresh every backend concurrently.
pub async fn refresh_all(client: &HttpClient, backends: &[Arc<Backend>], timeout_secs: u64) {
    let refreshes: Vec<_> = backends
        .iter()
        .map(|backend| {
            let client = client.clone();
            let backend = Arc::clone(backend);
            async move { refresh_backend(&client, &backend, timeout_secs).await }
        })
        .collect();
    future::join_all(refreshes).await;
}

/// Refresh only the currently healthy backends.
pub async fn refresh_healthy(client: &HttpClient, backends: &[Arc<Backend>], timeout_secs: u64) {
    let healthy: Vec<Arc<Backend>> = backends
        .iter()
        .filter(|b| b.is_healthy())
        .cloned()
        .collect();
    refresh_all(client, &healthy, timeout_secs).await;
}

/// Union of all known models, deduped in first-seen order. Each entry
/// carries the epoch seconds of the advertising backend's last catalog
/// update, for the synthesized model listing.
pub fn model_union(backends: &[Arc<Backend>]) -> Vec<(String, u64)> {
    let mut seen: Vec<(String, u64)> = Vec::new();

    for backend in backends {
        let updated = backend
            .models_last_updated()
            .map(crate::load::epoch_secs)
            .unwrap_or(0);
        for model in backend.models() {
            if !seen.iter().any(|(m, _)| *m == model) {
                seen.push((model, updated));
            }
        }
    }

    seen
}
