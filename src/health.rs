use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::body::Body;
use futures_util::future;
use hyper::Request;
use metrics::gauge;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::{
    catalog,
    state::{AppState, HttpClient},
};

// Probe endpoints, tried in order; success on either counts.
const PROBE_PATHS: &[&str] = &["/health", "/v1/models"];

// Model catalog refresh piggybacks on every Nth health tick.
const MODEL_REFRESH_EVERY: u64 = 10;

/// Probe a backend for liveness: `/health` first, `/v1/models` as fallback.
/// Connect errors, timeouts, and non-2xx all count as failure of that
/// endpoint.
pub async fn probe_backend(client: &HttpClient, url: &str, timeout_secs: u64) -> bool {
    for path in PROBE_PATHS {
        let probe_url = format!("{}{}", url.trim_end_matches('/'), path);
        let req = match Request::builder()
            .method("GET")
            .uri(&probe_url)
            .body(Body::empty())
        {
            Ok(req) => req,
            Err(_) => continue,
        };

        match timeout(Duration::from_secs(timeout_secs), client.request(req)).await {
            Ok(Ok(response)) if response.status().is_success() => return true,
            Ok(Ok(response)) => {
                debug!("Probe {} returned status {}", probe_url, response.status());
            }
            Ok(Err(e)) => {
                debug!("Probe {} failed: {}", probe_url, e);
            }
            Err(_) => {
                debug!("Probe {} timed out after {}s", probe_url, timeout_secs);
            }
        }
    }
    false
}

/// The health monitor task.
///
/// Every tick: run the auto-recovery sweep, then (when active checking is
/// enabled) probe every backend concurrently and update its rolling stats.
/// Every tenth tick also refreshes the model catalog so the two never need
/// separate scheduling.
pub async fn health_check_loop(state: Arc<AppState>) {
    let mut tick: u64 = 0;

    loop {
        let current = state.state.load_full();
        let config = current.app_config;
        tick += 1;

        for backend in &current.backends {
            if backend.try_auto_recover(&config) {
                info!(
                    "Server {} reset for auto-recovery attempt (no recent failures in {}s)",
                    backend.config.url, config.auto_recovery_threshold
                );
            }
        }

        if config.enable_active_health_check {
            let probes: Vec<_> = current
                .backends
                .iter()
                .map(|backend| {
                    let client = state.client.clone();
                    let backend = Arc::clone(backend);
                    async move {
                        let started = Instant::now();
                        let ok =
                            probe_backend(&client, &backend.config.url, config.health_check_timeout)
                                .await;
                        (backend, ok, started.elapsed().as_secs_f64())
                    }
                })
                .collect();

            let results = future::join_all(probes).await;

            let mut healthy_count = 0;
            for (backend, ok, elapsed) in results {
                match backend.record_probe(ok, elapsed, &config) {
                    Some(true) => {
                        let snapshot = backend.snapshot();
                        info!(
                            "Server {} recovered - success_rate: {:.2}, avg_response_time: {:.2}s",
                            backend.config.url,
                            snapshot.stats.success_rate,
                            snapshot.stats.avg_response_time
                        );
                    }
                    Some(false) => {
                        let snapshot = backend.snapshot();
                        warn!(
                            "Server {} marked as unhealthy - success_rate: {:.2}, avg_response_time: {:.2}s, consecutive_failures: {}",
                            backend.config.url,
                            snapshot.stats.success_rate,
                            snapshot.stats.avg_response_time,
                            snapshot.consecutive_failures
                        );
                    }
                    None => {}
                }

                if backend.is_healthy() {
                    healthy_count += 1;
                } else if !ok {
                    debug!(
                        "Health check failed for {} (elapsed: {:.2}s)",
                        backend.config.url, elapsed
                    );
                }

                gauge!("router_backend_health", "backend" => backend.config.url.clone())
                    .set(if backend.is_healthy() { 1.0 } else { 0.0 });
            }

            if !current.backends.is_empty() {
                info!(
                    "Health check completed: {}/{} servers healthy",
                    healthy_count,
                    current.backends.len()
                );
            }
        }

        if tick % MODEL_REFRESH_EVERY == 0 {
            info!("Updating model information during health check cycle...");
            catalog::refresh_all(&state.client, &current.backends, config.health_check_timeout)
                .await;
        }

        // Release the generation before sleeping so a reload can drop it.
        drop(current);
        sleep(Duration::from_secs(config.health_check_interval)).await;
    }
}
