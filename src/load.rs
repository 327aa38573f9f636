use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use axum::body::Body;
use futures_util::future;
use http_body_util::BodyExt;
use hyper::Request;
use metrics::gauge;
use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::state::{AppState, HttpClient, RouterState};

/// How often the sampler scrapes backend telemetry.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Telemetry fetches get a fixed budget independent of `request_timeout`.
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// One backend's telemetry snapshot, replaced wholesale on each sample.
#[derive(Debug, Clone, Copy)]
pub struct LoadSnapshot {
    pub num_requests_running: u64,
    pub num_requests_waiting: u64,
    pub gpu_cache_usage_perc: f64,
    pub process_max_fds: u64,
    pub last_updated: Option<SystemTime>,
}

impl Default for LoadSnapshot {
    fn default() -> Self {
        Self {
            num_requests_running: 0,
            num_requests_waiting: 0,
            gpu_cache_usage_perc: 0.0,
            process_max_fds: 65535,
            last_updated: None,
        }
    }
}

impl LoadSnapshot {
    /// Combined load, capped by an estimate of what the process can hold.
    pub fn system_load(&self) -> u64 {
        let total = self.num_requests_running + self.num_requests_waiting;
        total.min((self.process_max_fds / 1000).max(1))
    }
}

#[derive(Clone, Copy)]
enum MetricField {
    RequestsRunning,
    RequestsWaiting,
    GpuCacheUsage,
    MaxFds,
}

// Recognized metric name prefixes. Lines look like
// `vllm:num_requests_running{engine="0",model_name="m"} 15.0`; the value is
// the last whitespace-separated token.
const METRIC_TABLE: &[(&str, MetricField)] = &[
    ("vllm:num_requests_running", MetricField::RequestsRunning),
    ("vllm:num_requests_waiting", MetricField::RequestsWaiting),
    ("vllm:gpu_cache_usage_perc", MetricField::GpuCacheUsage),
    ("process_max_fds", MetricField::MaxFds),
];

/// Parse Prometheus-format vLLM telemetry into a snapshot. Unrecognized
/// lines and unparsable values are skipped; fields keep their defaults.
pub fn parse_vllm_metrics(text: &str) -> LoadSnapshot {
    let mut snapshot = LoadSnapshot::default();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((_, field)) = METRIC_TABLE.iter().find(|(prefix, _)| line.starts_with(prefix))
        else {
            continue;
        };
        let Some(value) = line
            .split_whitespace()
            .last()
            .and_then(|token| token.parse::<f64>().ok())
        else {
            continue;
        };

        match field {
            MetricField::RequestsRunning => snapshot.num_requests_running = value as u64,
            MetricField::RequestsWaiting => snapshot.num_requests_waiting = value as u64,
            MetricField::GpuCacheUsage => snapshot.gpu_cache_usage_perc = value,
            MetricField::MaxFds => snapshot.process_max_fds = value as u64,
        }
    }

    snapshot
}

/// Fetch `{url}/metrics` and parse it.
pub async fn fetch_backend_load(client: &HttpClient, url: &str) -> Result<LoadSnapshot, String> {
    let metrics_url = format!("{}/metrics", url.trim_end_matches('/'));
    let req = Request::builder()
        .method("GET")
        .uri(&metrics_url)
        .body(Body::empty())
        .map_err(|e| format!("Failed to build request: {}", e))?;

    let response = match timeout(FETCH_TIMEOUT, client.request(req)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return Err(format!("Metrics fetch failed: {}", e)),
        Err(_) => {
            return Err(format!(
                "Metrics fetch timed out after {}s",
                FETCH_TIMEOUT.as_secs()
            ))
        }
    };

    if !response.status().is_success() {
        return Err(format!("Metrics fetch returned status: {}", response.status()));
    }

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| format!("Failed to read metrics body: {}", e))?
        .to_bytes();

    Ok(parse_vllm_metrics(&String::from_utf8_lossy(&body)))
}

/// Periodic sampling loop. Only healthy backends are scraped; a failed fetch
/// keeps the previous snapshot and never flips health.
pub async fn load_sample_loop(state: Arc<AppState>) {
    loop {
        let current = state.state.load_full();

        let fetches: Vec<_> = current
            .backends
            .iter()
            .filter(|b| b.is_healthy())
            .map(|backend| {
                let client = state.client.clone();
                let backend = Arc::clone(backend);
                async move {
                    let result = fetch_backend_load(&client, &backend.config.url).await;
                    (backend, result)
                }
            })
            .collect();

        for (backend, result) in future::join_all(fetches).await {
            match result {
                Ok(mut snapshot) => {
                    snapshot.last_updated = Some(SystemTime::now());
                    debug!(
                        "Load sample for {}: running={}, waiting={}, system_load={}",
                        backend.config.url,
                        snapshot.num_requests_running,
                        snapshot.num_requests_waiting,
                        snapshot.system_load()
                    );
                    gauge!("router_backend_load", "backend" => backend.config.url.clone())
                        .set(snapshot.system_load() as f64);
                    backend.set_load(snapshot);
                }
                Err(e) => {
                    warn!("Failed to get metrics from {}: {}", backend.config.url, e);
                }
            }
        }

        drop(current);
        sleep(SAMPLE_INTERVAL).await;
    }
}

#[derive(Debug, Serialize)]
pub struct DetailedMetrics {
    pub num_requests_running: u64,
    pub num_requests_waiting: u64,
    pub gpu_cache_usage_perc: f64,
    pub process_max_fds: u64,
}

#[derive(Debug, Serialize)]
pub struct ServerLoad {
    pub url: String,
    pub current_load: u64,
    pub max_capacity: u32,
    pub available_capacity: u64,
    pub utilization_percent: f64,
    pub status: bool,
    pub last_updated: Option<u64>,
    pub detailed_metrics: DetailedMetrics,
}

#[derive(Debug, Serialize)]
pub struct LoadSummary {
    pub total_servers: usize,
    pub healthy_servers: usize,
    pub total_active_load: u64,
    pub total_capacity: u64,
    pub overall_utilization_percent: f64,
}

#[derive(Debug, Serialize)]
pub struct LoadStats {
    pub servers: Vec<ServerLoad>,
    pub summary: LoadSummary,
}

/// Aggregate the per-backend snapshots for the `/load-stats` endpoint.
pub fn collect_load_stats(state: &RouterState) -> LoadStats {
    let mut servers = Vec::with_capacity(state.backends.len());
    let mut healthy_servers = 0;
    let mut total_active_load = 0u64;
    let mut total_capacity = 0u64;

    for backend in &state.backends {
        let snapshot = backend.load();
        let load = snapshot.system_load();
        let capacity = backend.config.max_concurrent_requests;
        let healthy = backend.is_healthy();

        if healthy {
            healthy_servers += 1;
        }
        total_active_load += load;
        total_capacity += capacity as u64;

        let utilization = if capacity > 0 {
            (load as f64 / capacity as f64 * 100.0).min(100.0)
        } else {
            0.0
        };

        servers.push(ServerLoad {
            url: backend.config.url.clone(),
            current_load: load,
            max_capacity: capacity,
            available_capacity: (capacity as u64).saturating_sub(load),
            utilization_percent: utilization,
            status: healthy,
            last_updated: snapshot.last_updated.map(epoch_secs),
            detailed_metrics: DetailedMetrics {
                num_requests_running: snapshot.num_requests_running,
                num_requests_waiting: snapshot.num_requests_waiting,
                gpu_cache_usage_perc: snapshot.gpu_cache_usage_perc,
                process_max_fds: snapshot.process_max_fds,
            },
        });
    }

    let overall_utilization = if total_capacity > 0 {
        total_active_load as f64 / total_capacity as f64 * 100.0
    } else {
        0.0
    };

    LoadStats {
        servers,
        summary: LoadSummary {
            total_servers: state.backends.len(),
            healthy_servers,
            total_active_load,
            total_capacity,
            overall_utilization_percent: overall_utilization,
        },
    }
}

pub fn epoch_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Logs a one-line fleet summary at a fixed cadence. This replaces the
/// original interactive monitor; `show_models` adds the model column.
pub async fn fleet_summary_loop(state: Arc<AppState>, show_models: bool) {
    const SUMMARY_INTERVAL: Duration = Duration::from_secs(30);

    loop {
        sleep(SUMMARY_INTERVAL).await;

        let current = state.state.load();
        let stats = collect_load_stats(&current);

        if show_models {
            for backend in &current.backends {
                let models = backend.models();
                info!(
                    "Server {}: healthy={}, load={}, models=[{}]",
                    backend.config.url,
                    backend.is_healthy(),
                    backend.load().system_load(),
                    models.join(", ")
                );
            }
        }

        info!(
            "Load status: {}/{} servers healthy, total load {}, utilization {:.1}%",
            stats.summary.healthy_servers,
            stats.summary.total_servers,
            stats.summary.total_active_load,
            stats.summary.overall_utilization_percent
        );
    }
}
