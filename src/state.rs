use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    time::{Duration, Instant, SystemTime},
};

use arc_swap::ArcSwap;
use axum::body::Body;
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use rand::Rng;

use crate::{
    config::{AppConfig, RouterConfig, ServerConfig},
    load::LoadSnapshot,
};

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Rolling health-probe statistics over a bounded window.
///
/// The window mean is maintained incrementally; `success_rate` covers the
/// process lifetime, matching what the probes have always observed.
#[derive(Debug, Clone)]
pub struct HealthStats {
    response_times: VecDeque<f64>,
    window_sum: f64,
    pub success_rate: f64,
    pub total_checks: u64,
    pub successful_checks: u64,
    pub avg_response_time: f64,
    pub last_response_time: Option<f64>,
}

impl Default for HealthStats {
    fn default() -> Self {
        Self {
            response_times: VecDeque::new(),
            window_sum: 0.0,
            success_rate: 1.0,
            total_checks: 0,
            successful_checks: 0,
            avg_response_time: 0.0,
            last_response_time: None,
        }
    }
}

impl HealthStats {
    fn record(&mut self, success: bool, elapsed: f64, window: usize) {
        self.last_response_time = Some(elapsed);

        self.response_times.push_back(elapsed);
        self.window_sum += elapsed;
        while self.response_times.len() > window {
            if let Some(old) = self.response_times.pop_front() {
                self.window_sum -= old;
            }
        }

        self.total_checks += 1;
        if success {
            self.successful_checks += 1;
        }
        self.success_rate = self.successful_checks as f64 / self.total_checks as f64;
        self.avg_response_time = if self.response_times.is_empty() {
            0.0
        } else {
            self.window_sum / self.response_times.len() as f64
        };
    }

    pub fn window_len(&self) -> usize {
        self.response_times.len()
    }
}

/// Mutable per-backend state, guarded by the backend's lock.
#[derive(Debug, Clone, Default)]
pub struct BackendState {
    pub consecutive_failures: u32,
    pub last_check: Option<SystemTime>,
    pub last_failure_time: Option<Instant>,
    pub stats: HealthStats,
    pub load: LoadSnapshot,
    pub supported_models: Vec<String>,
    pub models_last_updated: Option<SystemTime>,
}

/// One upstream server and everything the router knows about it.
///
/// The health bit is mirrored into an atomic so the selection path never
/// takes the lock; every write to the bit goes through the state lock first.
#[derive(Debug)]
pub struct Backend {
    pub config: ServerConfig,
    healthy: AtomicBool,
    state: RwLock<BackendState>,
}

impl Backend {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            // Start optimistic - assume backends are healthy
            healthy: AtomicBool::new(true),
            state: RwLock::new(BackendState::default()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> BackendState {
        self.read().clone()
    }

    pub fn load(&self) -> LoadSnapshot {
        self.read().load
    }

    pub fn set_load(&self, snapshot: LoadSnapshot) {
        self.write().load = snapshot;
    }

    pub fn models(&self) -> Vec<String> {
        self.read().supported_models.clone()
    }

    pub fn models_last_updated(&self) -> Option<SystemTime> {
        self.read().models_last_updated
    }

    pub fn set_models(&self, models: Vec<String>) {
        let mut state = self.write();
        state.supported_models = models;
        state.models_last_updated = Some(SystemTime::now());
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.read().supported_models.iter().any(|m| m == model)
    }

    /// Relative load: running counts full, waiting half, normalized by
    /// capacity. Lower is better; zero capacity is never selectable.
    pub fn score(&self) -> f64 {
        let snapshot = self.load();
        let capacity = self.config.max_concurrent_requests;
        if capacity == 0 {
            return f64::INFINITY;
        }
        (snapshot.num_requests_running as f64 + 0.5 * snapshot.num_requests_waiting as f64)
            / capacity as f64
    }

    /// Apply one active probe result and recompute the health bit.
    ///
    /// Returns `Some(new_health)` when the bit flipped so the caller can log
    /// the transition.
    pub fn record_probe(&self, success: bool, elapsed: f64, config: &AppConfig) -> Option<bool> {
        let mut state = self.write();
        state.last_check = Some(SystemTime::now());
        state
            .stats
            .record(success, elapsed, config.health_check_window_size);

        if success {
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures += 1;
            state.last_failure_time = Some(Instant::now());
        }

        if !config.enable_active_health_check {
            return None;
        }

        let new_healthy = state.stats.success_rate >= config.health_check_min_success_rate
            && state.stats.avg_response_time <= config.health_check_max_response_time
            && state.consecutive_failures < config.health_check_consecutive_failures;

        self.flip_if_changed(new_healthy)
    }

    /// Apply a forwarding outcome observed by the dispatcher. Shares the
    /// failure counter with the probe path, so forwarding failures count
    /// toward the same hysteresis window.
    pub fn update_health(&self, ok: bool, config: &AppConfig) -> Option<bool> {
        let mut state = self.write();
        state.last_check = Some(SystemTime::now());

        if ok {
            state.consecutive_failures = 0;
            state.last_failure_time = None;
            return self.flip_if_changed(true);
        }

        state.consecutive_failures += 1;
        state.last_failure_time = Some(Instant::now());

        let threshold = if config.enable_active_health_check {
            config.health_check_consecutive_failures
        } else {
            config.failure_threshold
        };

        if state.consecutive_failures >= threshold {
            self.flip_if_changed(false)
        } else {
            None
        }
    }

    /// Reset the failure counter on an unhealthy backend whose last failure
    /// is older than `auto_recovery_threshold`, so the next probe can
    /// restore it. With active checking disabled the reset itself restores
    /// health. Returns true when anything changed.
    pub fn try_auto_recover(&self, config: &AppConfig) -> bool {
        if self.is_healthy() {
            return false;
        }

        let mut state = self.write();
        let quiet = match state.last_failure_time {
            None => true,
            Some(t) => t.elapsed() > Duration::from_secs(config.auto_recovery_threshold),
        };
        if !quiet {
            return false;
        }

        let had_failures = state.consecutive_failures > 0;
        state.consecutive_failures = 0;

        if !config.enable_active_health_check {
            let _ = self.flip_if_changed(true);
            return true;
        }

        had_failures
    }

    fn flip_if_changed(&self, new_healthy: bool) -> Option<bool> {
        if self.healthy.load(Ordering::Relaxed) != new_healthy {
            self.healthy.store(new_healthy, Ordering::Relaxed);
            Some(new_healthy)
        } else {
            None
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BackendState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BackendState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// One immutable fleet generation; replaced wholesale on config reload.
#[derive(Debug)]
pub struct RouterState {
    pub backends: Vec<Arc<Backend>>,
    pub app_config: AppConfig,
}

impl RouterState {
    pub fn from_config(config: RouterConfig) -> Self {
        Self {
            backends: config
                .servers
                .into_iter()
                .map(|server| Arc::new(Backend::new(server)))
                .collect(),
            app_config: config.app,
        }
    }

    pub fn healthy_backends(&self) -> Vec<Arc<Backend>> {
        self.backends
            .iter()
            .filter(|b| b.is_healthy())
            .cloned()
            .collect()
    }

    pub fn get_by_url(&self, url: &str) -> Option<Arc<Backend>> {
        self.backends.iter().find(|b| b.config.url == url).cloned()
    }

    pub fn servers_supporting(&self, model: &str) -> Vec<Arc<Backend>> {
        self.backends
            .iter()
            .filter(|b| b.supports_model(model))
            .cloned()
            .collect()
    }

    pub fn healthy_servers_supporting(&self, model: &str) -> Vec<Arc<Backend>> {
        self.backends
            .iter()
            .filter(|b| b.is_healthy() && b.supports_model(model))
            .cloned()
            .collect()
    }
}

/// Why selection produced no backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    NoHealthyServers,
    NoModelSupport(String),
}

impl SelectionError {
    pub fn message(&self) -> String {
        match self {
            SelectionError::NoHealthyServers => "No healthy servers available".to_string(),
            SelectionError::NoModelSupport(model) => {
                format!("No healthy servers support model {}", model)
            }
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub client: HttpClient,
    pub state: Arc<ArcSwap<RouterState>>,
}

impl AppState {
    pub fn new(client: HttpClient, router_state: RouterState) -> Self {
        Self {
            client,
            state: Arc::new(ArcSwap::from_pointee(router_state)),
        }
    }

    pub fn app_config(&self) -> AppConfig {
        self.state.load().app_config
    }

    /// Weighted-least-load selection, two tiers.
    ///
    /// Tier 1: all candidates with score below 0.5, picked uniformly at
    /// random so bursty arrivals don't herd onto a single cold host.
    /// Tier 2: the candidates tied at the minimum score.
    pub fn select_backend(&self, model: Option<&str>) -> Result<Arc<Backend>, SelectionError> {
        let state = self.state.load();

        let candidates: Vec<Arc<Backend>> = match model {
            Some(model) => {
                let supporting = state.healthy_servers_supporting(model);
                if supporting.is_empty() {
                    return Err(SelectionError::NoModelSupport(model.to_string()));
                }
                supporting
            }
            None => {
                let healthy = state.healthy_backends();
                if healthy.is_empty() {
                    return Err(SelectionError::NoHealthyServers);
                }
                healthy
            }
        };

        let mut under_threshold: Vec<&Arc<Backend>> = Vec::new();
        let mut best: Vec<&Arc<Backend>> = Vec::new();
        let mut best_score = f64::INFINITY;

        for backend in &candidates {
            let score = backend.score();
            if score < 0.5 {
                under_threshold.push(backend);
            }
            if score < best_score {
                best_score = score;
                best = vec![backend];
            } else if score == best_score {
                best.push(backend);
            }
        }

        let pool = if !under_threshold.is_empty() {
            &under_threshold
        } else {
            &best
        };

        let pick = pool[rand::thread_rng().gen_range(0..pool.len())];
        Ok(Arc::clone(pick))
    }
}
