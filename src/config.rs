use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use serde::Deserialize;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::state::{AppState, RouterState};

/// Static configuration for one upstream vLLM server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub url: String,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: u32,
}

fn default_max_concurrent_requests() -> u32 {
    3
}

/// Tunable router parameters, loaded from the `[config]` table.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub health_check_interval: u64,
    pub config_reload_interval: u64,
    pub request_timeout: u64,
    pub health_check_timeout: u64,
    pub max_retries: u32,
    pub failure_threshold: u32,
    pub auto_recovery_threshold: u64,
    pub enable_active_health_check: bool,
    pub health_check_max_response_time: f64,
    pub health_check_min_success_rate: f64,
    pub health_check_window_size: usize,
    pub health_check_consecutive_failures: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            health_check_interval: 30,
            config_reload_interval: 60,
            request_timeout: 30,
            health_check_timeout: 5,
            max_retries: 3,
            failure_threshold: 2,
            auto_recovery_threshold: 60,
            enable_active_health_check: true,
            health_check_max_response_time: 10.0,
            health_check_min_success_rate: 0.8,
            health_check_window_size: 10,
            health_check_consecutive_failures: 3,
        }
    }
}

/// The parsed and validated contents of a configuration file.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub servers: Vec<ServerConfig>,
    pub app: AppConfig,
}

// On-disk shape: `[[servers.servers]]` entries plus a `[config]` table.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    servers: ServersSection,
    #[serde(default)]
    config: AppConfig,
}

#[derive(Debug, Default, Deserialize)]
struct ServersSection {
    #[serde(default)]
    servers: Vec<ServerConfig>,
}

/// Load a configuration file.
///
/// A missing file is not an error: the router starts with an empty backend
/// list and default parameters so that a later reload can populate it.
pub fn load_config(path: impl AsRef<Path>) -> Result<RouterConfig, String> {
    let path = path.as_ref();

    if !path.exists() {
        warn!("Config file {} not found, using defaults", path.display());
        return Ok(RouterConfig::default());
    }

    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;

    let file: ConfigFile =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config file: {}", e))?;

    let config = RouterConfig {
        servers: file.servers.servers,
        app: file.config,
    };
    validate(&config)?;

    info!(
        "Configuration loaded from {} ({} servers)",
        path.display(),
        config.servers.len()
    );
    Ok(config)
}

fn validate(config: &RouterConfig) -> Result<(), String> {
    for server in &config.servers {
        if !server.url.starts_with("http://") && !server.url.starts_with("https://") {
            return Err(format!(
                "Server URL must start with http:// or https://, got: {}",
                server.url
            ));
        }
        if server.max_concurrent_requests < 1 {
            return Err(format!(
                "Server {} has max_concurrent_requests 0; must be at least 1",
                server.url
            ));
        }
    }

    let app = &config.app;
    if app.health_check_interval < 1 {
        return Err("health_check_interval must be at least 1 second".to_string());
    }
    if app.config_reload_interval < 1 {
        return Err("config_reload_interval must be at least 1 second".to_string());
    }
    if app.request_timeout < 1 {
        return Err("request_timeout must be at least 1 second".to_string());
    }
    if app.health_check_timeout < 1 {
        return Err("health_check_timeout must be at least 1 second".to_string());
    }
    if app.failure_threshold < 1 {
        return Err("failure_threshold must be at least 1".to_string());
    }
    if app.auto_recovery_threshold < 1 {
        return Err("auto_recovery_threshold must be at least 1 second".to_string());
    }
    if app.health_check_max_response_time < 0.1 {
        return Err("health_check_max_response_time must be at least 0.1 seconds".to_string());
    }
    if !(0.0..=1.0).contains(&app.health_check_min_success_rate) {
        return Err("health_check_min_success_rate must be between 0.0 and 1.0".to_string());
    }
    if app.health_check_window_size < 1 {
        return Err("health_check_window_size must be at least 1".to_string());
    }
    if app.health_check_consecutive_failures < 1 {
        return Err("health_check_consecutive_failures must be at least 1".to_string());
    }

    Ok(())
}

/// Tracks the config file on disk so the reload loop can detect edits.
pub struct ConfigStore {
    path: PathBuf,
    last_modified: Mutex<Option<SystemTime>>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_modified: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the file unconditionally and record its mtime.
    pub fn load(&self) -> Result<RouterConfig, String> {
        let config = load_config(&self.path)?;
        *self.last_modified.lock().unwrap_or_else(|e| e.into_inner()) = file_mtime(&self.path);
        Ok(config)
    }

    /// Reload iff the file's mtime is newer than the recorded one.
    ///
    /// Returns `Ok(None)` when the file is unchanged or missing. A parse or
    /// validation failure is an `Err`; the caller keeps the previous state.
    pub fn reload_if_needed(&self) -> Result<Option<RouterConfig>, String> {
        let Some(current_mtime) = file_mtime(&self.path) else {
            return Ok(None);
        };

        let mut recorded = self.last_modified.lock().unwrap_or_else(|e| e.into_inner());
        let newer = match *recorded {
            None => true,
            Some(last) => current_mtime > last,
        };
        if !newer {
            return Ok(None);
        }

        info!("Configuration file modified, reloading...");
        let config = load_config(&self.path)?;
        *recorded = Some(current_mtime);
        Ok(Some(config))
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Periodically re-checks the config file and publishes a fresh fleet
/// generation when it changed. In-flight forwards hold `Arc<Backend>` clones
/// from the old generation, so dropped servers drain naturally.
pub async fn config_reload_loop(store: Arc<ConfigStore>, state: Arc<AppState>) {
    loop {
        let interval = state.state.load().app_config.config_reload_interval;
        sleep(Duration::from_secs(interval)).await;

        match store.reload_if_needed() {
            Ok(Some(config)) => {
                let router_state = RouterState::from_config(config);
                let total = router_state.backends.len();
                state.state.store(Arc::new(router_state));
                info!("Configuration reloaded successfully ({} servers)", total);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Configuration reload rejected, keeping previous state: {}", e);
            }
        }
    }
}
