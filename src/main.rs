use std::{net::SocketAddr, str::FromStr, sync::Arc};

use clap::{Parser, Subcommand};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};

use vllm_router::{
    catalog,
    config::{config_reload_loop, load_config, ConfigStore},
    handlers, health, load,
    state::{AppState, RouterState},
};

#[derive(Parser)]
#[command(name = "vllm-router", version)]
#[command(about = "OpenAI-compatible load balancer for vLLM servers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the router server
    Run {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to bind to
        #[arg(long, short, default_value_t = 8888)]
        port: u16,
        /// Path to configuration file
        #[arg(long, env = "CONFIG_PATH", default_value = "servers.toml")]
        config: String,
        /// Enable config hot-reload (re-read the file when it changes)
        #[arg(long)]
        reload: bool,
        /// Logging level (debug, info, warn, error)
        #[arg(long, default_value = "info")]
        log_level: String,
        /// Human-readable console log output
        #[arg(long, short = 'c')]
        console: bool,
        /// Include model names in the periodic fleet summary log
        #[arg(long, short = 'm')]
        model: bool,
    },
    /// Validate the configuration file and print a backend summary
    CheckConfig {
        /// Path to configuration file
        #[arg(long, env = "CONFIG_PATH", default_value = "servers.toml")]
        config: String,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            host,
            port,
            config,
            reload,
            log_level,
            console,
            model,
        } => run(host, port, config, reload, &log_level, console, model).await,
        Commands::CheckConfig { config } => check_config(&config),
        Commands::Version => {
            println!("vLLM Router v{}", env!("CARGO_PKG_VERSION"));
            println!("Model-aware load balancing for vLLM servers");
        }
    }
}

async fn run(
    host: String,
    port: u16,
    config_path: String,
    reload: bool,
    log_level: &str,
    console: bool,
    show_models: bool,
) {
    init_logging(log_level, console);

    info!("Starting vLLM Router...");

    let store = Arc::new(ConfigStore::new(&config_path));
    let router_config = match store.load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let https = HttpsConnector::new();
    let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(https);

    let app_state = Arc::new(AppState::new(
        client,
        RouterState::from_config(router_config),
    ));

    let metrics_handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Failed to install metrics recorder: {}", e);
            None
        }
    };

    // Populate the model catalog before taking traffic.
    info!("Fetching model information from all servers...");
    {
        let current = app_state.state.load_full();
        catalog::refresh_all(
            &app_state.client,
            &current.backends,
            current.app_config.health_check_timeout,
        )
        .await;
    }

    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(health::health_check_loop(Arc::clone(
        &app_state,
    ))));
    tasks.push(tokio::spawn(load::load_sample_loop(Arc::clone(&app_state))));
    tasks.push(tokio::spawn(load::fleet_summary_loop(
        Arc::clone(&app_state),
        show_models,
    )));

    if reload {
        tasks.push(tokio::spawn(config_reload_loop(
            Arc::clone(&store),
            Arc::clone(&app_state),
        )));
        info!("Config hot-reload enabled for {}", config_path);
    }

    let app = handlers::build_router(Arc::clone(&app_state), metrics_handle);

    let addr = match SocketAddr::from_str(&format!("{}:{}", host, port)) {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Invalid bind address {}:{}: {}", host, port, e);
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("vLLM Router listening on http://{}", addr);

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Err(e) = serve_result {
        warn!("Server error: {}", e);
    }

    // Wake the periodic tasks out of their sleeps and stop them.
    info!("Shutting down vLLM Router...");
    for task in tasks {
        task.abort();
    }
    info!("vLLM Router shutdown complete");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
}

fn init_logging(log_level: &str, console: bool) {
    let level = tracing::Level::from_str(log_level).unwrap_or(tracing::Level::INFO);
    if console {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .pretty()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .compact()
            .init();
    }
}

fn check_config(config_path: &str) {
    match load_config(config_path) {
        Ok(config) => {
            println!("Configuration loaded successfully");
            println!("  Total servers: {}", config.servers.len());
            for server in &config.servers {
                println!(
                    "  [OK] {} (max_concurrent: {})",
                    server.url, server.max_concurrent_requests
                );
            }
        }
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
