use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use bytes::Bytes;
use clap::Parser;
use http_body_util::Full;
use hyper_tls::HttpsConnector;
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use serde_json::json;
use tokio::sync::Barrier;
use vllm_router::{
    config::{AppConfig, RouterConfig, ServerConfig},
    handlers::build_router,
    mock::{MockVllm, MockVllmHandle},
    state::{AppState, RouterState},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Benchmark for vllm-router")]
struct Args {
    /// Number of concurrent clients
    #[arg(short, long, default_value_t = 50)]
    concurrency: usize,

    /// Duration of the benchmark in seconds
    #[arg(short, long, default_value_t = 10)]
    duration: u64,

    /// Number of mock backends behind the router
    #[arg(short, long, default_value_t = 3)]
    backends: usize,
}

/// Build and start the router in-process over the given mock backends,
/// returning the address it's listening on.
async fn start_router(backends: &[MockVllmHandle]) -> SocketAddr {
    let https = HttpsConnector::new();
    let client = Client::builder(TokioExecutor::new()).build(https);

    let config = RouterConfig {
        servers: backends
            .iter()
            .map(|b| ServerConfig {
                url: b.url.clone(),
                max_concurrent_requests: 64,
            })
            .collect(),
        app: AppConfig::default(),
    };

    let state = Arc::new(AppState::new(client, RouterState::from_config(config)));

    // Populate the catalog so model-aware requests have candidates.
    {
        let current = state.state.load_full();
        vllm_router::catalog::refresh_all(
            &state.client,
            &current.backends,
            current.app_config.health_check_timeout,
        )
        .await;
    }

    let app = build_router(Arc::clone(&state), None);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // 1. Start mock backends
    let mut backends = Vec::new();
    for _ in 0..args.backends {
        backends.push(MockVllm::new().with_models(&["mock-model"]).spawn().await);
    }
    for backend in &backends {
        println!("Mock backend listening on {}", backend.url);
    }

    // 2. Start router in-process (no config file)
    let router_addr = start_router(&backends).await;
    println!("Router listening on {}", router_addr);

    // Give servers a moment to be fully ready
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // 3. Flood the router
    let target_url = format!("http://{}/v1/chat/completions", router_addr);
    let client: Client<hyper_util::client::legacy::connect::HttpConnector, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();

    let start_time = Instant::now();
    let duration = std::time::Duration::from_secs(args.duration);
    let success_count = Arc::new(AtomicUsize::new(0));
    let error_count = Arc::new(AtomicUsize::new(0));
    let latencies = Arc::new(tokio::sync::Mutex::new(Vec::new()));

    let barrier = Arc::new(Barrier::new(args.concurrency));
    let mut handles = Vec::new();

    println!(
        "Starting benchmark: {} clients, {} seconds, {} backends...",
        args.concurrency, args.duration, args.backends
    );

    for _ in 0..args.concurrency {
        let client = client.clone();
        let success_count = success_count.clone();
        let error_count = error_count.clone();
        let latencies = latencies.clone();
        let barrier = barrier.clone();
        let target_url = target_url.clone();

        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            let mut local_latencies = Vec::new();

            while start_time.elapsed() < duration {
                let req_start = Instant::now();
                let body = json!({
                    "model": "mock-model",
                    "messages": [{"role": "user", "content": "ping"}]
                });

                let req = hyper::Request::builder()
                    .method("POST")
                    .uri(&target_url)
                    .header("content-type", "application/json")
                    .body(Full::new(Bytes::from(serde_json::to_vec(&body).unwrap())))
                    .unwrap();

                match client.request(req).await {
                    Ok(resp) if resp.status().is_success() => {
                        local_latencies.push(req_start.elapsed().as_micros() as u64);
                        success_count.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(resp) => {
                        eprintln!("Request failed with status {}", resp.status());
                        error_count.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        eprintln!("Request failed: {}", e);
                        error_count.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            let mut l = latencies.lock().await;
            l.extend(local_latencies);
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    // 4. Report results
    let total_success = success_count.load(Ordering::Relaxed);
    let total_errors = error_count.load(Ordering::Relaxed);
    let elapsed = start_time.elapsed().as_secs_f64();
    let rps = total_success as f64 / elapsed;

    let mut latencies = latencies.lock().await;
    latencies.sort();

    let avg = if latencies.is_empty() {
        0.0
    } else {
        latencies.iter().sum::<u64>() as f64 / latencies.len() as f64 / 1000.0
    };

    let p50 = latencies.get(latencies.len() / 2).copied().unwrap_or(0) as f64 / 1000.0;

    let p99_idx = ((latencies.len() as f64) * 0.99) as usize;
    let p99 = latencies.get(p99_idx).copied().unwrap_or(0) as f64 / 1000.0;

    let p999_idx = ((latencies.len() as f64) * 0.999) as usize;
    let p999 = latencies.get(p999_idx).copied().unwrap_or(0) as f64 / 1000.0;

    println!("\n--- Benchmark Results ---");
    println!("Duration:        {:.2}s", elapsed);
    println!("Concurrency:     {}", args.concurrency);
    println!("Total Requests:  {}", total_success + total_errors);
    println!("Successful:      {}", total_success);
    println!("Errors:          {}", total_errors);
    println!("RPS:             {:.2}", rps);
    println!("Avg Latency:     {:.2}ms", avg);
    println!("P50 Latency:     {:.2}ms", p50);
    println!("P99 Latency:     {:.2}ms", p99);
    println!("P99.9 Latency:   {:.2}ms", p999);

    println!("\n--- Backend Distribution ---");
    for backend in &backends {
        println!("{}: {} requests", backend.url, backend.hits());
    }
}
