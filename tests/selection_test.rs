use std::sync::Arc;

use hyper_tls::HttpsConnector;
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use vllm_router::{
    config::{AppConfig, RouterConfig, ServerConfig},
    load::LoadSnapshot,
    state::{AppState, Backend, RouterState, SelectionError},
};

fn make_state(specs: &[(&str, u32)], app: AppConfig) -> AppState {
    let https = HttpsConnector::new();
    let client = Client::builder(TokioExecutor::new()).build(https);

    let config = RouterConfig {
        servers: specs
            .iter()
            .map(|(url, cap)| ServerConfig {
                url: url.to_string(),
                max_concurrent_requests: *cap,
            })
            .collect(),
        app,
    };

    AppState::new(client, RouterState::from_config(config))
}

fn backend(state: &AppState, index: usize) -> Arc<Backend> {
    state.state.load().backends[index].clone()
}

fn set_load(state: &AppState, index: usize, running: u64, waiting: u64) {
    backend(state, index).set_load(LoadSnapshot {
        num_requests_running: running,
        num_requests_waiting: waiting,
        ..Default::default()
    });
}

#[test]
fn test_score_formula() {
    let state = make_state(&[("http://b1", 4)], AppConfig::default());
    set_load(&state, 0, 1, 2);
    // (1 + 0.5 * 2) / 4
    assert_eq!(backend(&state, 0).score(), 0.5);
}

#[test]
fn test_score_monotone_in_running() {
    let state = make_state(&[("http://b1", 4), ("http://b2", 4)], AppConfig::default());
    set_load(&state, 0, 1, 3);
    set_load(&state, 1, 2, 3);
    assert!(backend(&state, 1).score() >= backend(&state, 0).score());
}

#[test]
fn test_zero_capacity_scores_infinite() {
    let state = make_state(&[("http://b1", 0)], AppConfig::default());
    assert!(backend(&state, 0).score().is_infinite());
    // Still the best of a pool of one.
    let picked = state.select_backend(None).unwrap();
    assert_eq!(picked.config.url, "http://b1");
}

#[test]
fn test_under_threshold_beats_lower_absolute_load() {
    let state = make_state(&[("http://cold", 4), ("http://hot", 4)], AppConfig::default());
    set_load(&state, 0, 1, 0); // score 0.25, under threshold
    set_load(&state, 1, 4, 0); // score 1.0

    for _ in 0..100 {
        let picked = state.select_backend(None).unwrap();
        assert_eq!(picked.config.url, "http://cold");
    }
}

#[test]
fn test_under_threshold_spreads_across_pool() {
    let state = make_state(
        &[("http://b1", 4), ("http://b2", 4), ("http://hot", 4)],
        AppConfig::default(),
    );
    set_load(&state, 0, 0, 0); // score 0
    set_load(&state, 1, 1, 0); // score 0.25 - not the minimum, but under threshold
    set_load(&state, 2, 4, 0); // score 1.0

    let mut b1_count = 0;
    let mut b2_count = 0;
    for _ in 0..300 {
        match state.select_backend(None).unwrap().config.url.as_str() {
            "http://b1" => b1_count += 1,
            "http://b2" => b2_count += 1,
            other => panic!("hot backend {} selected", other),
        }
    }
    // Uniform pick over the under-threshold pool, not least-load within it.
    assert!(b1_count > 50, "b1 picked {} times", b1_count);
    assert!(b2_count > 50, "b2 picked {} times", b2_count);
}

#[test]
fn test_fallback_picks_among_minimum_ties() {
    let state = make_state(
        &[("http://b1", 4), ("http://b2", 4), ("http://b3", 4)],
        AppConfig::default(),
    );
    set_load(&state, 0, 2, 1); // score 0.625
    set_load(&state, 1, 2, 1); // score 0.625
    set_load(&state, 2, 4, 0); // score 1.0

    let mut b1_count = 0;
    let mut b2_count = 0;
    for _ in 0..300 {
        match state.select_backend(None).unwrap().config.url.as_str() {
            "http://b1" => b1_count += 1,
            "http://b2" => b2_count += 1,
            other => panic!("non-minimum backend {} selected", other),
        }
    }
    assert!(b1_count > 50, "b1 picked {} times", b1_count);
    assert!(b2_count > 50, "b2 picked {} times", b2_count);
}

#[test]
fn test_model_filtering() {
    let state = make_state(&[("http://b1", 4), ("http://b2", 4)], AppConfig::default());
    backend(&state, 0).set_models(vec!["m1".to_string()]);
    backend(&state, 1).set_models(vec!["m2".to_string()]);
    // b1 is idle, b2 is busy; the model filter must win regardless.
    set_load(&state, 0, 0, 0);
    set_load(&state, 1, 3, 2);

    for _ in 0..50 {
        let picked = state.select_backend(Some("m2")).unwrap();
        assert_eq!(picked.config.url, "http://b2");
    }
}

#[test]
fn test_no_model_support_error() {
    let state = make_state(&[("http://b1", 4)], AppConfig::default());
    backend(&state, 0).set_models(vec!["m1".to_string()]);

    let err = state.select_backend(Some("m3")).unwrap_err();
    assert_eq!(err, SelectionError::NoModelSupport("m3".to_string()));
    assert!(err.message().contains("m3"), "message: {}", err.message());
}

#[test]
fn test_no_healthy_servers_error() {
    let app = AppConfig {
        enable_active_health_check: false,
        failure_threshold: 1,
        ..AppConfig::default()
    };
    let state = make_state(&[("http://b1", 4)], app);
    backend(&state, 0).update_health(false, &app);

    let err = state.select_backend(None).unwrap_err();
    assert_eq!(err, SelectionError::NoHealthyServers);
}

#[test]
fn test_unhealthy_excluded_from_selection() {
    let app = AppConfig {
        enable_active_health_check: false,
        failure_threshold: 1,
        ..AppConfig::default()
    };
    let state = make_state(&[("http://b1", 4), ("http://b2", 4)], app);
    backend(&state, 0).update_health(false, &app);

    for _ in 0..50 {
        let picked = state.select_backend(None).unwrap();
        assert_eq!(picked.config.url, "http://b2");
    }
}

#[test]
fn test_forwarding_hysteresis_active_checking() {
    let app = AppConfig {
        health_check_consecutive_failures: 3,
        ..AppConfig::default()
    };
    let state = make_state(&[("http://b1", 4)], app);
    let b = backend(&state, 0);

    assert!(b.update_health(false, &app).is_none());
    assert!(b.is_healthy());
    assert!(b.update_health(false, &app).is_none());
    assert!(b.is_healthy());
    assert_eq!(b.update_health(false, &app), Some(false));
    assert!(!b.is_healthy());
    assert!(b.snapshot().consecutive_failures >= 3);
}

#[test]
fn test_forwarding_hysteresis_passive() {
    let app = AppConfig {
        enable_active_health_check: false,
        failure_threshold: 2,
        ..AppConfig::default()
    };
    let state = make_state(&[("http://b1", 4)], app);
    let b = backend(&state, 0);

    assert!(b.update_health(false, &app).is_none());
    assert!(b.is_healthy());
    assert_eq!(b.update_health(false, &app), Some(false));
    assert!(!b.is_healthy());
}

#[test]
fn test_forwarding_success_resets_counter() {
    let app = AppConfig::default();
    let state = make_state(&[("http://b1", 4)], app);
    let b = backend(&state, 0);

    b.update_health(false, &app);
    b.update_health(false, &app);
    assert_eq!(b.snapshot().consecutive_failures, 2);

    b.update_health(true, &app);
    assert_eq!(b.snapshot().consecutive_failures, 0);
    assert!(b.is_healthy());
}

#[test]
fn test_probe_hysteresis_needs_consecutive_failures() {
    let app = AppConfig::default(); // min_success_rate 0.8, consecutive threshold 3
    let state = make_state(&[("http://b1", 4)], app);
    let b = backend(&state, 0);

    // Build up a healthy history first so the success-rate condition holds
    // through the failure run.
    for _ in 0..16 {
        b.record_probe(true, 0.05, &app);
    }

    assert!(b.record_probe(false, 0.05, &app).is_none());
    assert!(b.is_healthy());
    assert!(b.record_probe(false, 0.05, &app).is_none());
    assert!(b.is_healthy());
    // Third consecutive failure crosses the threshold.
    assert_eq!(b.record_probe(false, 0.05, &app), Some(false));
    assert!(!b.is_healthy());
}

#[test]
fn test_probe_window_is_bounded() {
    let app = AppConfig {
        health_check_window_size: 10,
        ..AppConfig::default()
    };
    let state = make_state(&[("http://b1", 4)], app);
    let b = backend(&state, 0);

    for _ in 0..25 {
        b.record_probe(true, 0.1, &app);
    }
    let stats = b.snapshot().stats;
    assert_eq!(stats.window_len(), 10);
    assert_eq!(stats.total_checks, 25);
}

#[test]
fn test_probe_average_over_window() {
    let app = AppConfig::default();
    let state = make_state(&[("http://b1", 4)], app);
    let b = backend(&state, 0);

    b.record_probe(true, 1.0, &app);
    b.record_probe(true, 2.0, &app);
    b.record_probe(true, 3.0, &app);

    let stats = b.snapshot().stats;
    assert!((stats.avg_response_time - 2.0).abs() < 1e-9);
    assert_eq!(stats.last_response_time, Some(3.0));
    assert_eq!(stats.success_rate, 1.0);
}

#[test]
fn test_probe_slow_backend_flips_unhealthy() {
    let app = AppConfig {
        health_check_max_response_time: 1.0,
        ..AppConfig::default()
    };
    let state = make_state(&[("http://b1", 4)], app);
    let b = backend(&state, 0);

    // Successful but far too slow.
    assert_eq!(b.record_probe(true, 5.0, &app), Some(false));
    assert!(!b.is_healthy());
}

#[test]
fn test_auto_recovery_resets_counter_under_active_checking() {
    let app = AppConfig {
        health_check_consecutive_failures: 1,
        auto_recovery_threshold: 1,
        ..AppConfig::default()
    };
    let state = make_state(&[("http://b1", 4)], app);
    let b = backend(&state, 0);

    b.update_health(false, &app);
    assert!(!b.is_healthy());

    // Too recent: nothing happens.
    assert!(!b.try_auto_recover(&app));
    assert!(!b.is_healthy());

    std::thread::sleep(std::time::Duration::from_millis(1100));
    assert!(b.try_auto_recover(&app));
    assert_eq!(b.snapshot().consecutive_failures, 0);
    // Active checking: the next probe decides, not the sweep.
    assert!(!b.is_healthy());

    assert_eq!(b.record_probe(true, 0.05, &app), Some(true));
    assert!(b.is_healthy());
}

#[test]
fn test_auto_recovery_flips_health_when_passive() {
    let app = AppConfig {
        enable_active_health_check: false,
        failure_threshold: 1,
        auto_recovery_threshold: 1,
        ..AppConfig::default()
    };
    let state = make_state(&[("http://b1", 4)], app);
    let b = backend(&state, 0);

    b.update_health(false, &app);
    assert!(!b.is_healthy());

    std::thread::sleep(std::time::Duration::from_millis(1100));
    assert!(b.try_auto_recover(&app));
    assert!(b.is_healthy());
}
