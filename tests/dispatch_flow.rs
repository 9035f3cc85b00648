//! End-to-end dispatch over real WebSocket replicas.

mod common;

use std::time::Duration;

use serde_json::json;

use analysis_gateway::config::Strategy;
use analysis_gateway::health::{CheckOutcome, HealthMonitor};
use analysis_gateway::load_balancer::HealthState;
use analysis_gateway::{DispatchRequest, OutcomeStatus};

use common::{
    dead_address, eventually, gateway_config, start_replica, websocket_dispatcher, ReplicaBehavior,
};

const SERVICE: &str = "static-analyzer";

#[tokio::test]
async fn test_round_robin_dispatch_with_progress() {
    let (a, log_a) = start_replica(ReplicaBehavior::ok()).await;
    let (b, log_b) = start_replica(ReplicaBehavior::ok()).await;
    let dispatcher = websocket_dispatcher(&gateway_config(SERVICE, Strategy::RoundRobin, &[a, b]));
    let mut progress = dispatcher.subscribe_progress();

    for i in 0..2 {
        let request = DispatchRequest::new(json!({"tools": ["bandit"]})).with_task_id(format!("rr-{i}"));
        let outcome = dispatcher
            .dispatch(SERVICE, request, Some(Duration::from_secs(30)))
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Success, "{outcome:?}");
        assert_eq!(outcome.result["result"]["tools_run"][0], "bandit");
        // 30s budget minus the 5s margin, rounded down to whole seconds.
        let seen = outcome.result["timeout_seen"].as_u64().unwrap();
        assert!((24..=25).contains(&seen));
    }

    assert_eq!(log_a.requests(), 1);
    assert_eq!(log_b.requests(), 1);

    let event = progress.recv().await.unwrap();
    assert_eq!(event.service_type, SERVICE);
    assert_eq!(event.message["type"], "progress_update");

    let stats = dispatcher.get_pool_stats();
    assert_eq!(stats.pool.active_connections, 0);
    assert_eq!(stats.pool.active_tasks, 0);
    assert!(stats.services[SERVICE].endpoints.iter().all(|e| e.total == 1));
}

#[tokio::test]
async fn test_unreachable_endpoint_fails_over() {
    let dead = dead_address().await;
    let (live, log) = start_replica(ReplicaBehavior::ok()).await;
    let dispatcher =
        websocket_dispatcher(&gateway_config(SERVICE, Strategy::RoundRobin, &[dead, live]));

    let outcome = dispatcher
        .dispatch(SERVICE, DispatchRequest::new(json!({})), Some(Duration::from_secs(30)))
        .await;
    assert_eq!(outcome.status, OutcomeStatus::Success, "{outcome:?}");
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.endpoint.as_deref(), Some("static-analyzer-2"));
    assert_eq!(log.requests(), 1);

    let circuits = dispatcher.get_pool_stats().pool.circuits;
    assert_eq!(circuits["static-analyzer-1"].consecutive_failures, 1);
}

#[tokio::test]
async fn test_cancel_reaches_replica() {
    let (addr, log) = start_replica(ReplicaBehavior::hanging()).await;
    let dispatcher = websocket_dispatcher(&gateway_config(SERVICE, Strategy::LeastLoaded, &[addr]));

    let running = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let request = DispatchRequest::new(json!({})).with_task_id("cancel-me");
            dispatcher.dispatch(SERVICE, request, None).await
        })
    };

    assert!(eventually(Duration::from_secs(5), || log.requests() == 1).await);
    assert!(dispatcher.get_task("cancel-me").is_some());
    assert!(dispatcher.cancel_task("cancel-me").await);

    let outcome = running.await.unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Cancelled);
    assert!(eventually(Duration::from_secs(5), || log.cancels() == 1).await);
    assert!(dispatcher.get_task("cancel-me").is_none());
}

#[tokio::test]
async fn test_silent_replica_hits_overall_timeout() {
    let (addr, _log) = start_replica(ReplicaBehavior::hanging()).await;
    let dispatcher = websocket_dispatcher(&gateway_config(SERVICE, Strategy::LeastLoaded, &[addr]));

    let started = std::time::Instant::now();
    let outcome = dispatcher
        .dispatch(SERVICE, DispatchRequest::new(json!({})), Some(Duration::from_secs(1)))
        .await;
    assert_eq!(outcome.status, OutcomeStatus::Timeout);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(outcome.error.unwrap().contains("no terminal message"));
}

#[tokio::test]
async fn test_health_monitor_checks_replicas() {
    let (good, good_log) = start_replica(ReplicaBehavior::ok()).await;
    let sick = ReplicaBehavior {
        healthy: false,
        ..ReplicaBehavior::ok()
    };
    let (bad, _) = start_replica(sick).await;
    let config = gateway_config(SERVICE, Strategy::LeastLoaded, &[good, bad]);
    let dispatcher = websocket_dispatcher(&config);
    let monitor = HealthMonitor::new(
        dispatcher.pool().clone(),
        dispatcher.registry().clone(),
        config.health_check.clone(),
    );

    let mut results = monitor.check_all().await;
    results.sort_by(|x, y| x.0.cmp(&y.0));
    assert_eq!(
        results,
        vec![
            ("static-analyzer-1".to_string(), CheckOutcome::Healthy),
            ("static-analyzer-2".to_string(), CheckOutcome::Unhealthy),
        ]
    );
    assert_eq!(good_log.health_checks.load(std::sync::atomic::Ordering::SeqCst), 1);

    let set = dispatcher.registry().get(SERVICE).unwrap();
    assert_eq!(set.replicas()[0].health(), HealthState::Healthy);
    assert_eq!(set.replicas()[1].health(), HealthState::Unhealthy);
    assert_eq!(dispatcher.get_pool_stats().pool.pooled_connections, 1);
}
