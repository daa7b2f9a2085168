//! Integration tests for connection pool, circuit breaker and health monitor
//!
//! These tests verify that the components work correctly together in
//! realistic scenarios.

mod common;

use common::{ScriptedTransport, SwitchProbe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use toolpool::lb::EndpointRegistry;
use toolpool::pool::{
    BreakerKey, CircuitBreaker, CircuitBreakerConfig, CircuitState, ConnectionPool, EndpointCheck,
    HealthCheckConfig, HealthMonitor, PoolConfig,
};
use toolpool::{CallContext, EndpointSpec, ResilienceError};

#[tokio::test]
async fn test_pool_and_circuit_integration() {
    let transport = ScriptedTransport::new();
    let pool = ConnectionPool::new(
        PoolConfig {
            min_connections: 0,
            max_connections: 4,
            ..Default::default()
        },
        transport.clone(),
    );
    let circuit = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 3,
        ..Default::default()
    });

    let registry = EndpointRegistry::new();
    let endpoint = registry
        .register("files", EndpointSpec::new("fs-1", "tcp://fs-1:7000"), 1)
        .unwrap();
    pool.register_endpoint(Arc::clone(&endpoint)).await;

    let key = BreakerKey::new("fs-1", "read");
    let ctx = CallContext::new();

    for _ in 0..3 {
        let lease = pool.acquire(&ctx, &endpoint).await.unwrap();
        circuit.acquire(&key).await.unwrap().record_failure();
        pool.release(lease);
    }

    assert_eq!(circuit.get_state(&key).await, Some(CircuitState::Open));
    assert!(matches!(
        circuit.acquire(&key).await,
        Err(ResilienceError::CircuitOpen { .. })
    ));

    // The open breaker does not affect the pool or other tools
    assert!(circuit.is_closed(&BreakerKey::new("fs-1", "list")).await);
    let stats = pool.get_stats("fs-1").await.unwrap();
    assert_eq!(stats.total_created, 1);
    assert_eq!(stats.total_reused, 2);
    assert_eq!(stats.idle_connections, 1);
}

#[tokio::test]
async fn test_removing_endpoint_drops_only_its_breakers() {
    let circuit = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 1,
        ..Default::default()
    });

    for key in [
        BreakerKey::new("a", "read"),
        BreakerKey::new("a", "write"),
        BreakerKey::new("b", "read"),
    ] {
        circuit.acquire(&key).await.unwrap().record_failure();
    }

    assert_eq!(circuit.remove_endpoint("a").await, 2);
    assert_eq!(circuit.get_state(&BreakerKey::new("a", "read")).await, None);
    assert_eq!(
        circuit.get_state(&BreakerKey::new("b", "read")).await,
        Some(CircuitState::Open)
    );

    assert_eq!(circuit.reset_all().await, 1);
    assert!(circuit.is_closed(&BreakerKey::new("b", "read")).await);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_leases_never_exceed_max() {
    let transport = ScriptedTransport::new();
    let pool = Arc::new(ConnectionPool::new(
        PoolConfig {
            min_connections: 0,
            max_connections: 3,
            ..Default::default()
        },
        transport.clone(),
    ));
    let registry = EndpointRegistry::new();
    let endpoint = registry
        .register("files", EndpointSpec::new("fs-1", "tcp://fs-1:7000"), 1)
        .unwrap();
    pool.register_endpoint(Arc::clone(&endpoint)).await;

    let held = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..12)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let endpoint = Arc::clone(&endpoint);
            let held = Arc::clone(&held);
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                let lease = pool.acquire(&CallContext::new(), &endpoint).await.unwrap();
                let now = held.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                held.fetch_sub(1, Ordering::SeqCst);
                pool.release(lease);
            })
        })
        .collect();

    for worker in workers {
        worker.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    let stats = pool.get_stats("fs-1").await.unwrap();
    assert!(stats.total_created <= 3);
    assert_eq!(stats.active_connections, 0);
    assert_eq!(endpoint.active_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_flushes_and_reconnects_endpoint() {
    let transport = ScriptedTransport::new();
    let probe = Arc::new(SwitchProbe::default());
    let registry = Arc::new(EndpointRegistry::new());
    let pool = Arc::new(ConnectionPool::new(
        PoolConfig {
            min_connections: 1,
            max_connections: 2,
            ..Default::default()
        },
        transport.clone(),
    ));
    let endpoint = registry
        .register("files", EndpointSpec::new("fs-1", "tcp://fs-1:7000"), 1)
        .unwrap();
    pool.register_endpoint(Arc::clone(&endpoint)).await;

    let shutdown = CancellationToken::new();
    let tasks = TaskTracker::new();
    let monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&registry),
        Arc::clone(&pool),
        transport.clone(),
        probe.clone(),
        HealthCheckConfig {
            unhealthy_threshold: 2,
            reconnect_backoff_base: Duration::from_secs(1),
            reconnect_backoff_max: Duration::from_secs(4),
            ..Default::default()
        },
        shutdown.clone(),
        tasks.clone(),
    ));

    assert_eq!(monitor.check_endpoint(&endpoint).await, EndpointCheck::Healthy);
    assert_eq!(pool.idle_count("fs-1").await, 1);

    // A caller holds the only connection while the endpoint goes down
    let lease = pool.acquire(&CallContext::new(), &endpoint).await.unwrap();
    probe.down.store(true, Ordering::SeqCst);
    transport.set_fail_connect(true);

    assert_eq!(
        monitor.check_endpoint(&endpoint).await,
        EndpointCheck::Unhealthy { consecutive: 1 }
    );
    assert_eq!(monitor.check_endpoint(&endpoint).await, EndpointCheck::MarkedUnreachable);
    assert!(!endpoint.is_reachable());

    // The leased connection is closed when it comes back
    pool.release(lease);
    assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    assert_eq!(pool.idle_count("fs-1").await, 0);

    probe.down.store(false, Ordering::SeqCst);
    transport.set_fail_connect(false);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(endpoint.is_reachable());
    assert_eq!(pool.idle_count("fs-1").await, 1);
    assert!(!pool.is_reconnecting("fs-1").await);

    shutdown.cancel();
    tasks.close();
    tasks.wait().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_and_periodic_check_recovers() {
    let transport = ScriptedTransport::new();
    let probe = Arc::new(SwitchProbe::default());
    let registry = Arc::new(EndpointRegistry::new());
    let pool = Arc::new(ConnectionPool::new(
        PoolConfig {
            min_connections: 0,
            max_connections: 2,
            ..Default::default()
        },
        transport.clone(),
    ));
    let endpoint = registry
        .register("files", EndpointSpec::new("fs-1", "tcp://fs-1:7000"), 1)
        .unwrap();
    pool.register_endpoint(Arc::clone(&endpoint)).await;

    let shutdown = CancellationToken::new();
    let tasks = TaskTracker::new();
    let monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&registry),
        Arc::clone(&pool),
        transport.clone(),
        probe.clone(),
        HealthCheckConfig {
            unhealthy_threshold: 1,
            reconnect_backoff_base: Duration::from_secs(1),
            reconnect_backoff_max: Duration::from_secs(2),
            max_reconnect_attempts: 2,
            ..Default::default()
        },
        shutdown.clone(),
        tasks.clone(),
    ));

    probe.down.store(true, Ordering::SeqCst);
    transport.set_fail_connect(true);
    assert_eq!(monitor.check_endpoint(&endpoint).await, EndpointCheck::MarkedUnreachable);

    // Two attempts fit inside 1s + 2s of backoff
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(!pool.is_reconnecting("fs-1").await);
    assert!(!endpoint.is_reachable());

    probe.down.store(false, Ordering::SeqCst);
    transport.set_fail_connect(false);
    assert_eq!(monitor.check_endpoint(&endpoint).await, EndpointCheck::Recovered);
    assert!(endpoint.is_reachable());

    shutdown.cancel();
    tasks.close();
    tasks.wait().await;
}
