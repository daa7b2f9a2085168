//! End-to-end behaviour of the execution coordinator

mod common;

use common::{coordinator, request, test_config, wait_until, ScriptedTransport};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use toolpool::cache::CacheKey;
use toolpool::pool::{BreakerKey, CircuitState};
use toolpool::{CallContext, ErrorKind, RawResult, ResilienceError, TransportError};

#[tokio::test(start_paused = true)]
async fn test_warm_cache_returns_identical_value() {
    let transport = ScriptedTransport::new();
    let coordinator = coordinator(test_config(), transport.clone(), &[("web-search", "a")]).await;
    let ctx = CallContext::new();
    let req = request("web-search", "query", 1);

    let first = coordinator.execute_with_resilience(&ctx, &req).await.unwrap();
    let second = coordinator.execute_with_resilience(&ctx, &req).await.unwrap();

    assert!(!first.cache_hit);
    assert_eq!(first.endpoint.as_deref(), Some("a"));
    assert_eq!(first.attempts, 1);

    assert!(second.cache_hit);
    assert_eq!(second.content, first.content);
    assert_eq!(second.endpoint, None);
    assert_eq!(second.attempts, 0);
    assert_eq!(transport.invocations(), 1);

    let stats = coordinator.stats().await;
    assert_eq!(stats.cache.hits, 1);
    assert_eq!(stats.cache.keys, 1);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_after_threshold_and_fails_fast() {
    let mut config = test_config();
    config.circuit_breaker.failure_threshold = 3;
    config.circuit_breaker.recovery_timeout = Duration::from_secs(30);
    config.retry.policy.max_attempts = 1;

    let transport = ScriptedTransport::new();
    transport.set_default(Err(TransportError::Network("connection reset by peer".into())));
    let coordinator = coordinator(config, transport.clone(), &[("files", "e")]).await;
    let ctx = CallContext::new();

    for n in 0..3 {
        let err = coordinator
            .execute_with_resilience(&ctx, &request("files", "read", n))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
    }
    assert_eq!(transport.invocations(), 3);

    let start = Instant::now();
    let err = coordinator
        .execute_with_resilience(&ctx, &request("files", "read", 4))
        .await
        .unwrap_err();
    assert!(matches!(err, ResilienceError::CircuitOpen { .. }));
    assert!(start.elapsed() < Duration::from_millis(1));
    assert_eq!(transport.invocations(), 3);

    // Other tools on the same endpoint have their own breaker
    transport.clear_default();
    coordinator
        .execute_with_resilience(&ctx, &request("files", "list", 1))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_breaker_recovers_through_half_open_trial() {
    let mut config = test_config();
    config.circuit_breaker.failure_threshold = 3;
    config.circuit_breaker.recovery_timeout = Duration::from_secs(30);
    config.retry.policy.max_attempts = 1;

    let transport = ScriptedTransport::new();
    transport.set_default(Err(TransportError::Timeout("read timed out".into())));
    let coordinator = coordinator(config, transport.clone(), &[("files", "e")]).await;
    let ctx = CallContext::new();

    for n in 0..3 {
        let _ = coordinator
            .execute_with_resilience(&ctx, &request("files", "read", n))
            .await;
    }
    let key = BreakerKey::new("e", "read");

    tokio::time::advance(Duration::from_secs(30)).await;
    transport.clear_default();

    coordinator
        .execute_with_resilience(&ctx, &request("files", "read", 10))
        .await
        .unwrap();

    let stats = coordinator.stats().await;
    let breaker = stats.breakers.iter().find(|b| b.key == key).unwrap();
    assert_eq!(breaker.state, CircuitState::Closed);
    assert_eq!(breaker.failure_count, 0);
    assert_eq!(breaker.open_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_pool_exhausted_after_context_timeout() {
    let mut config = test_config();
    config.pool.max_connections = 2;

    let transport = ScriptedTransport::new();
    transport.set_delay(Duration::from_secs(10));
    let coordinator = coordinator(config, transport.clone(), &[("files", "e")]).await;

    for n in 0..2 {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let _ = coordinator
                .execute_with_resilience(&CallContext::new(), &request("files", "read", n))
                .await;
        });
    }
    wait_until(|| transport.in_flight() == 2).await;

    let start = Instant::now();
    let ctx = CallContext::new().with_timeout(Duration::from_millis(100));
    let err = coordinator
        .execute_with_resilience(&ctx, &request("files", "read", 3))
        .await
        .unwrap_err();
    let waited = start.elapsed();

    assert!(matches!(err, ResilienceError::PoolExhausted { .. }));
    assert!(waited >= Duration::from_millis(100) && waited < Duration::from_millis(110));
    assert_eq!(transport.invocations(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_connections_never_exceed_max() {
    let mut config = test_config();
    config.pool.max_connections = 3;
    config.cache.enabled = false;

    let transport = ScriptedTransport::new();
    transport.set_delay(Duration::from_millis(50));
    let coordinator = coordinator(config, transport.clone(), &[("files", "e")]).await;

    let calls: Vec<_> = (0..20)
        .map(|n| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .execute_with_resilience(&CallContext::new(), &request("files", "read", n))
                    .await
            })
        })
        .collect();

    for call in calls {
        call.await.unwrap().unwrap();
    }

    assert_eq!(transport.invocations(), 20);
    assert!(transport.max_in_flight.load(Ordering::SeqCst) <= 3);

    let stats = coordinator.stats().await;
    let pool = &stats.pool.endpoints["e"];
    assert!(pool.total_created <= 3);
    assert_eq!(pool.active_connections, 0);
    assert!(pool.idle_connections <= 3);
}

#[tokio::test(start_paused = true)]
async fn test_round_robin_skips_unreachable_endpoint() {
    let mut config = test_config();
    config.cache.enabled = false;

    let transport = ScriptedTransport::new();
    let coordinator = coordinator(
        config,
        transport.clone(),
        &[("web-search", "a"), ("web-search", "b"), ("web-search", "c")],
    )
    .await;
    coordinator.registry().find("b").unwrap().mark_unreachable();

    let ctx = CallContext::new();
    let mut served = Vec::new();
    for n in 0..6 {
        let result = coordinator
            .execute_with_resilience(&ctx, &request("web-search", "query", n))
            .await
            .unwrap();
        served.push(result.endpoint.unwrap());
    }

    assert_eq!(served, ["a", "c", "a", "c", "a", "c"]);
    assert!(!transport.served().iter().any(|id| id == "b"));
}

#[tokio::test(start_paused = true)]
async fn test_no_healthy_endpoints() {
    let transport = ScriptedTransport::new();
    let coordinator = coordinator(test_config(), transport.clone(), &[("web-search", "a")]).await;
    coordinator.registry().find("a").unwrap().mark_unreachable();

    let err = coordinator
        .execute_with_resilience(&CallContext::new(), &request("web-search", "query", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, ResilienceError::NoHealthyEndpoints { .. }));

    let err = coordinator
        .execute_with_resilience(&CallContext::new(), &request("unknown", "query", 1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoHealthyEndpoints);
    assert_eq!(transport.invocations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_lru_eviction_through_coordinator() {
    let mut config = test_config();
    config.cache.max_keys = 2;

    let transport = ScriptedTransport::new();
    let coordinator = coordinator(config, transport.clone(), &[("files", "e")]).await;
    let ctx = CallContext::new();
    let (k1, k2, k3) = (
        request("files", "read", 1),
        request("files", "read", 2),
        request("files", "read", 3),
    );

    coordinator.execute_with_resilience(&ctx, &k1).await.unwrap();
    coordinator.execute_with_resilience(&ctx, &k2).await.unwrap();
    coordinator.execute_with_resilience(&ctx, &k3).await.unwrap();

    let cache = coordinator.cache();
    assert!(!cache.contains(&CacheKey::for_request(&k1)));
    assert!(cache.contains(&CacheKey::for_request(&k2)));
    assert!(cache.contains(&CacheKey::for_request(&k3)));

    // A hit on k2 leaves k3 as the least recently used
    assert!(coordinator.execute_with_resilience(&ctx, &k2).await.unwrap().cache_hit);
    coordinator.execute_with_resilience(&ctx, &k1).await.unwrap();
    assert!(cache.contains(&CacheKey::for_request(&k2)));
    assert!(!cache.contains(&CacheKey::for_request(&k3)));
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_cache_by_pattern() {
    let transport = ScriptedTransport::new();
    let coordinator = coordinator(
        test_config(),
        transport.clone(),
        &[("web-search", "ws"), ("web-fetch", "wf"), ("files", "fs")],
    )
    .await;
    let ctx = CallContext::new();

    let requests = [
        request("web-search", "query", 1),
        request("web-search", "query", 2),
        request("web-fetch", "get", 1),
        request("files", "read", 1),
    ];
    for req in &requests {
        coordinator.execute_with_resilience(&ctx, req).await.unwrap();
    }

    assert_eq!(coordinator.invalidate_cache("web-*").unwrap(), 3);
    let cache = coordinator.cache();
    assert!(cache.contains(&CacheKey::for_request(&requests[3])));
    assert_eq!(cache.stats().keys, 1);

    let err = coordinator.invalidate_cache("").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cache);
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_error_makes_one_invocation() {
    let transport = ScriptedTransport::new();
    transport.set_default(Err(TransportError::InvalidRequest("missing field q".into())));
    let coordinator = coordinator(test_config(), transport.clone(), &[("web-search", "a")]).await;

    let err = coordinator
        .execute_with_resilience(&CallContext::new(), &request("web-search", "query", 1))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NonRetryable);
    assert_eq!(err.attempts(), Some(1));
    assert_eq!(transport.invocations(), 1);
    // Application errors do not count against the endpoint
    assert_eq!(coordinator.registry().find("a").unwrap().failure_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_error_uses_every_attempt() {
    let transport = ScriptedTransport::new();
    transport.set_default(Err(TransportError::Throttled {
        message: "rate limited".into(),
        retry_after: None,
    }));
    let coordinator = coordinator(test_config(), transport.clone(), &[("web-search", "a")]).await;

    let err = coordinator
        .execute_with_resilience(&CallContext::new(), &request("web-search", "query", 1))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Throttled);
    assert_eq!(err.attempts(), Some(3));
    assert_eq!(transport.invocations(), 3);
    assert_eq!(coordinator.stats().await.retry.exhausted, 1);
}

#[tokio::test(start_paused = true)]
async fn test_success_after_transient_failure() {
    let transport = ScriptedTransport::new();
    transport.push(Err(TransportError::Other("i/o timeout".into())));
    let coordinator = coordinator(test_config(), transport.clone(), &[("web-search", "a")]).await;

    let result = coordinator
        .execute_with_resilience(&CallContext::new(), &request("web-search", "query", 1))
        .await
        .unwrap();

    assert_eq!(result.attempts, 2);
    assert_eq!(transport.invocations(), 2);

    let retry = coordinator.stats().await.retry;
    assert_eq!(retry.total_retries, 1);
    assert_eq!(retry.successful_retries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_tool_error_results_are_not_cached() {
    let transport = ScriptedTransport::new();
    transport.set_default(Ok(RawResult::error(json!({"message": "file not found"}))));
    let coordinator = coordinator(test_config(), transport.clone(), &[("files", "e")]).await;
    let ctx = CallContext::new();
    let req = request("files", "read", 1);

    let first = coordinator.execute_with_resilience(&ctx, &req).await.unwrap();
    let second = coordinator.execute_with_resilience(&ctx, &req).await.unwrap();

    assert!(first.is_error);
    assert!(!second.cache_hit);
    assert_eq!(transport.invocations(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_broken_connection_is_reconnected_then_invalidated() {
    let mut config = test_config();
    config.cache.enabled = false;
    config.retry.policy.max_attempts = 2;

    let transport = ScriptedTransport::new();
    let coordinator = coordinator(config, transport.clone(), &[("files", "e")]).await;
    let ctx = CallContext::new();

    coordinator
        .execute_with_resilience(&ctx, &request("files", "read", 1))
        .await
        .unwrap();
    assert_eq!(transport.connects.load(Ordering::SeqCst), 1);

    // Broken on the first attempt, the retry re-establishes the session
    transport.push(Err(TransportError::ConnectionBroken("broken pipe".into())));
    coordinator
        .execute_with_resilience(&ctx, &request("files", "read", 2))
        .await
        .unwrap();
    assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
    assert_eq!(transport.closes.load(Ordering::SeqCst), 0);

    // Broken on the last attempt, the connection is discarded
    transport.push(Err(TransportError::ConnectionBroken("broken pipe".into())));
    transport.push(Err(TransportError::ConnectionBroken("broken pipe".into())));
    let err = coordinator
        .execute_with_resilience(&ctx, &request("files", "read", 3))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
    assert_eq!(transport.closes.load(Ordering::SeqCst), 1);

    let pool = coordinator.stats().await.pool.endpoints["e"].clone();
    assert_eq!(pool.idle_connections, 0);
    assert_eq!(pool.total_retired, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_aborts_retries() {
    let mut config = test_config();
    config.retry.policy.base_delay = Duration::from_secs(1);
    config.retry.policy.max_delay = Duration::from_secs(10);

    let transport = ScriptedTransport::new();
    transport.set_default(Err(TransportError::Network("connection reset".into())));
    let coordinator = coordinator(config, transport.clone(), &[("files", "e")]).await;

    let ctx = CallContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        canceller.cancel();
    });

    let err = coordinator
        .execute_with_resilience(&ctx, &request("files", "read", 1))
        .await
        .unwrap_err();

    assert!(matches!(err, ResilienceError::Cancelled));
    assert!(!err.kind().is_retryable());
    assert_eq!(transport.invocations(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_bounds_the_call() {
    let transport = ScriptedTransport::new();
    transport.set_delay(Duration::from_secs(5));
    let coordinator = coordinator(test_config(), transport.clone(), &[("files", "e")]).await;

    let req = request("files", "read", 1).with_timeout(Duration::from_millis(200));
    let start = Instant::now();
    let err = coordinator
        .execute_with_resilience(&CallContext::new(), &req)
        .await
        .unwrap_err();

    assert!(matches!(err, ResilienceError::DeadlineExceeded));
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    assert!(!err.kind().is_retryable());
    assert!(start.elapsed() < Duration::from_secs(1));

    // The caller's deadline is not held against the endpoint
    let endpoint = coordinator.registry().find("e").unwrap();
    assert_eq!(endpoint.failure_count(), 0);
    assert_eq!(endpoint.health_score(), 1.0);
}

#[tokio::test(start_paused = true)]
async fn test_deregistered_endpoint_leaves_rotation() {
    let mut config = test_config();
    config.cache.enabled = false;

    let transport = ScriptedTransport::new();
    let coordinator = coordinator(config, transport.clone(), &[("files", "a"), ("files", "b")]).await;
    let ctx = CallContext::new();

    assert!(coordinator.deregister_endpoint("files", "a").await);
    assert!(!coordinator.deregister_endpoint("files", "a").await);

    for n in 0..3 {
        let result = coordinator
            .execute_with_resilience(&ctx, &request("files", "read", n))
            .await
            .unwrap();
        assert_eq!(result.endpoint.as_deref(), Some("b"));
    }

    assert!(coordinator.deregister_endpoint("files", "b").await);
    let err = coordinator
        .execute_with_resilience(&ctx, &request("files", "read", 9))
        .await
        .unwrap_err();
    assert!(matches!(err, ResilienceError::NoHealthyEndpoints { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_endpoint_id_is_rejected() {
    let transport = ScriptedTransport::new();
    let coordinator = coordinator(test_config(), transport.clone(), &[("files", "a")]).await;
    let original = coordinator.registry().find("a").unwrap();

    let err = coordinator
        .register_endpoint("web-search", toolpool::EndpointSpec::new("a", "tcp://a:1"), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, ResilienceError::DuplicateEndpoint { .. }));

    // The rejected registration leaves the existing endpoint and its pool alone
    assert!(Arc::ptr_eq(&original, &coordinator.registry().find("a").unwrap()));
    let result = coordinator
        .execute_with_resilience(&CallContext::new(), &request("files", "read", 1))
        .await
        .unwrap();
    assert_eq!(result.endpoint.as_deref(), Some("a"));
}

#[tokio::test]
async fn test_endpoint_is_callable_as_soon_as_it_is_selectable() {
    let mut config = test_config();
    config.cache.enabled = false;
    let transport = ScriptedTransport::new();
    let coordinator = coordinator(config, transport.clone(), &[]).await;

    let caller = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let ctx = CallContext::new();
            loop {
                match coordinator
                    .execute_with_resilience(&ctx, &request("files", "read", 1))
                    .await
                {
                    Err(ResilienceError::NoHealthyEndpoints { .. }) => tokio::task::yield_now().await,
                    other => return other,
                }
            }
        })
    };

    tokio::task::yield_now().await;
    coordinator
        .register_endpoint("files", toolpool::EndpointSpec::new("late", "tcp://late:1"), 1)
        .await
        .unwrap();

    let result = caller.await.unwrap().unwrap();
    assert_eq!(result.endpoint.as_deref(), Some("late"));
}

#[tokio::test(start_paused = true)]
async fn test_without_monitor_failing_endpoint_stays_in_rotation() {
    let mut config = test_config();
    config.cache.enabled = false;
    config.circuit_breaker.failure_threshold = 100;
    config.retry.policy.max_attempts = 1;

    let transport = ScriptedTransport::new();
    transport.set_default(Err(TransportError::Network("connection reset".into())));
    let coordinator = coordinator(config, transport.clone(), &[("files", "e")]).await;
    let ctx = CallContext::new();

    for n in 0..20 {
        let err = coordinator
            .execute_with_resilience(&ctx, &request("files", "read", n))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    let endpoint = coordinator.registry().find("e").unwrap();
    assert!(endpoint.is_reachable());
    assert!(endpoint.health_score() < toolpool::lb::UNREACHABLE_SCORE);

    transport.clear_default();
    let result = coordinator
        .execute_with_resilience(&ctx, &request("files", "read", 99))
        .await
        .unwrap();
    assert_eq!(result.endpoint.as_deref(), Some("e"));
    assert_eq!(endpoint.failure_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_in_flight_calls() {
    let transport = ScriptedTransport::new();
    transport.set_delay(Duration::from_secs(1));
    let coordinator = coordinator(test_config(), transport.clone(), &[("files", "e")]).await;

    let call = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .execute_with_resilience(&CallContext::new(), &request("files", "read", 1))
                .await
        })
    };
    wait_until(|| transport.in_flight() == 1).await;

    coordinator
        .shutdown(&CallContext::new().with_timeout(Duration::from_secs(5)))
        .await;

    assert!(call.await.unwrap().is_ok());
    assert!(coordinator.is_shutting_down());

    let err = coordinator
        .execute_with_resilience(&CallContext::new(), &request("files", "read", 2))
        .await
        .unwrap_err();
    assert!(matches!(err, ResilienceError::ShuttingDown));

    let stats = coordinator.stats().await;
    assert!(stats.pool.endpoints.is_empty());
    assert_eq!(stats.cache.keys, 0);
    assert!(stats.breakers.is_empty());
    assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_deadline_aborts_slow_calls() {
    let transport = ScriptedTransport::new();
    transport.set_delay(Duration::from_secs(60));
    let coordinator = coordinator(test_config(), transport.clone(), &[("files", "e")]).await;

    let call = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .execute_with_resilience(&CallContext::new(), &request("files", "read", 1))
                .await
        })
    };
    wait_until(|| transport.in_flight() == 1).await;

    let start = Instant::now();
    coordinator
        .shutdown(&CallContext::new().with_timeout(Duration::from_millis(100)))
        .await;
    assert!(start.elapsed() < Duration::from_secs(1));

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, ResilienceError::ShuttingDown));
}

#[tokio::test(start_paused = true)]
async fn test_stats_serialize() {
    let transport = ScriptedTransport::new();
    let coordinator = coordinator(test_config(), transport, &[("files", "e")]).await;
    coordinator
        .execute_with_resilience(&CallContext::new(), &request("files", "read", 1))
        .await
        .unwrap();

    let stats = serde_json::to_value(coordinator.stats().await).unwrap();
    assert_eq!(stats["pool"]["totals"]["total_created"], 1);
    assert_eq!(stats["endpoints"][0]["id"], "e");
    assert_eq!(stats["endpoints"][0]["state"], "healthy");
    assert_eq!(stats["breakers"][0]["state"], "Closed");
    assert_eq!(stats["cache"]["keys"], 1);
}

#[tokio::test(start_paused = true)]
async fn test_health_monitor_takes_dead_endpoint_out_of_rotation() {
    let mut config = test_config();
    config.cache.enabled = false;
    config.health.enabled = true;
    config.health.interval = Duration::from_secs(1);
    config.health.unhealthy_threshold = 2;
    config.health.max_reconnect_attempts = 1;

    let transport = ScriptedTransport::new();
    let probe = Arc::new(common::SwitchProbe::default());
    let coordinator = toolpool::Coordinator::configure(config, transport.clone(), probe.clone())
        .await
        .unwrap();
    for id in ["a", "b"] {
        coordinator
            .register_endpoint("files", toolpool::EndpointSpec::new(id, format!("tcp://{id}:1")), 1)
            .await
            .unwrap();
    }

    probe.down.store(true, Ordering::SeqCst);
    transport.set_fail_connect(true);
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let a = coordinator.registry().find("a").unwrap();
    assert!(!a.is_reachable());
    assert_eq!(
        coordinator.execute_with_resilience(&CallContext::new(), &request("files", "read", 1))
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::NoHealthyEndpoints
    );

    probe.down.store(false, Ordering::SeqCst);
    transport.set_fail_connect(false);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(a.is_reachable());

    coordinator.shutdown(&CallContext::new()).await;
}
