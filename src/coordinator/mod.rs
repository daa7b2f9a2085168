//! Execution coordinator
//!
//! The public entry point of the runtime. A [`Coordinator`] owns one instance
//! of every component and composes them per call:
//!
//! ```text
//! cache ─hit─► result
//!   │ miss
//!   ▼
//! load balancer ─► connection pool ─► retry engine ─► circuit breaker ─► transport
//!                                                                           │
//! cache ◄──────────────────────── non-error result ◄────────────────────────┘
//! ```
//!
//! Retries stay on the selected endpoint. Failover to another endpoint happens
//! on the next call, once health scores or the monitor have moved traffic away.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheManager, CacheStats};
use crate::config::{ConfigError, ResilienceConfig};
use crate::context::CallContext;
use crate::error::{ErrorKind, ResilienceError};
use crate::lb::{Endpoint, EndpointRegistry, EndpointSpec, EndpointStats, LoadBalancer};
use crate::pool::{BreakerKey, CircuitBreaker, CircuitStats, ConnectionPool, HealthMonitor, PoolSnapshot};
use crate::retry::{RetryEngine, RetryStats};
use crate::transport::{HealthProbe, Transport};
use crate::types::{ToolExecutionRequest, ToolExecutionResult};

/// Snapshot of every component's counters
#[derive(Debug, Clone, Serialize)]
pub struct ResilienceStats {
    pub pool: PoolSnapshot,
    pub cache: CacheStats,
    pub breakers: Vec<CircuitStats>,
    pub endpoints: Vec<EndpointStats>,
    pub retry: RetryStats,
}

struct Inner {
    config: ResilienceConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<EndpointRegistry>,
    balancer: LoadBalancer,
    pool: Arc<ConnectionPool>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryEngine,
    cache: Arc<CacheManager>,

    /// Stops the health monitor, reconnect loops and cache sweeper
    background: CancellationToken,
    tasks: TaskTracker,

    /// Counts calls currently inside `execute_with_resilience`
    in_flight: TaskTracker,
    /// Aborts calls still running when the shutdown deadline passes
    abort: CancellationToken,
    closing: AtomicBool,
}

/// Resilient tool execution runtime. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Build every component from a validated configuration, register the
    /// configured endpoints and start the background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn configure(
        config: ResilienceConfig,
        transport: Arc<dyn Transport>,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        tokio::runtime::Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;

        let registry = Arc::new(EndpointRegistry::new());
        let pool = Arc::new(ConnectionPool::new(config.pool.clone(), Arc::clone(&transport)));
        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let cache = Arc::new(CacheManager::new(config.cache.clone()));

        let background = CancellationToken::new();
        let tasks = TaskTracker::new();

        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            Arc::clone(&transport),
            probe,
            config.health.clone(),
            background.clone(),
            tasks.clone(),
        ));

        let coordinator = Self {
            inner: Arc::new(Inner {
                balancer: LoadBalancer::new(Arc::clone(&registry), config.load_balancer.strategy),
                retry: RetryEngine::new(Arc::clone(&breaker)),
                transport,
                registry,
                pool,
                breaker,
                cache: Arc::clone(&cache),
                background: background.clone(),
                tasks: tasks.clone(),
                in_flight: TaskTracker::new(),
                abort: CancellationToken::new(),
                closing: AtomicBool::new(false),
                config,
            }),
        };

        for (capability, endpoints) in &coordinator.inner.config.endpoints {
            for endpoint in endpoints {
                coordinator
                    .register_endpoint(capability, endpoint.spec.clone(), endpoint.weight)
                    .await?;
            }
        }

        monitor.start();
        cache.start_sweeper(background, &tasks);

        let config = &coordinator.inner.config;
        info!(
            endpoints = coordinator.inner.registry.len(),
            strategy = %config.load_balancer.strategy,
            max_connections = config.pool.max_connections,
            cache_enabled = config.cache.enabled,
            "Coordinator configured"
        );

        Ok(coordinator)
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.inner.registry
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.inner.cache
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Add an endpoint to a capability, or replace one with the same id
    pub async fn register_endpoint(
        &self,
        capability: &str,
        spec: EndpointSpec,
        weight: u32,
    ) -> Result<Arc<Endpoint>, ResilienceError> {
        if self.is_shutting_down() {
            return Err(ResilienceError::ShuttingDown);
        }

        let inner = &self.inner;
        inner.registry.ensure_available(capability, &spec.id)?;

        // The pool has to exist before the balancer can hand the endpoint out
        let endpoint = Arc::new(Endpoint::new(capability, spec, weight.max(1)));
        inner.pool.register_endpoint(Arc::clone(&endpoint)).await;

        if let Err(e) = inner.registry.insert(Arc::clone(&endpoint)) {
            inner.pool.remove_endpoint_instance(&endpoint).await;
            return Err(e);
        }
        Ok(endpoint)
    }

    /// Remove an endpoint from future selection.
    ///
    /// Calls already using it finish normally; their connections are closed on
    /// return. The endpoint's circuit breakers are dropped.
    pub async fn deregister_endpoint(&self, capability: &str, endpoint_id: &str) -> bool {
        if self.inner.registry.deregister(capability, endpoint_id).is_none() {
            return false;
        }

        self.inner.pool.remove_endpoint(endpoint_id).await;
        let breakers = self.inner.breaker.remove_endpoint(endpoint_id).await;
        info!(
            capability = %capability,
            endpoint_id = %endpoint_id,
            breakers = breakers,
            "Deregistered endpoint"
        );
        true
    }

    /// Execute a tool call through cache, load balancer, pool, retry engine and breaker
    pub async fn execute_with_resilience(
        &self,
        ctx: &CallContext,
        request: &ToolExecutionRequest,
    ) -> Result<ToolExecutionResult, ResilienceError> {
        let _in_flight = self.inner.in_flight.token();
        if self.is_shutting_down() {
            return Err(ResilienceError::ShuttingDown);
        }

        let ctx = match request.timeout {
            Some(timeout) => ctx.clone().with_timeout(timeout),
            None => ctx.clone(),
        };

        tokio::select! {
            biased;
            _ = self.inner.abort.cancelled() => Err(ResilienceError::ShuttingDown),
            result = self.execute(&ctx, request) => result,
        }
    }

    async fn execute(
        &self,
        ctx: &CallContext,
        request: &ToolExecutionRequest,
    ) -> Result<ToolExecutionResult, ResilienceError> {
        let inner = &self.inner;
        let start = Instant::now();
        ctx.check()?;

        let key = CacheKey::for_request(request);
        match inner.cache.get(&key) {
            Ok(Some(raw)) => {
                debug!(server = %request.server, tool = %request.tool, key = %key, "Cache hit");
                return Ok(ToolExecutionResult::from_cache(request, raw, start.elapsed()));
            }
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "Cache lookup failed, continuing uncached"),
        }

        let endpoint = inner.balancer.select(ctx, &request.server)?;
        let lease = match inner.pool.acquire(ctx, &endpoint).await {
            Ok(lease) => lease,
            Err(e) => {
                if matches!(e, ResilienceError::Transport { .. }) {
                    record_call_failure(&endpoint, &e, inner.config.health.enabled);
                }
                return Err(e);
            }
        };

        let breaker_key = BreakerKey::new(endpoint.id(), &request.tool);
        let policy = inner.config.retry.policy_for(&request.server, &request.tool);
        let transport = &inner.transport;
        let connection = lease.connection();
        let broken = AtomicBool::new(false);
        let call_start = Instant::now();

        let outcome = inner
            .retry
            .execute(ctx, &breaker_key, policy, |attempt| {
                let broken = &broken;
                async move {
                    if broken.swap(false, Ordering::Relaxed) {
                        debug!(
                            endpoint_id = %connection.endpoint_id(),
                            connection_id = connection.id(),
                            attempt = attempt,
                            "Re-establishing broken connection before retry"
                        );
                        if let Err(e) = transport.connect(ctx, connection).await {
                            broken.store(true, Ordering::Relaxed);
                            return Err(e);
                        }
                    }

                    let result = transport.invoke(ctx, connection, request).await;
                    if let Err(e) = &result {
                        if e.breaks_connection() {
                            broken.store(true, Ordering::Relaxed);
                        }
                    }
                    result
                }
            })
            .await;

        match outcome {
            Ok(outcome) => {
                endpoint.record_latency(call_start.elapsed());
                endpoint.record_success();
                lease.release();

                let raw = outcome.value;
                if !raw.is_error {
                    if let Err(e) = inner.cache.set(key, raw.clone(), None) {
                        warn!(server = %request.server, tool = %request.tool, error = %e, "Failed to cache result");
                    }
                }

                debug!(
                    server = %request.server,
                    tool = %request.tool,
                    endpoint_id = %endpoint.id(),
                    attempts = outcome.attempts,
                    is_error = raw.is_error,
                    "Tool call completed"
                );
                Ok(ToolExecutionResult::from_call(
                    request,
                    endpoint.id().to_string(),
                    raw,
                    start.elapsed(),
                    outcome.attempts,
                ))
            }
            Err(e) => {
                record_call_failure(&endpoint, &e, inner.config.health.enabled);
                if e.breaks_connection() || broken.load(Ordering::Relaxed) {
                    lease.invalidate();
                } else {
                    lease.release();
                }

                debug!(
                    server = %request.server,
                    tool = %request.tool,
                    endpoint_id = %endpoint.id(),
                    kind = %e.kind(),
                    error = %e,
                    "Tool call failed"
                );
                Err(e)
            }
        }
    }

    /// Counters from every component
    pub async fn stats(&self) -> ResilienceStats {
        let inner = &self.inner;
        ResilienceStats {
            pool: inner.pool.get_all_stats().await,
            cache: inner.cache.stats(),
            breakers: inner.breaker.get_all_stats().await,
            endpoints: inner.registry.all().iter().map(|e| e.stats()).collect(),
            retry: inner.retry.stats(),
        }
    }

    /// Remove cached results whose server (or `server:tool`) matches the glob
    pub fn invalidate_cache(&self, pattern: &str) -> Result<usize, ResilienceError> {
        Ok(self.inner.cache.invalidate_by_pattern(pattern)?)
    }

    pub async fn reset_circuit(&self, key: &BreakerKey) -> bool {
        self.inner.breaker.reset_circuit(key).await
    }

    pub async fn reset_all_circuits(&self) -> usize {
        self.inner.breaker.reset_all().await
    }

    /// Stop accepting calls, wait for in-flight ones until `ctx` expires, then
    /// stop background tasks and close every pooled connection.
    ///
    /// Calls still running at the deadline are aborted with `ShuttingDown`.
    pub async fn shutdown(&self, ctx: &CallContext) {
        let inner = &self.inner;
        if inner.closing.swap(true, Ordering::AcqRel) {
            debug!("Shutdown already in progress");
        }
        info!("Shutting down coordinator");

        inner.in_flight.close();
        if ctx.run(inner.in_flight.wait()).await.is_err() {
            warn!(
                in_flight = inner.in_flight.len(),
                "Shutdown deadline reached, aborting in-flight calls"
            );
            inner.abort.cancel();
            inner.in_flight.wait().await;
        }

        inner.background.cancel();
        inner.tasks.close();
        inner.tasks.wait().await;

        inner.pool.close_all().await;
        inner.breaker.clear().await;
        inner.cache.clear();

        info!("Coordinator shut down");
    }
}

/// Network and timeout failures count against the endpoint's health score.
///
/// Without a health monitor nothing could bring an evicted endpoint back, so
/// failures then only degrade it.
fn record_call_failure(endpoint: &Endpoint, error: &ResilienceError, monitored: bool) {
    if !matches!(error.kind(), ErrorKind::Network | ErrorKind::Timeout) {
        return;
    }
    if !monitored {
        endpoint.record_failure_in_rotation();
        return;
    }
    if endpoint.record_failure() {
        warn!(
            endpoint_id = %endpoint.id(),
            health_score = endpoint.health_score(),
            "Endpoint marked unreachable after repeated call failures"
        );
    }
}
