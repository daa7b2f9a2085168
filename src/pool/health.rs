//! Background health monitoring and endpoint reconnection

use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::connection::ConnectionPool;
use crate::context::{CallContext, ContextError};
use crate::error::TransportError;
use crate::lb::{Endpoint, EndpointId, EndpointRegistry};
use crate::transport::{HealthProbe, Transport};

/// Configuration for health checking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Whether active health checking is enabled
    pub enabled: bool,

    /// Interval between health checks
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Timeout for a single probe or ping round
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Number of consecutive failed checks before marking an endpoint unreachable
    pub unhealthy_threshold: u32,

    /// Idle connections pinged per check
    pub sample_size: usize,

    /// First reconnect delay, doubled per attempt
    #[serde(with = "humantime_serde")]
    pub reconnect_backoff_base: Duration,

    /// Ceiling for the reconnect delay
    #[serde(with = "humantime_serde")]
    pub reconnect_backoff_max: Duration,

    /// Reconnect attempts before leaving recovery to the periodic checks
    pub max_reconnect_attempts: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
            sample_size: 2,
            reconnect_backoff_base: Duration::from_secs(1),
            reconnect_backoff_max: Duration::from_secs(30),
            max_reconnect_attempts: 5,
        }
    }
}

/// Result of checking one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointCheck {
    Healthy,
    /// The endpoint was unreachable and passed this check
    Recovered,
    Unhealthy { consecutive: u32 },
    /// This check crossed the threshold; the pool was flushed and a reconnect loop started
    MarkedUnreachable,
    /// A reconnect loop owns the endpoint, or the monitor is stopping
    Skipped,
}

/// Background monitor that probes endpoints and rebuilds pools for unreachable ones
pub struct HealthMonitor {
    registry: Arc<EndpointRegistry>,
    pool: Arc<ConnectionPool>,
    transport: Arc<dyn Transport>,
    probe: Arc<dyn HealthProbe>,
    config: HealthCheckConfig,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl HealthMonitor {
    /// Create a new health monitor. Tasks it spawns are tracked by `tasks` and
    /// stop when `shutdown` is cancelled.
    pub fn new(
        registry: Arc<EndpointRegistry>,
        pool: Arc<ConnectionPool>,
        transport: Arc<dyn Transport>,
        probe: Arc<dyn HealthProbe>,
        config: HealthCheckConfig,
        shutdown: CancellationToken,
        tasks: TaskTracker,
    ) -> Self {
        Self {
            registry,
            pool,
            transport,
            probe,
            config,
            shutdown,
            tasks,
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Start the periodic health check loop
    pub fn start(self: Arc<Self>) {
        if !self.config.enabled {
            info!("Health monitor disabled - endpoints stay reachable until calls fail");
            return;
        }

        let tasks = self.tasks.clone();
        tasks.spawn(async move { self.run().await });
    }

    async fn run(self: Arc<Self>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            threshold = self.config.unhealthy_threshold,
            "Health monitor started"
        );

        let Some(start) = Instant::now().checked_add(self.config.interval) else {
            warn!(interval = ?self.config.interval, "Health check interval out of range, monitor not started");
            return;
        };
        let mut ticker = tokio::time::interval_at(start, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let start = Instant::now();
                    let results = self.check_all_endpoints().await;
                    debug!(
                        endpoints = results.len(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Health check cycle completed"
                    );
                }
            }
        }

        info!("Health monitor stopped");
    }

    fn probe_context(&self) -> CallContext {
        CallContext::from_token(self.shutdown.child_token()).with_timeout(self.config.timeout)
    }

    /// Check every registered endpoint in parallel
    pub async fn check_all_endpoints(self: &Arc<Self>) -> Vec<(EndpointId, EndpointCheck)> {
        let endpoints = self.registry.all();
        let checks = endpoints.iter().map(|endpoint| async move {
            (endpoint.id().to_string(), self.check_endpoint(endpoint).await)
        });
        join_all(checks).await
    }

    /// Check a single endpoint and apply the verdict
    pub async fn check_endpoint(self: &Arc<Self>, endpoint: &Arc<Endpoint>) -> EndpointCheck {
        if self.pool.is_reconnecting(endpoint.id()).await {
            return EndpointCheck::Skipped;
        }

        let ctx = self.probe_context();
        let start = Instant::now();
        let result = self.probe_endpoint(&ctx, endpoint).await;
        if self.shutdown.is_cancelled() {
            return EndpointCheck::Skipped;
        }
        endpoint.update_last_health_check();

        match result {
            Ok(()) => {
                endpoint.record_latency(start.elapsed());
                let recovered = endpoint.record_probe_success();
                if recovered {
                    info!(endpoint_id = %endpoint.id(), "Endpoint passed health check and is reachable again");
                }

                if let Err(e) = self.pool.top_up(&ctx, endpoint.id()).await {
                    debug!(endpoint_id = %endpoint.id(), error = %e, "Failed to top up idle connections");
                }

                if recovered {
                    EndpointCheck::Recovered
                } else {
                    EndpointCheck::Healthy
                }
            }
            Err(e) => {
                let consecutive = endpoint.record_probe_failure();
                debug!(
                    endpoint_id = %endpoint.id(),
                    error = %e,
                    consecutive = consecutive,
                    "Health check failed"
                );

                if consecutive >= self.config.unhealthy_threshold && endpoint.mark_unreachable() {
                    warn!(
                        endpoint_id = %endpoint.id(),
                        consecutive = consecutive,
                        "Endpoint marked unreachable"
                    );
                    self.pool.flush(endpoint.id()).await;
                    self.spawn_reconnect(Arc::clone(endpoint));
                    return EndpointCheck::MarkedUnreachable;
                }

                EndpointCheck::Unhealthy { consecutive }
            }
        }
    }

    /// Ping sampled idle connections, or fall back to the probe when there are none
    async fn probe_endpoint(&self, ctx: &CallContext, endpoint: &Endpoint) -> Result<(), TransportError> {
        let sample = self.pool.idle_sample(endpoint.id(), self.config.sample_size).await;
        if sample.is_empty() {
            return bounded(ctx, self.probe.check(ctx, endpoint)).await;
        }

        let mut alive = 0;
        let mut last_error = None;
        for conn in &sample {
            match bounded(ctx, self.transport.ping(ctx, conn)).await {
                Ok(()) => alive += 1,
                Err(e) => {
                    debug!(
                        endpoint_id = %endpoint.id(),
                        connection_id = conn.id(),
                        error = %e,
                        "Idle connection failed ping"
                    );
                    self.pool.discard_idle(endpoint.id(), conn.id()).await;
                    last_error = Some(e);
                }
            }
        }

        match (alive, last_error) {
            (0, Some(e)) => Err(e),
            _ => Ok(()),
        }
    }

    fn spawn_reconnect(self: &Arc<Self>, endpoint: Arc<Endpoint>) {
        let monitor = Arc::clone(self);
        self.tasks.spawn(async move {
            monitor.reconnect_loop(endpoint).await;
        });
    }

    /// Rebuild a connection with exponential backoff, restoring the endpoint on success
    async fn reconnect_loop(&self, endpoint: Arc<Endpoint>) -> bool {
        let id = endpoint.id();
        if !self.pool.begin_reconnect(id).await {
            return false;
        }

        let mut backoff = self.config.reconnect_backoff_base;
        let mut restored = false;

        for attempt in 1..=self.config.max_reconnect_attempts {
            let delay = jittered(backoff);
            debug!(endpoint_id = %id, attempt = attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            if self.registry.find(id).is_none() {
                debug!(endpoint_id = %id, "Endpoint deregistered, stopping reconnect");
                break;
            }

            let ctx = CallContext::from_token(self.shutdown.child_token());
            let outcome = match self.pool.reconnect(&ctx, id).await {
                Ok(true) => Ok(()),
                Ok(false) => {
                    let probe_ctx = ctx.clone().with_timeout(self.config.timeout);
                    bounded(&probe_ctx, self.probe.check(&probe_ctx, &endpoint))
                        .await
                        .map_err(|e| e.to_string())
                }
                Err(e) => Err(e.to_string()),
            };

            match outcome {
                Ok(()) => {
                    endpoint.mark_reachable();
                    info!(endpoint_id = %id, attempt = attempt, "Endpoint reconnected");
                    restored = true;
                    break;
                }
                Err(error) => {
                    warn!(
                        endpoint_id = %id,
                        attempt = attempt,
                        max_attempts = self.config.max_reconnect_attempts,
                        error = %error,
                        "Reconnect attempt failed"
                    );
                }
            }

            backoff = backoff.saturating_mul(2).min(self.config.reconnect_backoff_max);
        }

        self.pool.end_reconnect(id).await;
        if !restored && !self.shutdown.is_cancelled() {
            warn!(endpoint_id = %id, "Giving up on reconnecting endpoint until a health check passes");
        }
        restored
    }
}

/// Run a probe under the context, folding context expiry into a transport error
async fn bounded<F>(ctx: &CallContext, check: F) -> Result<(), TransportError>
where
    F: Future<Output = Result<(), TransportError>>,
{
    match ctx.run(check).await {
        Ok(result) => result,
        Err(ContextError::DeadlineExceeded) => Err(TransportError::Timeout("health check timed out".into())),
        Err(ContextError::Cancelled) => Err(TransportError::Other("health check cancelled".into())),
    }
}

/// Somewhere between half and all of `backoff`
fn jittered(backoff: Duration) -> Duration {
    let half = backoff / 2;
    half + half.mul_f64(rand::thread_rng().gen::<f64>())
}
