use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;

/// Unique identifier for an endpoint
pub type EndpointId = String;

/// Score below which an endpoint is reported as degraded
pub const DEGRADED_SCORE: f64 = 0.5;

/// Score below which call failures mark an endpoint unreachable
pub const UNREACHABLE_SCORE: f64 = 0.1;

/// Score an endpoint is lifted to when the monitor brings it back
const RECOVERED_SCORE: f64 = 0.3;

const SUCCESS_RECOVERY: f64 = 0.1;
const FAILURE_DECAY: f64 = 0.8;
const LATENCY_ALPHA: f64 = 0.2;

/// How the transport reaches an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Tcp,
    Http,
    WebSocket,
    Stdio,
}

/// Health state derived from the score and the monitor's verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointState {
    Healthy,
    Degraded,
    Unreachable,
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointState::Healthy => "healthy",
            EndpointState::Degraded => "degraded",
            EndpointState::Unreachable => "unreachable",
        };
        f.write_str(name)
    }
}

/// Static description of an endpoint as supplied at registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub id: EndpointId,

    /// Provider address handed to the transport (URL, host:port, command line)
    pub address: String,

    #[serde(default)]
    pub transport: TransportKind,
}

impl EndpointSpec {
    pub fn new(id: impl Into<EndpointId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            transport: TransportKind::default(),
        }
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }
}

/// One provider instance serving a capability, with health and load tracking
#[derive(Debug)]
pub struct Endpoint {
    spec: EndpointSpec,

    /// Logical server name this endpoint serves
    capability: String,

    weight: u32,

    /// Health score in [0, 1], stored as f64 bits
    health_score: AtomicU64,

    /// Set by the health monitor or by a collapsing score
    unreachable: AtomicBool,

    /// Leases currently checked out from the pool
    active_connections: AtomicU32,

    /// Consecutive call failures (reset on success)
    failure_count: AtomicU32,

    /// Consecutive failed health checks (reset on a passing check)
    probe_failures: AtomicU32,

    /// Exponentially weighted latency in microseconds as f64 bits, NaN until first sample
    latency_micros: AtomicU64,

    last_health_check: RwLock<Option<Instant>>,
}

impl Endpoint {
    pub fn new(capability: impl Into<String>, spec: EndpointSpec, weight: u32) -> Self {
        Self {
            spec,
            capability: capability.into(),
            weight,
            health_score: AtomicU64::new(1.0f64.to_bits()),
            unreachable: AtomicBool::new(false),
            active_connections: AtomicU32::new(0),
            failure_count: AtomicU32::new(0),
            probe_failures: AtomicU32::new(0),
            latency_micros: AtomicU64::new(f64::NAN.to_bits()),
            last_health_check: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn address(&self) -> &str {
        &self.spec.address
    }

    pub fn transport(&self) -> TransportKind {
        self.spec.transport
    }

    pub fn spec(&self) -> &EndpointSpec {
        &self.spec
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Increment the active connection counter
    pub fn increment_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the active connection counter
    pub fn decrement_connections(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn health_score(&self) -> f64 {
        f64::from_bits(self.health_score.load(Ordering::Relaxed))
    }

    /// Set the health score, clamped to [0, 1]
    pub fn set_health_score(&self, score: f64) {
        self.health_score
            .store(score.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    fn update_score(&self, f: impl Fn(f64) -> f64) -> f64 {
        let mut current = self.health_score.load(Ordering::Relaxed);
        loop {
            let next = f(f64::from_bits(current)).clamp(0.0, 1.0);
            match self.health_score.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Record a successful call: score moves a tenth of the way back to 1
    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
        self.update_score(|s| s + (1.0 - s) * SUCCESS_RECOVERY);
    }

    /// Record a failed call: score decays by a fifth.
    ///
    /// Returns true when this failure pushed the endpoint into `Unreachable`.
    pub fn record_failure(&self) -> bool {
        self.penalize() < UNREACHABLE_SCORE && self.mark_unreachable()
    }

    /// Record a failed call without ever taking the endpoint out of rotation.
    ///
    /// Used when no health monitor runs, since only the monitor brings an
    /// `Unreachable` endpoint back.
    pub fn record_failure_in_rotation(&self) {
        self.penalize();
    }

    fn penalize(&self) -> f64 {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.update_score(|s| s * FAILURE_DECAY)
    }

    /// Fold a latency sample into the moving average
    pub fn record_latency(&self, latency: Duration) {
        let sample = latency.as_secs_f64() * 1_000_000.0;
        let mut current = self.latency_micros.load(Ordering::Relaxed);
        loop {
            let previous = f64::from_bits(current);
            let next = if previous.is_nan() {
                sample
            } else {
                previous + LATENCY_ALPHA * (sample - previous)
            };
            match self.latency_micros.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Average latency, `None` until the first sample
    pub fn latency(&self) -> Option<Duration> {
        let micros = f64::from_bits(self.latency_micros.load(Ordering::Relaxed));
        if micros.is_nan() {
            None
        } else {
            Some(Duration::from_secs_f64(micros.max(0.0) / 1_000_000.0))
        }
    }

    pub fn state(&self) -> EndpointState {
        if self.unreachable.load(Ordering::Acquire) {
            EndpointState::Unreachable
        } else if self.health_score() < DEGRADED_SCORE {
            EndpointState::Degraded
        } else {
            EndpointState::Healthy
        }
    }

    /// Selectable by the load balancer
    pub fn is_reachable(&self) -> bool {
        !self.unreachable.load(Ordering::Acquire)
    }

    /// Returns true if the endpoint was reachable before
    pub fn mark_unreachable(&self) -> bool {
        !self.unreachable.swap(true, Ordering::AcqRel)
    }

    /// Bring the endpoint back into rotation as at least `Degraded`.
    ///
    /// Returns true if the endpoint was unreachable before.
    pub fn mark_reachable(&self) -> bool {
        let was_unreachable = self.unreachable.swap(false, Ordering::AcqRel);
        if was_unreachable {
            self.failure_count.store(0, Ordering::Relaxed);
            self.update_score(|s| s.max(RECOVERED_SCORE));
        }
        was_unreachable
    }

    /// Record a passing health check. Returns true if this restored the endpoint.
    pub fn record_probe_success(&self) -> bool {
        self.probe_failures.store(0, Ordering::Relaxed);
        self.update_score(|s| s + (1.0 - s) * SUCCESS_RECOVERY);
        self.mark_reachable()
    }

    /// Record a failed health check, returning the consecutive failure count
    pub fn record_probe_failure(&self) -> u32 {
        self.update_score(|s| s * FAILURE_DECAY);
        self.probe_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn probe_failures(&self) -> u32 {
        self.probe_failures.load(Ordering::Relaxed)
    }

    /// Update last health check timestamp
    pub fn update_last_health_check(&self) {
        if let Ok(mut last) = self.last_health_check.write() {
            *last = Some(Instant::now());
        }
    }

    /// Get the time since last health check
    pub fn time_since_last_check(&self) -> Option<Duration> {
        self.last_health_check
            .read()
            .ok()
            .and_then(|last| last.map(|at| at.elapsed()))
    }

    pub fn stats(&self) -> EndpointStats {
        EndpointStats {
            id: self.spec.id.clone(),
            capability: self.capability.clone(),
            address: self.spec.address.clone(),
            transport: self.spec.transport,
            weight: self.weight,
            state: self.state(),
            health_score: self.health_score(),
            active_connections: self.active_connections(),
            failure_count: self.failure_count(),
            probe_failures: self.probe_failures(),
            latency: self.latency(),
            last_check: self.time_since_last_check(),
        }
    }
}

/// Point-in-time view of one endpoint
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub id: EndpointId,
    pub capability: String,
    pub address: String,
    pub transport: TransportKind,
    pub weight: u32,
    pub state: EndpointState,
    pub health_score: f64,
    pub active_connections: u32,
    pub failure_count: u32,
    pub probe_failures: u32,
    #[serde(with = "humantime_serde")]
    pub latency: Option<Duration>,
    /// Time since the last health check
    #[serde(with = "humantime_serde")]
    pub last_check: Option<Duration>,
}
