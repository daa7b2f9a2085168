//! Circuit breaker implementation for fault tolerance
//!
//! One breaker exists per (endpoint, tool) pair, created lazily on first use.
//! Each breaker moves through three states:
//! - Closed: calls flow; failures inside `failure_window` are counted
//! - Open: calls fail fast until `recovery_timeout` has elapsed
//! - HalfOpen: up to `half_open_max_calls` trial calls probe the endpoint
//!
//! A trial success closes the breaker, a trial failure reopens it. Admission is
//! handed out as a [`CircuitPermit`]; dropping a permit without reporting an
//! outcome frees its trial slot without moving the breaker.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ResilienceError;
use crate::lb::EndpointId;

/// Identifies one breaker
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BreakerKey {
    pub endpoint: EndpointId,
    pub tool: String,
}

impl BreakerKey {
    pub fn new(endpoint: impl Into<EndpointId>, tool: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            tool: tool.into(),
        }
    }
}

impl fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.endpoint, self.tool)
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Normal operation - requests are allowed
    Closed,

    /// Endpoint has failed - requests are rejected
    Open,

    /// Testing recovery - limited requests allowed
    HalfOpen,
}

impl CircuitState {
    /// Get a human-readable state name
    pub fn name(&self) -> &str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures inside the window that open the circuit
    pub failure_threshold: u32,

    /// How long to wait before transitioning from open to half-open
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,

    /// Maximum number of concurrent trial calls in half-open state
    pub half_open_max_calls: u32,

    /// Time window for tracking failures
    #[serde(with = "humantime_serde")]
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
            failure_window: Duration::from_secs(60),
        }
    }
}

/// Per-key circuit breaker state and statistics
struct Circuit {
    key: BreakerKey,

    /// Current circuit state
    state: CircuitState,

    /// Configuration
    config: CircuitBreakerConfig,

    /// Recent failure timestamps (for sliding window)
    recent_failures: VecDeque<Instant>,

    /// When the circuit last opened
    opened_at: Option<Instant>,

    /// Trial calls currently admitted in half-open state
    half_open_in_flight: u32,

    /// Total number of admitted calls
    total_calls: u64,

    /// Total successful calls
    total_successes: u64,

    /// Total failed calls
    total_failures: u64,

    /// Calls turned away while open or saturated
    rejected: u64,

    /// Number of times the circuit has opened
    open_count: u64,

    /// Last state transition time
    last_transition: Instant,
}

impl Circuit {
    fn new(key: BreakerKey, config: CircuitBreakerConfig) -> Self {
        Self {
            key,
            state: CircuitState::Closed,
            config,
            recent_failures: VecDeque::new(),
            opened_at: None,
            half_open_in_flight: 0,
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
            rejected: 0,
            open_count: 0,
            last_transition: Instant::now(),
        }
    }

    /// Admit a call, returning whether it is a half-open trial
    fn try_acquire(&mut self, now: Instant) -> Result<bool, Option<Duration>> {
        if self.state == CircuitState::Open {
            let opened_at = self.opened_at.unwrap_or(self.last_transition);
            let elapsed = now.saturating_duration_since(opened_at);
            if elapsed < self.config.recovery_timeout {
                self.rejected += 1;
                return Err(Some(self.config.recovery_timeout - elapsed));
            }
            info!(key = %self.key, "Circuit transitioning from Open to HalfOpen");
            self.transition_to_half_open(now);
        }

        match self.state {
            CircuitState::Closed => {
                self.total_calls += 1;
                Ok(false)
            }
            CircuitState::HalfOpen if self.half_open_in_flight < self.config.half_open_max_calls => {
                self.half_open_in_flight += 1;
                self.total_calls += 1;
                debug!(
                    key = %self.key,
                    in_flight = self.half_open_in_flight,
                    "Admitted half-open trial call"
                );
                Ok(true)
            }
            _ => {
                self.rejected += 1;
                Err(None)
            }
        }
    }

    fn end_trial(&mut self, trial: bool) {
        if trial {
            self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Record a successful call
    fn record_success(&mut self, trial: bool, now: Instant) {
        self.end_trial(trial);
        self.total_successes += 1;

        match self.state {
            CircuitState::Closed => self.recent_failures.clear(),
            CircuitState::HalfOpen if trial => {
                info!(key = %self.key, "Circuit transitioning from HalfOpen to Closed");
                self.transition_to_closed(now);
            }
            // Outcomes of calls admitted before the last transition do not move the breaker
            _ => {}
        }
    }

    /// Record a failed call
    fn record_failure(&mut self, trial: bool, now: Instant) {
        self.end_trial(trial);
        self.total_failures += 1;

        match self.state {
            CircuitState::Closed => {
                self.recent_failures.push_back(now);
                while let Some(&oldest) = self.recent_failures.front() {
                    if now.saturating_duration_since(oldest) >= self.config.failure_window {
                        self.recent_failures.pop_front();
                    } else {
                        break;
                    }
                }

                let failures = self.recent_failures.len() as u32;
                debug!(
                    key = %self.key,
                    failures = failures,
                    threshold = self.config.failure_threshold,
                    "Call failed in Closed state"
                );

                if failures >= self.config.failure_threshold {
                    warn!(key = %self.key, failures = failures, "Circuit transitioning from Closed to Open");
                    self.transition_to_open(now);
                }
            }
            CircuitState::HalfOpen if trial => {
                warn!(key = %self.key, "Trial call failed in HalfOpen state - reopening circuit");
                self.transition_to_open(now);
            }
            _ => {}
        }
    }

    /// Transition to Closed state
    fn transition_to_closed(&mut self, now: Instant) {
        self.state = CircuitState::Closed;
        self.recent_failures.clear();
        self.opened_at = None;
        self.half_open_in_flight = 0;
        self.last_transition = now;
    }

    /// Transition to Open state
    fn transition_to_open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.half_open_in_flight = 0;
        self.open_count += 1;
        self.last_transition = now;
    }

    /// Transition to HalfOpen state
    fn transition_to_half_open(&mut self, now: Instant) {
        self.state = CircuitState::HalfOpen;
        self.half_open_in_flight = 0;
        self.last_transition = now;
    }

    fn stats(&self) -> CircuitStats {
        CircuitStats {
            key: self.key.clone(),
            state: self.state,
            failure_count: self.recent_failures.len() as u32,
            half_open_in_flight: self.half_open_in_flight,
            total_calls: self.total_calls,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            rejected: self.rejected,
            open_count: self.open_count,
            time_in_state: self.last_transition.elapsed(),
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub key: BreakerKey,

    /// Current state
    pub state: CircuitState,

    /// Failures counted inside the current window
    pub failure_count: u32,

    pub half_open_in_flight: u32,

    pub total_calls: u64,

    pub total_successes: u64,

    pub total_failures: u64,

    pub rejected: u64,

    /// Number of times circuit has opened
    pub open_count: u64,

    /// Time since last state transition
    #[serde(with = "humantime_serde")]
    pub time_in_state: Duration,
}

type SharedCircuit = Arc<Mutex<Circuit>>;

fn lock(circuit: &SharedCircuit) -> MutexGuard<'_, Circuit> {
    circuit.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Admission to one call through a breaker.
///
/// Report the outcome with [`CircuitPermit::record_success`] or
/// [`CircuitPermit::record_failure`].
pub struct CircuitPermit {
    circuit: SharedCircuit,
    trial: bool,
    settled: bool,
}

impl CircuitPermit {
    /// Whether this call is a half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        lock(&self.circuit).record_success(self.trial, Instant::now());
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        lock(&self.circuit).record_failure(self.trial, Instant::now());
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            lock(&self.circuit).end_trial(true);
        }
    }
}

impl fmt::Debug for CircuitPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitPermit")
            .field("trial", &self.trial)
            .field("settled", &self.settled)
            .finish()
    }
}

/// Circuit breaker manager for all (endpoint, tool) pairs
pub struct CircuitBreaker {
    /// Per-key circuit breakers
    circuits: RwLock<HashMap<BreakerKey, SharedCircuit>>,

    /// Configuration
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a new circuit breaker manager
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    async fn circuit(&self, key: &BreakerKey) -> SharedCircuit {
        if let Some(circuit) = self.circuits.read().await.get(key) {
            return Arc::clone(circuit);
        }

        let mut circuits = self.circuits.write().await;
        Arc::clone(circuits.entry(key.clone()).or_insert_with(|| {
            debug!(key = %key, "Creating circuit breaker");
            Arc::new(Mutex::new(Circuit::new(key.clone(), self.config.clone())))
        }))
    }

    /// Ask to make one call, failing fast with `CircuitOpen` while the breaker is open
    pub async fn acquire(&self, key: &BreakerKey) -> Result<CircuitPermit, ResilienceError> {
        let circuit = self.circuit(key).await;
        let admitted = lock(&circuit).try_acquire(Instant::now());

        match admitted {
            Ok(trial) => Ok(CircuitPermit {
                circuit,
                trial,
                settled: false,
            }),
            Err(retry_in) => {
                debug!(key = %key, "Circuit breaker rejected call");
                Err(ResilienceError::CircuitOpen {
                    key: key.clone(),
                    retry_in,
                })
            }
        }
    }

    /// Get the current state of a circuit, `None` if it was never used
    pub async fn get_state(&self, key: &BreakerKey) -> Option<CircuitState> {
        let circuits = self.circuits.read().await;
        circuits.get(key).map(|c| lock(c).state)
    }

    /// Get statistics for one circuit
    pub async fn get_stats(&self, key: &BreakerKey) -> Option<CircuitStats> {
        let circuits = self.circuits.read().await;
        circuits.get(key).map(|c| lock(c).stats())
    }

    /// Get statistics for all circuits, ordered by key
    pub async fn get_all_stats(&self) -> Vec<CircuitStats> {
        let circuits = self.circuits.read().await;
        let mut stats: Vec<CircuitStats> = circuits.values().map(|c| lock(c).stats()).collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }

    /// Manually reset a circuit to closed state
    pub async fn reset_circuit(&self, key: &BreakerKey) -> bool {
        let circuits = self.circuits.read().await;
        match circuits.get(key) {
            Some(circuit) => {
                info!(key = %key, "Manually resetting circuit to Closed");
                lock(circuit).transition_to_closed(Instant::now());
                true
            }
            None => false,
        }
    }

    /// Reset every known circuit to closed, returning how many there were
    pub async fn reset_all(&self) -> usize {
        let circuits = self.circuits.read().await;
        let now = Instant::now();
        for circuit in circuits.values() {
            lock(circuit).transition_to_closed(now);
        }
        info!(circuits = circuits.len(), "Reset all circuits to Closed");
        circuits.len()
    }

    /// Drop every breaker for an endpoint
    pub async fn remove_endpoint(&self, endpoint_id: &str) -> usize {
        let mut circuits = self.circuits.write().await;
        let before = circuits.len();
        circuits.retain(|key, _| key.endpoint != endpoint_id);
        before - circuits.len()
    }

    /// Drop every breaker
    pub async fn clear(&self) {
        self.circuits.write().await.clear();
    }

    /// Check if a circuit is closed. Unused circuits count as closed.
    pub async fn is_closed(&self, key: &BreakerKey) -> bool {
        self.get_state(key)
            .await
            .map_or(true, |state| state == CircuitState::Closed)
    }
}
