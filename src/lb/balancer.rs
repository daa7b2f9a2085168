//! Load balancing strategies over reachable endpoints

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use super::endpoint::Endpoint;
use super::registry::EndpointRegistry;
use crate::config::ConfigError;
use crate::context::CallContext;
use crate::error::ResilienceError;

/// Load balancing algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Simple round-robin distribution
    #[default]
    RoundRobin,
    /// Pick the endpoint with the fewest leased connections
    LeastConnections,
    /// Pick the highest health score, round-robin among ties
    HealthBased,
    /// Pick the lowest average latency, unmeasured endpoints first
    ResponseTimeBased,
    /// Round-robin over a cumulative weight range
    WeightedRoundRobin,
    /// Uniform random choice
    Random,
}

impl Algorithm {
    pub const NAMES: &'static str =
        "round_robin, least_connections, health_based, response_time_based, weighted_round_robin, random";

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::LeastConnections => "least_connections",
            Algorithm::HealthBased => "health_based",
            Algorithm::ResponseTimeBased => "response_time_based",
            Algorithm::WeightedRoundRobin => "weighted_round_robin",
            Algorithm::Random => "random",
        }
    }

    fn strategy(&self) -> &'static dyn SelectionStrategy {
        match self {
            Algorithm::RoundRobin => &RoundRobin,
            Algorithm::LeastConnections => &LeastConnections,
            Algorithm::HealthBased => &HealthBased,
            Algorithm::ResponseTimeBased => &ResponseTimeBased,
            Algorithm::WeightedRoundRobin => &WeightedRoundRobin,
            Algorithm::Random => &Random,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(Algorithm::RoundRobin),
            "least_connections" => Ok(Algorithm::LeastConnections),
            "health_based" => Ok(Algorithm::HealthBased),
            "response_time_based" => Ok(Algorithm::ResponseTimeBased),
            "weighted_round_robin" => Ok(Algorithm::WeightedRoundRobin),
            "random" => Ok(Algorithm::Random),
            _ => Err(ConfigError::UnknownVariant {
                kind: "load balancing strategy",
                value: s.to_string(),
                expected: Self::NAMES,
            }),
        }
    }
}

/// Picks an index into a non-empty slice of reachable endpoints
trait SelectionStrategy: Send + Sync {
    fn pick(&self, candidates: &[Arc<Endpoint>], cursor: &AtomicUsize) -> usize;
}

fn next_slot(cursor: &AtomicUsize, modulus: usize) -> usize {
    cursor.fetch_add(1, Ordering::Relaxed) % modulus
}

struct RoundRobin;

impl SelectionStrategy for RoundRobin {
    fn pick(&self, candidates: &[Arc<Endpoint>], cursor: &AtomicUsize) -> usize {
        next_slot(cursor, candidates.len())
    }
}

struct LeastConnections;

impl SelectionStrategy for LeastConnections {
    fn pick(&self, candidates: &[Arc<Endpoint>], _cursor: &AtomicUsize) -> usize {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.active_connections())
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    }
}

struct HealthBased;

impl SelectionStrategy for HealthBased {
    fn pick(&self, candidates: &[Arc<Endpoint>], cursor: &AtomicUsize) -> usize {
        let best = candidates
            .iter()
            .map(|e| e.health_score())
            .fold(f64::MIN, f64::max);
        let tied: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, e)| (best - e.health_score()).abs() < 1e-9)
            .map(|(idx, _)| idx)
            .collect();
        if tied.is_empty() {
            return 0;
        }
        tied[next_slot(cursor, tied.len())]
    }
}

struct ResponseTimeBased;

impl SelectionStrategy for ResponseTimeBased {
    fn pick(&self, candidates: &[Arc<Endpoint>], _cursor: &AtomicUsize) -> usize {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.latency().unwrap_or(Duration::ZERO))
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    }
}

struct WeightedRoundRobin;

impl SelectionStrategy for WeightedRoundRobin {
    fn pick(&self, candidates: &[Arc<Endpoint>], cursor: &AtomicUsize) -> usize {
        let total: u64 = candidates.iter().map(|e| u64::from(e.weight())).sum();
        if total == 0 {
            return next_slot(cursor, candidates.len());
        }

        let target = cursor.fetch_add(1, Ordering::Relaxed) as u64 % total;
        let mut cumulative = 0u64;
        for (idx, endpoint) in candidates.iter().enumerate() {
            cumulative += u64::from(endpoint.weight());
            if target < cumulative {
                return idx;
            }
        }
        candidates.len() - 1
    }
}

struct Random;

impl SelectionStrategy for Random {
    fn pick(&self, candidates: &[Arc<Endpoint>], _cursor: &AtomicUsize) -> usize {
        rand::thread_rng().gen_range(0..candidates.len())
    }
}

/// Load balancer choosing among the reachable endpoints of a capability
pub struct LoadBalancer {
    registry: Arc<EndpointRegistry>,
    algorithm: Algorithm,
    /// Per-capability rotation counters
    cursors: Mutex<HashMap<String, Arc<AtomicUsize>>>,
}

impl LoadBalancer {
    pub fn new(registry: Arc<EndpointRegistry>, algorithm: Algorithm) -> Self {
        Self {
            registry,
            algorithm,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    fn cursor(&self, capability: &str) -> Arc<AtomicUsize> {
        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(cursors.entry(capability.to_string()).or_default())
    }

    /// Select an endpoint for `capability`, never returning an unreachable one
    pub fn select(&self, ctx: &CallContext, capability: &str) -> Result<Arc<Endpoint>, ResilienceError> {
        ctx.check()?;

        let candidates: Vec<Arc<Endpoint>> = self
            .registry
            .endpoints(capability)
            .into_iter()
            .filter(|e| e.is_reachable())
            .collect();

        if candidates.is_empty() {
            warn!(capability = %capability, "No reachable endpoints");
            return Err(ResilienceError::NoHealthyEndpoints {
                capability: capability.to_string(),
            });
        }

        let cursor = self.cursor(capability);
        let index = self.algorithm.strategy().pick(&candidates, &cursor);
        let endpoint = candidates
            .get(index)
            .cloned()
            .ok_or_else(|| ResilienceError::NoHealthyEndpoints {
                capability: capability.to_string(),
            })?;

        debug!(
            capability = %capability,
            endpoint_id = %endpoint.id(),
            algorithm = %self.algorithm,
            candidates = candidates.len(),
            "Selected endpoint"
        );

        Ok(endpoint)
    }
}
