use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::lb::{Algorithm, EndpointSpec};
use crate::pool::{CircuitBreakerConfig, HealthCheckConfig, PoolConfig};
use crate::retry::{RetryConfig, RetryPolicy};

/// Prefix shared by every environment variable the runtime reads
pub const ENV_PREFIX: &str = "TOOLPOOL_";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("unknown {kind} {value:?}, expected one of: {expected}")]
    UnknownVariant {
        kind: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("environment variable {var}: {reason}")]
    Env { var: String, reason: String },

    #[error("a tokio runtime is required to start background tasks")]
    NoRuntime,
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

/// Load balancer settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub strategy: Algorithm,
}

/// An endpoint registered when the coordinator is configured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(flatten)]
    pub spec: EndpointSpec,

    /// Share for weighted round-robin
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub pool: PoolConfig,
    pub health: HealthCheckConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub load_balancer: LoadBalancerConfig,
    pub cache: CacheConfig,

    /// Endpoints to register up front, keyed by capability
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub endpoints: BTreeMap<String, Vec<EndpointConfig>>,
}

impl ResilienceConfig {
    /// Reject settings the runtime cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pool = &self.pool;
        if pool.max_connections == 0 {
            return Err(invalid("pool.max_connections", "must be at least 1"));
        }
        if pool.min_connections > pool.max_connections {
            return Err(invalid(
                "pool.min_connections",
                format!(
                    "{} exceeds max_connections {}",
                    pool.min_connections, pool.max_connections
                ),
            ));
        }
        non_zero("pool.max_idle_time", pool.max_idle_time)?;
        non_zero("pool.max_connection_age", pool.max_connection_age)?;
        non_zero("pool.acquire_timeout", pool.acquire_timeout)?;
        non_zero("pool.connect_timeout", pool.connect_timeout)?;

        let health = &self.health;
        if health.enabled {
            non_zero("health.interval", health.interval)?;
            non_zero("health.timeout", health.timeout)?;
            if health.unhealthy_threshold == 0 {
                return Err(invalid("health.unhealthy_threshold", "must be at least 1"));
            }
        }
        non_zero("health.reconnect_backoff_base", health.reconnect_backoff_base)?;
        if health.reconnect_backoff_base > health.reconnect_backoff_max {
            return Err(invalid(
                "health.reconnect_backoff_base",
                "exceeds reconnect_backoff_max",
            ));
        }

        for (field, policy) in self.retry.policies() {
            validate_policy(&field, policy)?;
        }

        let breaker = &self.circuit_breaker;
        if breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold", "must be at least 1"));
        }
        if breaker.half_open_max_calls == 0 {
            return Err(invalid("circuit_breaker.half_open_max_calls", "must be at least 1"));
        }
        non_zero("circuit_breaker.recovery_timeout", breaker.recovery_timeout)?;
        non_zero("circuit_breaker.failure_window", breaker.failure_window)?;

        let cache = &self.cache;
        if cache.enabled {
            if cache.max_keys == 0 {
                return Err(invalid("cache.max_keys", "must be at least 1"));
            }
            if cache.max_size_bytes == 0 {
                return Err(invalid("cache.max_size_bytes", "must be at least 1"));
            }
            non_zero("cache.cleanup_interval", cache.cleanup_interval)?;
        }

        for (capability, endpoints) in &self.endpoints {
            for endpoint in endpoints {
                if endpoint.spec.id.trim().is_empty() {
                    return Err(invalid(format!("endpoints.{capability}"), "endpoint id is empty"));
                }
                if endpoint.weight == 0 {
                    return Err(invalid(
                        format!("endpoints.{capability}.{}", endpoint.spec.id),
                        "weight must be at least 1",
                    ));
                }
            }
        }

        Ok(())
    }

    /// Override settings from `TOOLPOOL_*` values supplied by `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };

        env.parsed("MIN_CONNECTIONS", &mut self.pool.min_connections)?;
        env.parsed("MAX_CONNECTIONS", &mut self.pool.max_connections)?;
        env.duration("MAX_IDLE_TIME", &mut self.pool.max_idle_time)?;
        env.duration("MAX_CONNECTION_AGE", &mut self.pool.max_connection_age)?;
        env.duration("ACQUIRE_TIMEOUT", &mut self.pool.acquire_timeout)?;
        env.duration("CONNECT_TIMEOUT", &mut self.pool.connect_timeout)?;

        env.parsed("HEALTH_CHECK_ENABLED", &mut self.health.enabled)?;
        env.duration("HEALTH_CHECK_INTERVAL", &mut self.health.interval)?;
        env.duration("HEALTH_CHECK_TIMEOUT", &mut self.health.timeout)?;
        env.parsed("UNHEALTHY_THRESHOLD", &mut self.health.unhealthy_threshold)?;
        env.duration("RECONNECT_BACKOFF_BASE", &mut self.health.reconnect_backoff_base)?;
        env.duration("RECONNECT_BACKOFF_MAX", &mut self.health.reconnect_backoff_max)?;
        env.parsed("MAX_RECONNECT_ATTEMPTS", &mut self.health.max_reconnect_attempts)?;

        let retry = &mut self.retry.policy;
        env.parsed("RETRY_STRATEGY", &mut retry.strategy)?;
        env.duration("RETRY_BASE_DELAY", &mut retry.base_delay)?;
        env.duration("RETRY_MAX_DELAY", &mut retry.max_delay)?;
        env.parsed("RETRY_MAX_ATTEMPTS", &mut retry.max_attempts)?;
        env.parsed("JITTER_ENABLED", &mut retry.jitter_enabled)?;

        env.parsed("CIRCUIT_FAILURE_THRESHOLD", &mut self.circuit_breaker.failure_threshold)?;
        env.duration("CIRCUIT_RECOVERY_TIMEOUT", &mut self.circuit_breaker.recovery_timeout)?;
        env.parsed("CIRCUIT_HALF_OPEN_MAX_CALLS", &mut self.circuit_breaker.half_open_max_calls)?;

        env.parsed("LB_STRATEGY", &mut self.load_balancer.strategy)?;

        env.parsed("CACHE_ENABLED", &mut self.cache.enabled)?;
        env.duration("CACHE_DEFAULT_TTL", &mut self.cache.default_ttl)?;
        env.parsed("CACHE_MAX_KEYS", &mut self.cache.max_keys)?;
        env.parsed("CACHE_MAX_SIZE_BYTES", &mut self.cache.max_size_bytes)?;
        env.parsed("CACHE_EVICTION_POLICY", &mut self.cache.eviction_policy)?;

        if let Some(raw) = env.get("ENDPOINTS") {
            self.endpoints = parse_endpoints(&raw)?;
        }

        Ok(())
    }
}

fn non_zero(field: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        Err(invalid(field, "must be greater than zero"))
    } else {
        Ok(())
    }
}

fn validate_policy(field: &str, policy: &RetryPolicy) -> Result<(), ConfigError> {
    if policy.max_attempts == 0 {
        return Err(invalid(format!("{field}.max_attempts"), "must be at least 1"));
    }
    if policy.base_delay > policy.max_delay {
        return Err(invalid(format!("{field}.base_delay"), "exceeds max_delay"));
    }
    if !policy.throttle_multiplier.is_finite() || policy.throttle_multiplier < 1.0 {
        return Err(invalid(
            format!("{field}.throttle_multiplier"),
            "must be a finite number of at least 1.0",
        ));
    }
    Ok(())
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{name}"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parsed<T>(&self, name: &str, target: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        if let Some(raw) = self.get(name) {
            *target = raw.parse().map_err(|e: T::Err| ConfigError::Env {
                var: format!("{ENV_PREFIX}{name}"),
                reason: format!("{raw:?}: {e}"),
            })?;
        }
        Ok(())
    }

    fn duration(&self, name: &str, target: &mut Duration) -> Result<(), ConfigError> {
        if let Some(raw) = self.get(name) {
            *target = humantime::parse_duration(&raw).map_err(|e| ConfigError::Env {
                var: format!("{ENV_PREFIX}{name}"),
                reason: format!("{raw:?}: {e}"),
            })?;
        }
        Ok(())
    }
}

/// Parse `capability=address` pairs separated by commas. The address doubles as the endpoint id.
fn parse_endpoints(raw: &str) -> Result<BTreeMap<String, Vec<EndpointConfig>>, ConfigError> {
    let mut endpoints: BTreeMap<String, Vec<EndpointConfig>> = BTreeMap::new();

    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (capability, address) = entry
            .split_once('=')
            .map(|(c, a)| (c.trim(), a.trim()))
            .filter(|(c, a)| !c.is_empty() && !a.is_empty())
            .ok_or_else(|| ConfigError::Env {
                var: format!("{ENV_PREFIX}ENDPOINTS"),
                reason: format!("{entry:?} is not of the form capability=address"),
            })?;

        endpoints
            .entry(capability.to_string())
            .or_default()
            .push(EndpointConfig {
                spec: EndpointSpec::new(address, address),
                weight: default_weight(),
            });
    }

    Ok(endpoints)
}

/// Load and validate configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<ResilienceConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: ResilienceConfig =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Load configuration from defaults overridden by environment variables
///
/// Reads a `.env` file first if one exists. Recognised variables are the
/// option names upper-cased with a `TOOLPOOL_` prefix, for example
/// `TOOLPOOL_MAX_CONNECTIONS=20`, `TOOLPOOL_RETRY_BASE_DELAY=500ms` or
/// `TOOLPOOL_LB_STRATEGY=least_connections`. `TOOLPOOL_ENDPOINTS` takes
/// `capability=address` pairs separated by commas.
pub fn load_from_env() -> Result<ResilienceConfig> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let mut config = ResilienceConfig::default();
    config
        .apply_env(|name| std::env::var(name).ok())
        .context("Failed to read configuration from environment")?;

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Load configuration from a YAML file if given, otherwise from the environment
pub fn load_config(config_path: Option<&Path>) -> Result<ResilienceConfig> {
    match config_path {
        Some(path) => load_from_yaml(path),
        None => load_from_env(),
    }
}
