//! Retry policies and backoff strategies

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::ConfigError;
use crate::error::{ErrorKind, TransportError};

/// How the delay between attempts grows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always `base_delay`
    Fixed,
    /// `base_delay * attempt`
    Linear,
    /// `base_delay * 2^(attempt - 1)`
    #[default]
    Exponential,
}

impl BackoffStrategy {
    pub const NAMES: &'static str = "fixed, linear, exponential";

    pub fn name(&self) -> &'static str {
        match self {
            BackoffStrategy::Fixed => "fixed",
            BackoffStrategy::Linear => "linear",
            BackoffStrategy::Exponential => "exponential",
        }
    }
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackoffStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fixed" => Ok(BackoffStrategy::Fixed),
            "linear" => Ok(BackoffStrategy::Linear),
            "exponential" => Ok(BackoffStrategy::Exponential),
            _ => Err(ConfigError::UnknownVariant {
                kind: "retry strategy",
                value: s.to_string(),
                expected: Self::NAMES,
            }),
        }
    }
}

/// Retry behaviour for one class of calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,

    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Ceiling for any computed delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Transport invocations per call, the first one included
    pub max_attempts: u32,

    /// Randomize each delay uniformly in [0, delay]
    pub jitter_enabled: bool,

    /// Scales the delay after a throttled response
    pub throttle_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            jitter_enabled: true,
            throttle_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Un-jittered delay after `attempt` (1-based) failed, capped at `max_delay`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Delay to wait after `attempt` failed with `error`
    pub fn delay_for(&self, attempt: u32, error: &TransportError) -> Duration {
        let throttled = error.kind() == ErrorKind::Throttled;

        let mut delay = self.backoff(attempt);
        if throttled && self.throttle_multiplier > 1.0 {
            let scaled = delay.as_secs_f64() * self.throttle_multiplier;
            delay = Duration::try_from_secs_f64(scaled).map_or(self.max_delay, |d| d.min(self.max_delay));
        }
        if self.jitter_enabled {
            delay = delay.mul_f64(rand::thread_rng().gen::<f64>());
        }

        match error.retry_after() {
            Some(hint) if throttled => delay.max(hint),
            _ => delay,
        }
    }

    /// Whether a call that just failed its `attempt` with `kind` gets another attempt
    pub fn should_retry(&self, attempt: u32, kind: ErrorKind) -> bool {
        kind.is_retryable() && attempt < self.max_attempts
    }
}

/// Default retry policy plus per-tool and per-server overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(flatten)]
    pub policy: RetryPolicy,

    /// Keyed by tool name
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub tool_policies: HashMap<String, RetryPolicy>,

    /// Keyed by server (capability) name
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub server_policies: HashMap<String, RetryPolicy>,
}

impl RetryConfig {
    /// Tool overrides beat server overrides, which beat the default
    pub fn policy_for(&self, server: &str, tool: &str) -> &RetryPolicy {
        self.tool_policies
            .get(tool)
            .or_else(|| self.server_policies.get(server))
            .unwrap_or(&self.policy)
    }

    /// Every policy this config can hand out
    pub fn policies(&self) -> impl Iterator<Item = (String, &RetryPolicy)> {
        std::iter::once(("retry".to_string(), &self.policy))
            .chain(
                self.tool_policies
                    .iter()
                    .map(|(name, p)| (format!("retry.tool_policies.{name}"), p)),
            )
            .chain(
                self.server_policies
                    .iter()
                    .map(|(name, p)| (format!("retry.server_policies.{name}"), p)),
            )
    }
}
