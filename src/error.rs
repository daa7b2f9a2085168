//! Error taxonomy shared by every component
//!
//! Two layers:
//! - [`TransportError`]: what a provider call can fail with, as reported by a [`crate::Transport`]
//! - [`ResilienceError`]: what the runtime surfaces to callers
//!
//! Both map onto a closed [`ErrorKind`] that drives retry decisions.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::context::ContextError;
use crate::lb::EndpointId;
use crate::pool::BreakerKey;

/// Closed set of error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    Throttled,
    NonRetryable,
    PoolExhausted,
    CircuitOpen,
    NoHealthyEndpoints,
    Cache,
    Cancelled,
    /// The caller's own deadline ran out; says nothing about the endpoint
    DeadlineExceeded,
    ShuttingDown,
    UnknownEndpoint,
    Config,
}

impl ErrorKind {
    /// Only transient provider failures are worth another attempt
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Throttled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Throttled => "throttled",
            ErrorKind::NonRetryable => "non_retryable",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::NoHealthyEndpoints => "no_healthy_endpoints",
            ErrorKind::Cache => "cache",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::ShuttingDown => "shutting_down",
            ErrorKind::UnknownEndpoint => "unknown_endpoint",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a transport or health probe
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    /// The connection itself is no longer usable
    #[error("connection broken: {0}")]
    ConnectionBroken(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("throttled by provider: {message}")]
    Throttled {
        message: String,
        /// Provider-supplied hint for when to try again
        retry_after: Option<Duration>,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unclassified failure, categorised by message
    #[error("{0}")]
    Other(String),
}

const NETWORK_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "broken pipe",
    "network unreachable",
    "no route to host",
    "dial tcp",
    "i/o timeout",
];

const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out", "deadline exceeded"];

const THROTTLE_PATTERNS: &[&str] = &[
    "rate limit",
    "throttled",
    "too many requests",
    "quota exceeded",
    "rate exceeded",
];

const NON_RETRYABLE_PATTERNS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "permission denied",
    "invalid argument",
    "validation failed",
    "not found",
];

fn matches_any(message: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|pattern| message.contains(pattern))
}

/// Categorise a free-form error message. Anything unrecognised is treated as a
/// network failure so it stays retryable.
pub fn classify_message(message: &str) -> ErrorKind {
    let message = message.to_lowercase();
    if matches_any(&message, NETWORK_PATTERNS) {
        ErrorKind::Network
    } else if matches_any(&message, TIMEOUT_PATTERNS) {
        ErrorKind::Timeout
    } else if matches_any(&message, THROTTLE_PATTERNS) {
        ErrorKind::Throttled
    } else if matches_any(&message, NON_RETRYABLE_PATTERNS) {
        ErrorKind::NonRetryable
    } else {
        ErrorKind::Network
    }
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Network(_) | TransportError::ConnectionBroken(_) => ErrorKind::Network,
            TransportError::Timeout(_) => ErrorKind::Timeout,
            TransportError::Throttled { .. } => ErrorKind::Throttled,
            TransportError::Unauthorized(_) | TransportError::InvalidRequest(_) => {
                ErrorKind::NonRetryable
            }
            TransportError::Other(message) => classify_message(message),
        }
    }

    /// Whether the connection that produced this error must be discarded
    pub fn breaks_connection(&self) -> bool {
        match self {
            TransportError::Network(_) | TransportError::ConnectionBroken(_) => true,
            TransportError::Other(message) => {
                matches_any(&message.to_lowercase(), NETWORK_PATTERNS)
            }
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::Throttled { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Errors surfaced by the resilience runtime
#[derive(Debug, thiserror::Error)]
pub enum ResilienceError {
    #[error("tool call failed after {attempts} attempt(s): {source}")]
    Transport {
        #[source]
        source: TransportError,
        attempts: u32,
    },

    #[error("no connection available for endpoint {endpoint} within the wait budget")]
    PoolExhausted { endpoint: EndpointId },

    #[error("circuit open for {key}")]
    CircuitOpen {
        key: BreakerKey,
        /// Time left before a probe call will be admitted
        retry_in: Option<Duration>,
    },

    #[error("no healthy endpoints for capability {capability}")]
    NoHealthyEndpoints { capability: String },

    #[error("endpoint {0} is not registered")]
    UnknownEndpoint(EndpointId),

    #[error("endpoint {endpoint} is already registered for capability {capability}")]
    DuplicateEndpoint {
        endpoint: EndpointId,
        capability: String,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("coordinator is shutting down")]
    ShuttingDown,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl ResilienceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResilienceError::Transport { source, .. } => source.kind(),
            ResilienceError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            ResilienceError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            ResilienceError::NoHealthyEndpoints { .. } => ErrorKind::NoHealthyEndpoints,
            ResilienceError::UnknownEndpoint(_) => ErrorKind::UnknownEndpoint,
            ResilienceError::DuplicateEndpoint { .. } => ErrorKind::Config,
            ResilienceError::Cache(_) => ErrorKind::Cache,
            ResilienceError::Cancelled => ErrorKind::Cancelled,
            ResilienceError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            ResilienceError::ShuttingDown => ErrorKind::ShuttingDown,
            ResilienceError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether the connection used for the failed call must be invalidated.
    /// An abandoned in-flight call leaves the connection in an unknown state.
    pub fn breaks_connection(&self) -> bool {
        match self {
            ResilienceError::Transport { source, .. } => source.breaks_connection(),
            ResilienceError::Cancelled | ResilienceError::DeadlineExceeded => true,
            _ => false,
        }
    }

    /// Number of transport attempts behind this error, when known
    pub fn attempts(&self) -> Option<u32> {
        match self {
            ResilienceError::Transport { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

impl From<ContextError> for ResilienceError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => ResilienceError::Cancelled,
            ContextError::DeadlineExceeded => ResilienceError::DeadlineExceeded,
        }
    }
}
