//! Connection pooling, health monitoring and circuit breaking
//!
//! This module provides:
//! - Bounded per-endpoint connection pools with lease guards
//! - A background health monitor that flags unreachable endpoints and reconnects them
//! - Per (endpoint, tool) circuit breakers

pub mod circuit;
pub mod connection;
pub mod health;

pub use circuit::{BreakerKey, CircuitBreaker, CircuitBreakerConfig, CircuitPermit, CircuitState, CircuitStats};
pub use connection::{
    Connection, ConnectionId, ConnectionPool, ConnectionState, PoolConfig, PoolSnapshot, PoolStats,
    PooledConnection,
};
pub use health::{EndpointCheck, HealthCheckConfig, HealthMonitor};
