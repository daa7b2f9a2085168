//! Endpoint registry and load balancing
//!
//! # Components
//!
//! - [`Endpoint`]: one provider instance with health score, latency and connection tracking
//! - [`EndpointRegistry`]: capability name to endpoints, mutable at runtime
//! - [`LoadBalancer`]: picks a reachable endpoint for a capability
//!
//! # Load Balancing Algorithms
//!
//! - **Round-robin**: per-capability rotation over reachable endpoints
//! - **Least-connections**: fewest leased connections
//! - **Health-based**: highest health score, ties rotate
//! - **Response-time-based**: lowest moving-average latency
//! - **Weighted round-robin**: rotation over cumulative weights
//! - **Random**: uniform choice
//!
//! Every algorithm only ever sees endpoints that are not `Unreachable`.
//!
//! # Health Score
//!
//! Scores live in [0, 1]. A success moves the score a tenth of the way back to 1,
//! a failure multiplies it by 0.8. Below 0.5 an endpoint reports `Degraded`;
//! below 0.1, or when the health monitor gives up on it, it is `Unreachable`.
//!
//! # Thread Safety
//!
//! Endpoints use atomics for counters and scores and are shared as `Arc<Endpoint>`.
//! Deregistering an endpoint does not invalidate handles held by in-flight calls.

pub mod balancer;
pub mod endpoint;
pub mod registry;

pub use balancer::{Algorithm, LoadBalancer};
pub use endpoint::{
    Endpoint, EndpointId, EndpointSpec, EndpointState, EndpointStats, TransportKind,
    DEGRADED_SCORE, UNREACHABLE_SCORE,
};
pub use registry::EndpointRegistry;
