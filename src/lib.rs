//! toolpool - resilience and caching runtime for remote tool execution
//!
//! A [`Coordinator`] sits between callers issuing tool calls and the transport
//! that talks to provider processes. It layers a result cache, a load balancer
//! over provider endpoints, per-endpoint connection pools with health
//! monitoring, a retry engine and per (endpoint, tool) circuit breakers.
//!
//! ```no_run
//! use std::sync::Arc;
//! use toolpool::{CallContext, Coordinator, EndpointSpec, NoopProbe, ResilienceConfig, ToolExecutionRequest};
//! # async fn run(transport: Arc<dyn toolpool::Transport>) -> Result<(), toolpool::ResilienceError> {
//! let coordinator = Coordinator::configure(ResilienceConfig::default(), transport, Arc::new(NoopProbe)).await?;
//! coordinator
//!     .register_endpoint("web-search", EndpointSpec::new("search-1", "tcp://10.0.0.1:7000"), 1)
//!     .await?;
//!
//! let request = ToolExecutionRequest::new("web-search", "query").with_argument("q", "rust");
//! let result = coordinator.execute_with_resilience(&CallContext::new(), &request).await?;
//! println!("{} (cache hit: {})", result.content, result.cache_hit);
//!
//! coordinator.shutdown(&CallContext::new()).await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod lb;
pub mod pool;
pub mod retry;
pub mod transport;
pub mod types;

pub use config::{ConfigError, ResilienceConfig};
pub use context::{CallContext, ContextError};
pub use coordinator::{Coordinator, ResilienceStats};
pub use error::{ErrorKind, ResilienceError, TransportError};
pub use lb::{Algorithm, EndpointSpec, TransportKind};
pub use transport::{HealthProbe, NoopProbe, Transport};
pub use types::{RawResult, ToolExecutionRequest, ToolExecutionResult};
