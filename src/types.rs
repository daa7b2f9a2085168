//! Request and result types exchanged with callers and transports

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::lb::EndpointId;

/// A tool call addressed to a logical server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionRequest {
    /// Logical server name, used as the load-balancing capability
    pub server: String,

    pub tool: String,

    #[serde(default)]
    pub arguments: Map<String, Value>,

    /// Per-call budget, tightened against the caller's context deadline
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl ToolExecutionRequest {
    pub fn new(server: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            tool: tool.into(),
            arguments: Map::new(),
            timeout: None,
        }
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    pub fn with_arguments(mut self, arguments: Map<String, Value>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What a transport returns for a single invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResult {
    pub content: Value,

    /// Tool-level error reported by the provider. Never cached.
    #[serde(default)]
    pub is_error: bool,
}

impl RawResult {
    pub fn new(content: impl Into<Value>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<Value>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Outcome of a resilient tool call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolExecutionResult {
    pub server: String,
    pub tool: String,

    /// Endpoint that served the call, `None` for cache hits
    pub endpoint: Option<EndpointId>,

    pub content: Value,
    pub is_error: bool,

    /// Wall time spent inside the runtime for this call
    #[serde(with = "humantime_serde")]
    pub duration: Duration,

    pub cache_hit: bool,

    /// Transport attempts made, zero for cache hits
    pub attempts: u32,
}

impl ToolExecutionResult {
    pub(crate) fn from_cache(request: &ToolExecutionRequest, raw: RawResult, duration: Duration) -> Self {
        Self {
            server: request.server.clone(),
            tool: request.tool.clone(),
            endpoint: None,
            content: raw.content,
            is_error: raw.is_error,
            duration,
            cache_hit: true,
            attempts: 0,
        }
    }

    pub(crate) fn from_call(
        request: &ToolExecutionRequest,
        endpoint: EndpointId,
        raw: RawResult,
        duration: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            server: request.server.clone(),
            tool: request.tool.clone(),
            endpoint: Some(endpoint),
            content: raw.content,
            is_error: raw.is_error,
            duration,
            cache_hit: false,
            attempts,
        }
    }
}
