//! Collaborator traits for talking to tool providers
//!
//! The runtime never speaks a wire protocol itself. A [`Transport`] opens
//! sessions and invokes tools over a pooled [`Connection`]; a [`HealthProbe`]
//! answers whether an endpoint is alive when there are no idle connections to
//! ping.

use async_trait::async_trait;

use crate::context::CallContext;
use crate::error::TransportError;
use crate::lb::Endpoint;
use crate::pool::Connection;
use crate::types::{RawResult, ToolExecutionRequest};

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish the session behind a freshly created connection
    async fn connect(&self, ctx: &CallContext, connection: &Connection) -> Result<(), TransportError>;

    /// Run one tool invocation over an established connection
    async fn invoke(
        &self,
        ctx: &CallContext,
        connection: &Connection,
        request: &ToolExecutionRequest,
    ) -> Result<RawResult, TransportError>;

    /// Cheap liveness check on an idle connection
    async fn ping(&self, ctx: &CallContext, connection: &Connection) -> Result<(), TransportError> {
        let _ = (ctx, connection);
        Ok(())
    }

    /// Release whatever the transport holds for this connection
    fn close(&self, connection: &Connection) {
        let _ = connection;
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn check(&self, ctx: &CallContext, endpoint: &Endpoint) -> Result<(), TransportError>;
}

/// Probe that reports every endpoint as reachable
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProbe;

#[async_trait]
impl HealthProbe for NoopProbe {
    async fn check(&self, _ctx: &CallContext, _endpoint: &Endpoint) -> Result<(), TransportError> {
        Ok(())
    }
}
