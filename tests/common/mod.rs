//! Shared test doubles for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use toolpool::lb::Endpoint;
use toolpool::pool::Connection;
use toolpool::retry::{BackoffStrategy, RetryPolicy};
use toolpool::{
    CallContext, Coordinator, EndpointSpec, HealthProbe, RawResult, ResilienceConfig, ToolExecutionRequest,
    Transport, TransportError,
};

pub type Step = Result<RawResult, TransportError>;

/// In-memory transport that replays scripted outcomes.
///
/// Without a script or default it echoes the request back, tagged with the
/// endpoint that served it.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    default: Mutex<Option<Step>>,
    delay: Mutex<Duration>,
    fail_connect: AtomicBool,
    served: Mutex<Vec<String>>,
    pub invocations: AtomicUsize,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue one outcome ahead of the default
    pub fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn set_default(&self, step: Step) {
        *self.default.lock().unwrap() = Some(step);
    }

    /// Go back to echoing requests
    pub fn clear_default(&self) {
        *self.default.lock().unwrap() = None;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Endpoint ids in invocation order
    pub fn served(&self) -> Vec<String> {
        self.served.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, _ctx: &CallContext, _connection: &Connection) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            Err(TransportError::Network("connection refused".into()))
        } else {
            Ok(())
        }
    }

    async fn invoke(
        &self,
        _ctx: &CallContext,
        connection: &Connection,
        request: &ToolExecutionRequest,
    ) -> Result<RawResult, TransportError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.served.lock().unwrap().push(connection.endpoint_id().to_string());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        if let Some(step) = scripted {
            return step;
        }
        if let Some(step) = self.default.lock().unwrap().clone() {
            return step;
        }

        Ok(RawResult::new(json!({
            "tool": request.tool,
            "arguments": request.arguments,
            "endpoint": connection.endpoint_id(),
        })))
    }

    async fn ping(&self, _ctx: &CallContext, _connection: &Connection) -> Result<(), TransportError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            Err(TransportError::Network("connection reset".into()))
        } else {
            Ok(())
        }
    }

    fn close(&self, _connection: &Connection) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Probe with a switchable verdict
#[derive(Default)]
pub struct SwitchProbe {
    pub down: AtomicBool,
    pub checks: AtomicUsize,
}

#[async_trait]
impl HealthProbe for SwitchProbe {
    async fn check(&self, _ctx: &CallContext, _endpoint: &Endpoint) -> Result<(), TransportError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            Err(TransportError::Network("no route to host".into()))
        } else {
            Ok(())
        }
    }
}

/// Quiet, fast configuration: no background health checks, no jitter, short delays
pub fn test_config() -> ResilienceConfig {
    let mut config = ResilienceConfig::default();
    config.pool.min_connections = 0;
    config.pool.max_connections = 4;
    config.health.enabled = false;
    config.retry.policy = RetryPolicy {
        strategy: BackoffStrategy::Exponential,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        max_attempts: 3,
        jitter_enabled: false,
        throttle_multiplier: 2.0,
    };
    config
}

pub async fn coordinator(
    config: ResilienceConfig,
    transport: Arc<ScriptedTransport>,
    endpoints: &[(&str, &str)],
) -> Coordinator {
    let coordinator = Coordinator::configure(config, transport, Arc::new(SwitchProbe::default()))
        .await
        .unwrap();
    for (capability, id) in endpoints {
        coordinator
            .register_endpoint(capability, EndpointSpec::new(*id, format!("tcp://{id}:7000")), 1)
            .await
            .unwrap();
    }
    coordinator
}

pub fn request(server: &str, tool: &str, n: u64) -> ToolExecutionRequest {
    ToolExecutionRequest::new(server, tool).with_argument("n", n)
}

/// Let spawned tasks run until `condition` holds
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
