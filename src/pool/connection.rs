//! Per-endpoint connection pooling
//!
//! This module provides bounded connection pools keyed by endpoint with:
//! - Reuse of idle connections, newest first
//! - Age and idle-time retirement checked whenever a connection is touched
//! - Waiting for a free slot, bounded by the caller's deadline or `acquire_timeout`
//! - Lease guards that return or discard connections exactly once
//! - Generation-based flushing when an endpoint goes unreachable

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::{CallContext, ContextError};
use crate::error::{ResilienceError, TransportError};
use crate::lb::{Endpoint, EndpointId, TransportKind};
use crate::transport::Transport;

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Active,
    Reconnecting,
    Closed,
}

/// A session to one endpoint, owned by the pool and lent out through [`PooledConnection`]
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    endpoint_id: EndpointId,
    address: String,
    transport: TransportKind,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
    state: ConnectionState,
    /// Pool generation at creation; stale generations are never reused
    generation: u64,
}

impl Connection {
    fn new(endpoint: &Endpoint, generation: u64, state: ConnectionState) -> Self {
        let now = Instant::now();
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            endpoint_id: endpoint.id().to_string(),
            address: endpoint.address().to_string(),
            transport: endpoint.transport(),
            created_at: now,
            last_used: now,
            use_count: 0,
            state,
            generation,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Mark connection as used
    fn mark_used(&mut self, now: Instant) {
        self.state = ConnectionState::Active;
        self.last_used = now;
        self.use_count += 1;
    }

    fn retire_reason(&self, config: &PoolConfig, now: Instant) -> Option<&'static str> {
        if now.duration_since(self.created_at) >= config.max_connection_age {
            Some("max age reached")
        } else if self.state == ConnectionState::Idle
            && now.duration_since(self.last_used) >= config.max_idle_time
        {
            Some("idle too long")
        } else {
            None
        }
    }
}

/// Configuration for connection pool behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections the health monitor keeps warm per endpoint
    pub min_connections: usize,

    /// Hard cap on idle plus leased connections per endpoint
    pub max_connections: usize,

    /// Maximum idle time before closing a connection
    #[serde(with = "humantime_serde")]
    pub max_idle_time: Duration,

    /// Connections older than this are retired when next touched
    #[serde(with = "humantime_serde")]
    pub max_connection_age: Duration,

    /// Wait budget for a free slot when the caller set no deadline
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Connection timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            max_idle_time: Duration::from_secs(30 * 60),
            max_connection_age: Duration::from_secs(60 * 60),
            acquire_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Statistics for a connection pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Total connections created
    pub total_created: u64,

    /// Total connections reused
    pub total_reused: u64,

    /// Connections closed for age, idleness, invalidation or flushing
    pub total_retired: u64,

    /// Failed connection attempts
    pub failed_attempts: u64,

    /// Acquires that gave up waiting for a slot
    pub exhausted: u64,

    /// Leased connections, including ones still connecting
    pub active_connections: usize,

    /// Idle connections
    pub idle_connections: usize,
}

impl PoolStats {
    fn accumulate(&mut self, other: &PoolStats) {
        self.total_created += other.total_created;
        self.total_reused += other.total_reused;
        self.total_retired += other.total_retired;
        self.failed_attempts += other.failed_attempts;
        self.exhausted += other.exhausted;
        self.active_connections += other.active_connections;
        self.idle_connections += other.idle_connections;
    }
}

/// Pool statistics across every endpoint
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolSnapshot {
    pub totals: PoolStats,
    pub endpoints: BTreeMap<EndpointId, PoolStats>,
}

struct PoolState {
    idle: VecDeque<Connection>,
    /// Leased connections plus slots reserved for connections being opened
    leased: usize,
    generation: u64,
    closed: bool,
    reconnecting: bool,
    stats: PoolStats,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.leased
    }
}

enum Checkout {
    Reused(Connection),
    Create(Connection),
    Wait,
    Closed,
}

type Retired = (Connection, &'static str);

/// Per-endpoint connection pool
struct EndpointPool {
    endpoint: Arc<Endpoint>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// Signalled whenever a slot or idle connection may have become available
    available: Notify,
}

impl EndpointPool {
    fn new(endpoint: Arc<Endpoint>, config: PoolConfig) -> Self {
        Self {
            endpoint,
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(config.max_connections),
                leased: 0,
                generation: 0,
                closed: false,
                reconnecting: false,
                stats: PoolStats::default(),
            }),
            config,
            available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take an idle connection, reserve a slot for a new one, or report that the caller must wait
    fn checkout(&self, retired: &mut Vec<Retired>) -> Checkout {
        let mut state = self.lock();
        if state.closed {
            return Checkout::Closed;
        }

        let now = Instant::now();
        while let Some(mut conn) = state.idle.pop_back() {
            let reason = if conn.generation != state.generation {
                Some("pool flushed")
            } else {
                conn.retire_reason(&self.config, now)
            };
            if let Some(reason) = reason {
                state.stats.total_retired += 1;
                conn.state = ConnectionState::Closed;
                retired.push((conn, reason));
                continue;
            }

            conn.mark_used(now);
            state.leased += 1;
            state.stats.total_reused += 1;
            self.endpoint.increment_connections();
            return Checkout::Reused(conn);
        }

        if state.total() < self.config.max_connections {
            state.leased += 1;
            self.endpoint.increment_connections();
            let mut conn = Connection::new(&self.endpoint, state.generation, ConnectionState::Active);
            conn.use_count = 1;
            return Checkout::Create(conn);
        }

        Checkout::Wait
    }

    /// Reserve a slot below `limit` for a connection the pool opens on its own behalf
    fn reserve(&self, limit: usize, state_hint: ConnectionState) -> Option<Connection> {
        let mut state = self.lock();
        if state.closed || state.total() >= limit.min(self.config.max_connections) {
            return None;
        }
        state.leased += 1;
        Some(Connection::new(&self.endpoint, state.generation, state_hint))
    }

    /// Undo a lease reservation after a failed connect
    fn cancel_lease(&self) {
        self.cancel_reservation();
        self.endpoint.decrement_connections();
    }

    fn cancel_reservation(&self) {
        let mut state = self.lock();
        state.leased = state.leased.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }

    /// Return a leased connection; yields it back when it must be closed instead
    fn checkin(&self, mut conn: Connection, invalidate: bool) -> Option<Retired> {
        let mut state = self.lock();
        state.leased = state.leased.saturating_sub(1);
        self.endpoint.decrement_connections();

        let now = Instant::now();
        let reason = if invalidate {
            Some("invalidated")
        } else if state.closed {
            Some("pool closed")
        } else if conn.generation != state.generation {
            Some("pool flushed")
        } else if !self.endpoint.is_reachable() {
            Some("endpoint unreachable")
        } else if now.duration_since(conn.created_at) >= self.config.max_connection_age {
            Some("max age reached")
        } else {
            None
        };

        let retired = match reason {
            Some(reason) => {
                state.stats.total_retired += 1;
                conn.state = ConnectionState::Closed;
                Some((conn, reason))
            }
            None => {
                conn.state = ConnectionState::Idle;
                conn.last_used = now;
                state.idle.push_back(conn);
                None
            }
        };
        drop(state);

        self.available.notify_one();
        retired
    }

    /// Add a connection opened by the pool itself to the idle set
    fn park(&self, mut conn: Connection) -> Option<Retired> {
        let mut state = self.lock();
        state.leased = state.leased.saturating_sub(1);

        let retired = if state.closed {
            Some((conn, "pool closed"))
        } else if conn.generation != state.generation {
            Some((conn, "pool flushed"))
        } else {
            conn.state = ConnectionState::Idle;
            conn.last_used = Instant::now();
            state.idle.push_back(conn);
            None
        };
        if retired.is_some() {
            state.stats.total_retired += 1;
        }
        drop(state);

        self.available.notify_one();
        retired
    }

    fn record_created(&self) -> u64 {
        let mut state = self.lock();
        state.stats.total_created += 1;
        state.stats.total_created
    }

    fn record_failed(&self) {
        self.lock().stats.failed_attempts += 1;
    }

    fn record_exhausted(&self) {
        self.lock().stats.exhausted += 1;
    }

    /// Drop every idle connection and bump the generation so leased ones are
    /// closed on return
    fn flush(&self) -> Vec<Retired> {
        let mut state = self.lock();
        state.generation += 1;
        let drained: Vec<Retired> = state
            .idle
            .drain(..)
            .map(|mut conn| {
                conn.state = ConnectionState::Closed;
                (conn, "pool flushed")
            })
            .collect();
        state.stats.total_retired += drained.len() as u64;
        drop(state);

        self.available.notify_waiters();
        drained
    }

    fn close(&self) -> Vec<Retired> {
        let mut state = self.lock();
        state.closed = true;
        let drained: Vec<Retired> = state
            .idle
            .drain(..)
            .map(|mut conn| {
                conn.state = ConnectionState::Closed;
                (conn, "pool closed")
            })
            .collect();
        state.stats.total_retired += drained.len() as u64;
        drop(state);

        self.available.notify_waiters();
        drained
    }

    /// Get pool statistics
    fn stats(&self) -> PoolStats {
        let state = self.lock();
        let mut stats = state.stats.clone();
        stats.active_connections = state.leased;
        stats.idle_connections = state.idle.len();
        stats
    }
}

fn close_connection(transport: &dyn Transport, conn: &Connection, reason: &str) {
    transport.close(conn);
    debug!(
        endpoint_id = %conn.endpoint_id,
        connection_id = conn.id,
        use_count = conn.use_count,
        age_secs = conn.age().as_secs(),
        reason = reason,
        "Closed connection"
    );
}

/// A connection checked out of the pool.
///
/// Hand it back with [`PooledConnection::release`] or discard it with
/// [`PooledConnection::invalidate`]. Dropping an unreturned lease discards the
/// connection, since its session state is unknown.
pub struct PooledConnection {
    connection: Connection,
    pool: Arc<EndpointPool>,
    transport: Arc<dyn Transport>,
    returned: bool,
}

impl PooledConnection {
    fn new(connection: Connection, pool: Arc<EndpointPool>, transport: Arc<dyn Transport>) -> Self {
        Self {
            connection,
            pool,
            transport,
            returned: false,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.pool.endpoint
    }

    /// Return the connection to the idle set
    pub fn release(mut self) {
        self.finish(false);
    }

    /// Close the connection instead of returning it
    pub fn invalidate(mut self) {
        self.finish(true);
    }

    fn finish(&mut self, invalidate: bool) {
        if self.returned {
            return;
        }
        self.returned = true;

        if let Some((conn, reason)) = self.pool.checkin(self.connection.clone(), invalidate) {
            close_connection(self.transport.as_ref(), &conn, reason);
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.finish(true);
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.connection)
            .field("returned", &self.returned)
            .finish()
    }
}

/// Connection pool manager for all endpoints
pub struct ConnectionPool {
    /// Per-endpoint connection pools
    pools: RwLock<HashMap<EndpointId, Arc<EndpointPool>>>,

    /// Pool configuration
    config: PoolConfig,

    transport: Arc<dyn Transport>,
}

impl ConnectionPool {
    /// Create a new connection pool manager
    pub fn new(config: PoolConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            config,
            transport,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Register an endpoint with the pool.
    ///
    /// Registering a different endpoint object under a known id replaces and
    /// closes the old pool.
    pub async fn register_endpoint(&self, endpoint: Arc<Endpoint>) {
        let mut pools = self.pools.write().await;
        if let Some(existing) = pools.get(endpoint.id()) {
            if Arc::ptr_eq(&existing.endpoint, &endpoint) {
                return;
            }
        }

        info!(
            endpoint_id = %endpoint.id(),
            address = %endpoint.address(),
            max_connections = self.config.max_connections,
            "Registering endpoint pool"
        );
        let replaced = pools.insert(
            endpoint.id().to_string(),
            Arc::new(EndpointPool::new(endpoint, self.config.clone())),
        );
        drop(pools);

        if let Some(old) = replaced {
            self.close_retired(old.close());
        }
    }

    /// Remove an endpoint from the pool, closing idle connections.
    /// Leased connections are closed when they come back.
    pub async fn remove_endpoint(&self, endpoint_id: &str) -> bool {
        let removed = self.pools.write().await.remove(endpoint_id);
        match removed {
            Some(pool) => {
                self.close_retired(pool.close());
                info!(endpoint_id = %endpoint_id, "Removed endpoint from pool");
                true
            }
            None => false,
        }
    }

    /// Remove the pool only if it still belongs to this exact endpoint object
    pub async fn remove_endpoint_instance(&self, endpoint: &Arc<Endpoint>) -> bool {
        let mut pools = self.pools.write().await;
        match pools.get(endpoint.id()) {
            Some(pool) if Arc::ptr_eq(&pool.endpoint, endpoint) => {}
            _ => return false,
        }
        let removed = pools.remove(endpoint.id());
        drop(pools);

        match removed {
            Some(pool) => {
                self.close_retired(pool.close());
                true
            }
            None => false,
        }
    }

    async fn find(&self, endpoint_id: &str) -> Option<Arc<EndpointPool>> {
        self.pools.read().await.get(endpoint_id).cloned()
    }

    async fn pool(&self, endpoint_id: &str) -> Result<Arc<EndpointPool>, ResilienceError> {
        self.find(endpoint_id)
            .await
            .ok_or_else(|| ResilienceError::UnknownEndpoint(endpoint_id.to_string()))
    }

    fn close_retired(&self, retired: impl IntoIterator<Item = Retired>) {
        for (conn, reason) in retired {
            close_connection(self.transport.as_ref(), &conn, reason);
        }
    }

    /// Lease a connection for `endpoint`.
    ///
    /// Waits for a free slot until the context deadline, or `acquire_timeout`
    /// when the context has none, then fails with `PoolExhausted`.
    pub async fn acquire(
        &self,
        ctx: &CallContext,
        endpoint: &Endpoint,
    ) -> Result<PooledConnection, ResilienceError> {
        let pool = self.pool(endpoint.id()).await?;
        let wait_ctx = match ctx.deadline() {
            Some(_) => ctx.clone(),
            None => ctx.child().with_timeout(self.config.acquire_timeout),
        };

        let mut retired = Vec::new();
        loop {
            let notified = pool.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let checkout = pool.checkout(&mut retired);
            self.close_retired(retired.drain(..));

            match checkout {
                Checkout::Reused(conn) => {
                    debug!(
                        endpoint_id = %conn.endpoint_id,
                        connection_id = conn.id,
                        use_count = conn.use_count,
                        "Reusing connection"
                    );
                    return Ok(PooledConnection::new(
                        conn,
                        Arc::clone(&pool),
                        Arc::clone(&self.transport),
                    ));
                }
                Checkout::Create(conn) => {
                    return match self.open(ctx, &pool, conn).await {
                        Ok(conn) => Ok(PooledConnection::new(
                            conn,
                            Arc::clone(&pool),
                            Arc::clone(&self.transport),
                        )),
                        Err(e) => {
                            pool.cancel_lease();
                            Err(e)
                        }
                    };
                }
                Checkout::Closed => {
                    return Err(ResilienceError::UnknownEndpoint(endpoint.id().to_string()));
                }
                Checkout::Wait => {
                    debug!(endpoint_id = %endpoint.id(), "Pool at capacity, waiting for a connection");
                    match wait_ctx.run(notified).await {
                        Ok(()) => continue,
                        Err(ContextError::DeadlineExceeded) => {
                            pool.record_exhausted();
                            warn!(
                                endpoint_id = %endpoint.id(),
                                max_connections = self.config.max_connections,
                                "Pool exhausted"
                            );
                            return Err(ResilienceError::PoolExhausted {
                                endpoint: endpoint.id().to_string(),
                            });
                        }
                        Err(ContextError::Cancelled) => return Err(ResilienceError::Cancelled),
                    }
                }
            }
        }
    }

    /// Run the transport handshake for a reserved connection
    async fn open(
        &self,
        ctx: &CallContext,
        pool: &EndpointPool,
        conn: Connection,
    ) -> Result<Connection, ResilienceError> {
        debug!(
            endpoint_id = %conn.endpoint_id,
            connection_id = conn.id,
            address = %conn.address,
            "Creating new connection"
        );

        let connect_ctx = ctx.child().with_timeout(self.config.connect_timeout);
        let error = match connect_ctx.run(self.transport.connect(&connect_ctx, &conn)).await {
            Ok(Ok(())) => {
                let total_created = pool.record_created();
                info!(
                    endpoint_id = %conn.endpoint_id,
                    connection_id = conn.id,
                    total_created = total_created,
                    "Created new connection"
                );
                return Ok(conn);
            }
            Ok(Err(source)) => ResilienceError::Transport { source, attempts: 0 },
            Err(ContextError::Cancelled) => ResilienceError::Cancelled,
            Err(ContextError::DeadlineExceeded) => match ctx.check() {
                Err(e) => e.into(),
                Ok(()) => ResilienceError::Transport {
                    source: TransportError::Timeout(format!("connect to {} timed out", conn.address)),
                    attempts: 0,
                },
            },
        };

        pool.record_failed();
        warn!(
            endpoint_id = %conn.endpoint_id,
            error = %error,
            "Failed to connect to endpoint"
        );
        Err(error)
    }

    /// Return a connection to the pool
    pub fn release(&self, lease: PooledConnection) {
        lease.release();
    }

    /// Discard a connection that must not be reused
    pub fn invalidate(&self, lease: PooledConnection) {
        lease.invalidate();
    }

    /// Open connections until the endpoint has `min_connections`, returning how many were added
    pub async fn top_up(&self, ctx: &CallContext, endpoint_id: &str) -> Result<usize, ResilienceError> {
        let pool = self.pool(endpoint_id).await?;
        let mut opened = 0;

        while let Some(conn) = pool.reserve(self.config.min_connections, ConnectionState::Active) {
            match self.open(ctx, &pool, conn).await {
                Ok(conn) => match pool.park(conn) {
                    Some(retired) => {
                        self.close_retired([retired]);
                        break;
                    }
                    None => opened += 1,
                },
                Err(e) => {
                    pool.cancel_reservation();
                    return Err(e);
                }
            }
        }

        if opened > 0 {
            debug!(endpoint_id = %endpoint_id, opened = opened, "Topped up idle connections");
        }
        Ok(opened)
    }

    /// Open a single replacement connection for an endpoint that lost its pool.
    ///
    /// Returns false without connecting when the pool has no free slot.
    pub async fn reconnect(&self, ctx: &CallContext, endpoint_id: &str) -> Result<bool, ResilienceError> {
        let pool = self.pool(endpoint_id).await?;
        let Some(conn) = pool.reserve(self.config.max_connections, ConnectionState::Reconnecting) else {
            return Ok(false);
        };

        match self.open(ctx, &pool, conn).await {
            Ok(conn) => {
                if let Some(retired) = pool.park(conn) {
                    self.close_retired([retired]);
                }
                Ok(true)
            }
            Err(e) => {
                pool.cancel_reservation();
                Err(e)
            }
        }
    }

    /// Claim the reconnect loop for an endpoint. Returns false if one is already running.
    pub async fn begin_reconnect(&self, endpoint_id: &str) -> bool {
        match self.find(endpoint_id).await {
            Some(pool) => {
                let mut state = pool.lock();
                !std::mem::replace(&mut state.reconnecting, true)
            }
            None => false,
        }
    }

    pub async fn end_reconnect(&self, endpoint_id: &str) {
        if let Some(pool) = self.find(endpoint_id).await {
            pool.lock().reconnecting = false;
        }
    }

    pub async fn is_reconnecting(&self, endpoint_id: &str) -> bool {
        match self.find(endpoint_id).await {
            Some(pool) => pool.lock().reconnecting,
            None => false,
        }
    }

    /// Copies of up to `count` idle connections, least recently used first
    pub async fn idle_sample(&self, endpoint_id: &str, count: usize) -> Vec<Connection> {
        match self.find(endpoint_id).await {
            Some(pool) => pool.lock().idle.iter().take(count).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Close a specific idle connection, e.g. after it failed a liveness ping
    pub async fn discard_idle(&self, endpoint_id: &str, connection_id: ConnectionId) -> bool {
        let Some(pool) = self.find(endpoint_id).await else {
            return false;
        };

        let mut state = pool.lock();
        let Some(index) = state.idle.iter().position(|c| c.id == connection_id) else {
            return false;
        };
        let removed = state.idle.remove(index);
        if removed.is_some() {
            state.stats.total_retired += 1;
        }
        drop(state);

        match removed {
            Some(conn) => {
                close_connection(self.transport.as_ref(), &conn, "failed liveness check");
                pool.available.notify_one();
                true
            }
            None => false,
        }
    }

    /// Close all idle connections for an endpoint and retire leased ones on return
    pub async fn flush(&self, endpoint_id: &str) -> usize {
        match self.find(endpoint_id).await {
            Some(pool) => {
                let retired = pool.flush();
                let count = retired.len();
                self.close_retired(retired);
                if count > 0 {
                    info!(endpoint_id = %endpoint_id, closed = count, "Flushed endpoint pool");
                }
                count
            }
            None => 0,
        }
    }

    pub async fn idle_count(&self, endpoint_id: &str) -> usize {
        match self.find(endpoint_id).await {
            Some(pool) => pool.lock().idle.len(),
            None => 0,
        }
    }

    /// Get statistics for a specific endpoint pool
    pub async fn get_stats(&self, endpoint_id: &str) -> Option<PoolStats> {
        self.find(endpoint_id).await.map(|pool| pool.stats())
    }

    /// Get statistics for all endpoint pools
    pub async fn get_all_stats(&self) -> PoolSnapshot {
        let pools = self.pools.read().await;
        let mut snapshot = PoolSnapshot::default();
        for (id, pool) in pools.iter() {
            let stats = pool.stats();
            snapshot.totals.accumulate(&stats);
            snapshot.endpoints.insert(id.clone(), stats);
        }
        snapshot
    }

    /// Close every pool. Leased connections are closed when they come back.
    pub async fn close_all(&self) {
        let pools: Vec<(EndpointId, Arc<EndpointPool>)> = self.pools.write().await.drain().collect();
        for (endpoint_id, pool) in pools {
            let retired = pool.close();
            debug!(endpoint_id = %endpoint_id, closed = retired.len(), "Closing endpoint pool");
            self.close_retired(retired);
        }
    }
}
