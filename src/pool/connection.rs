//! Connection pool orchestrator
//!
//! The pool owns every live session to every endpoint. Callers ask for a
//! connection by endpoint URL and get back a shared handle to an existing
//! session when one is healthy; otherwise a new session is opened through
//! the endpoint's circuit breaker. Handles are not checked out exclusively:
//! releasing one only refreshes its idle clock.
//!
//! Locking:
//! - the entry map sits behind one async mutex that is only held for
//!   bookkeeping, never across network I/O
//! - creation is serialized per endpoint so concurrent callers for the same
//!   endpoint share one new session instead of racing
//! - capacity for a creation is reserved up front, so creations for
//!   different endpoints cannot overshoot `max_connections`

use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::circuit::{BreakerRegistry, CircuitBreakerConfig, CircuitError, CircuitState};
use super::events::{CloseReason, PoolEvent, EVENT_CHANNEL_CAPACITY};
use super::health::HealthChecker;
use crate::session::{
    ConnectOptions, Credentials, EndpointConfig, ProtocolSession, SessionError, SessionFactory,
};

/// Unique identifier for a pooled connection
pub type ConnectionId = Uuid;

/// Error types for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Failed to connect to endpoint {endpoint}: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: SessionError,
    },

    #[error("Connection pool is exhausted ({max} connections)")]
    PoolExhausted { max: usize },

    #[error("Circuit breaker is open for endpoint: {endpoint}")]
    CircuitOpen {
        endpoint: String,
        retry_in: Option<Duration>,
    },

    #[error("Connection pool has been shut down")]
    ShutDown,

    #[error("Connection pool is already initialized")]
    AlreadyInitialized,

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard cap on live connections
    pub max_connections: usize,

    /// Floor kept by idle eviction, and the warm-up target
    pub min_connections: usize,

    /// Idle time after which a connection may be evicted
    pub idle_timeout: Duration,

    /// Cadence of health probes
    pub health_check_interval: Duration,

    /// Deadline for opening a connection and its session
    pub connect_timeout: Duration,

    /// Reconnect attempts made by the transport itself
    pub retry_attempts: u32,

    /// Delay between transport reconnect attempts
    pub retry_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::InvalidConfig(
                "max_connections must be greater than zero".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::InvalidConfig(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.health_check_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "health_check_interval must be non-zero".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(PoolError::InvalidConfig(
                "connect_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// One live connection/session pair, owned by the pool
pub(super) struct PoolEntry {
    pub(super) id: ConnectionId,
    pub(super) endpoint: String,
    pub(super) session: Arc<dyn ProtocolSession>,
    pub(super) is_connected: bool,
    pub(super) last_used: Instant,
    pub(super) created_at: Instant,
    pub(super) use_count: u64,
    pub(super) consecutive_errors: u32,
}

impl PoolEntry {
    fn mark_used(&mut self) {
        self.last_used = Instant::now();
        self.use_count += 1;
    }

    fn handle(&self) -> PooledConnection {
        PooledConnection {
            id: self.id,
            endpoint: self.endpoint.clone(),
            use_count: self.use_count,
            created_at: self.created_at,
            session: Arc::clone(&self.session),
        }
    }

    fn info(&self, now: Instant) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            endpoint: self.endpoint.clone(),
            is_connected: self.is_connected,
            use_count: self.use_count,
            consecutive_errors: self.consecutive_errors,
            idle_ms: now.saturating_duration_since(self.last_used).as_millis() as u64,
            age_ms: now.saturating_duration_since(self.created_at).as_millis() as u64,
        }
    }
}

/// Handle to a pooled connection.
///
/// The pool keeps ownership of the session; dropping the handle does not
/// close anything. Call [`ConnectionPool::release_connection`] when done.
#[derive(Clone)]
pub struct PooledConnection {
    id: ConnectionId,
    endpoint: String,
    use_count: u64,
    created_at: Instant,
    session: Arc<dyn ProtocolSession>,
}

impl PooledConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Use count at the time this handle was handed out
    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn session(&self) -> &Arc<dyn ProtocolSession> {
        &self.session
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("use_count", &self.use_count)
            .finish()
    }
}

/// Point-in-time view of one pooled connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub endpoint: String,
    pub is_connected: bool,
    pub use_count: u64,
    pub consecutive_errors: u32,
    pub idle_ms: u64,
    pub age_ms: u64,
}

/// Aggregate pool metrics
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub total_connections: usize,
    pub active_connections: usize,
    pub total_use_count: u64,
    pub total_errors: u64,
    pub pending_creations: usize,
    pub max_connections: usize,
    pub min_connections: usize,
    pub breakers: Vec<super::circuit::CircuitStats>,
}

pub(super) struct PoolState {
    pub(super) entries: HashMap<ConnectionId, PoolEntry>,
    initialized: bool,
    pub(super) shutdown: bool,
}

pub(super) struct PoolInner {
    pub(super) config: PoolConfig,
    factory: Arc<dyn SessionFactory>,
    pub(super) state: Mutex<PoolState>,
    /// Slots reserved by creations in flight; only incremented under `state`
    pending: AtomicUsize,
    breakers: BreakerRegistry,
    creation_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    credentials: StdMutex<HashMap<String, Credentials>>,
    events: broadcast::Sender<PoolEvent>,
    cancel: CancellationToken,
    health_task: StdMutex<Option<JoinHandle<()>>>,
}

/// A capacity slot held by a creation in flight
struct Reservation<'a> {
    pending: &'a AtomicUsize,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Pool of sessions to all endpoints. Clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    pub(super) inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("pending", &self.inner.pending.load(Ordering::SeqCst))
            .finish()
    }
}

impl ConnectionPool {
    /// Create a pool. Nothing is connected until [`initialize`](Self::initialize)
    /// or the first [`get_connection`](Self::get_connection).
    pub fn new(
        config: PoolConfig,
        breaker_config: CircuitBreakerConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        breaker_config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                state: Mutex::new(PoolState {
                    entries: HashMap::new(),
                    initialized: false,
                    shutdown: false,
                }),
                pending: AtomicUsize::new(0),
                breakers: BreakerRegistry::new(breaker_config),
                creation_locks: StdMutex::new(HashMap::new()),
                credentials: StdMutex::new(HashMap::new()),
                events,
                cancel: CancellationToken::new(),
                health_task: StdMutex::new(None),
            }),
        })
    }

    pub(super) fn from_inner(inner: Arc<PoolInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Subscribe to lifecycle notifications
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Warm the pool and start health checks.
    ///
    /// Opens up to `min(min_connections, configs.len())` connections
    /// concurrently. A failing endpoint is logged and does not stop the
    /// others. Returns how many connections were opened.
    pub async fn initialize(&self, configs: &[EndpointConfig]) -> Result<usize, PoolError> {
        {
            let mut state = self.inner.state.lock().await;
            if state.shutdown {
                return Err(PoolError::ShutDown);
            }
            if state.initialized {
                return Err(PoolError::AlreadyInitialized);
            }
            state.initialized = true;
        }

        self.register_endpoints(configs);

        let target = self.inner.config.min_connections.min(configs.len());
        let results = join_all(configs[..target].iter().map(|c| self.create_connection(c))).await;

        let mut created = 0;
        for (config, result) in configs.iter().zip(results) {
            match result {
                Ok(conn) => {
                    created += 1;
                    debug!(endpoint = %config.url, id = %conn.id(), "Warmed connection");
                }
                Err(e) => {
                    warn!(endpoint = %config.url, error = %e, "Failed to warm connection");
                }
            }
        }

        self.start_health_checks();

        info!(
            created = created,
            target = target,
            endpoints = configs.len(),
            "Connection pool initialized"
        );
        Ok(created)
    }

    fn start_health_checks(&self) {
        let checker = HealthChecker::new(
            Arc::downgrade(&self.inner),
            self.inner.config.health_check_interval,
            self.inner.cancel.clone(),
        );
        let handle = checker.start();
        *self.inner.health_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Get a connection to `endpoint`, reusing a healthy one when possible
    pub async fn get_connection(&self, endpoint: &str) -> Result<PooledConnection, PoolError> {
        if let Some(conn) = self.try_reuse(endpoint).await? {
            return Ok(conn);
        }

        let lock = self.creation_lock(endpoint);
        let _creating = lock.lock().await;

        // Another caller may have created it while we waited
        if let Some(conn) = self.try_reuse(endpoint).await? {
            debug!(endpoint = %endpoint, id = %conn.id(), "Reusing connection created concurrently");
            return Ok(conn);
        }

        let config = EndpointConfig {
            url: endpoint.to_string(),
            credentials: self.credentials_for(endpoint),
        };
        self.create_locked(&config).await
    }

    /// Open a new connection for `config`, even if one to the endpoint exists
    pub async fn create_connection(
        &self,
        config: &EndpointConfig,
    ) -> Result<PooledConnection, PoolError> {
        let lock = self.creation_lock(&config.url);
        let _creating = lock.lock().await;
        self.create_locked(config).await
    }

    /// Refresh a connection's idle clock. Unknown ids are ignored.
    pub async fn release_connection(&self, id: ConnectionId) -> bool {
        let mut state = self.inner.state.lock().await;
        match state.entries.get_mut(&id) {
            Some(entry) => {
                entry.last_used = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Close a connection and remove it from the pool. Unknown ids are ignored.
    pub async fn close_connection(&self, id: ConnectionId) -> bool {
        let entry = self.inner.state.lock().await.entries.remove(&id);
        match entry {
            Some(entry) => {
                self.finish_close(entry, CloseReason::Requested).await;
                true
            }
            None => {
                debug!(id = %id, "Close requested for unknown connection");
                false
            }
        }
    }

    /// Stop health checks and close every connection.
    ///
    /// Later calls into the pool fail with [`PoolError::ShutDown`].
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if state.shutdown {
                debug!("Connection pool already shut down");
                return;
            }
            state.shutdown = true;
        }

        info!("Shutting down connection pool");
        self.inner.cancel.cancel();

        let task = self
            .inner
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Health check task ended abnormally");
            }
        }

        let entries: Vec<PoolEntry> = {
            let mut state = self.inner.state.lock().await;
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        let closed = entries.len();

        join_all(
            entries
                .into_iter()
                .map(|entry| self.finish_close(entry, CloseReason::Shutdown)),
        )
        .await;

        self.inner.breakers.close().await;
        self.inner
            .creation_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        info!(closed = closed, "Connection pool shut down");
    }

    pub async fn is_shut_down(&self) -> bool {
        self.inner.state.lock().await.shutdown
    }

    /// Number of live connections
    pub async fn size(&self) -> usize {
        self.inner.state.lock().await.entries.len()
    }

    pub async fn get_metrics(&self) -> PoolMetrics {
        let (total, active, uses, errors) = {
            let state = self.inner.state.lock().await;
            let entries = state.entries.values();
            (
                state.entries.len(),
                state.entries.values().filter(|e| e.is_connected).count(),
                entries.clone().map(|e| e.use_count).sum::<u64>(),
                entries.map(|e| u64::from(e.consecutive_errors)).sum::<u64>(),
            )
        };

        PoolMetrics {
            total_connections: total,
            active_connections: active,
            total_use_count: uses,
            total_errors: errors,
            pending_creations: self.inner.pending.load(Ordering::SeqCst),
            max_connections: self.inner.config.max_connections,
            min_connections: self.inner.config.min_connections,
            breakers: self.inner.breakers.snapshot().await,
        }
    }

    /// Snapshot of every pooled connection, oldest first
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let state = self.inner.state.lock().await;
        let now = Instant::now();
        let mut infos: Vec<ConnectionInfo> = state.entries.values().map(|e| e.info(now)).collect();
        infos.sort_by(|a, b| b.age_ms.cmp(&a.age_ms));
        infos
    }

    pub async fn breaker_state(&self, endpoint: &str) -> Option<CircuitState> {
        self.inner.breakers.get(endpoint).await.map(|b| b.state())
    }

    /// Force an endpoint's breaker back to Closed
    pub async fn reset_breaker(&self, endpoint: &str) -> bool {
        self.inner.breakers.reset(endpoint).await
    }

    async fn try_reuse(&self, endpoint: &str) -> Result<Option<PooledConnection>, PoolError> {
        let mut state = self.inner.state.lock().await;
        if state.shutdown {
            return Err(PoolError::ShutDown);
        }

        let entry = state
            .entries
            .values_mut()
            .filter(|e| e.endpoint == endpoint && e.is_connected)
            .max_by_key(|e| e.created_at);

        Ok(entry.map(|entry| {
            entry.mark_used();
            debug!(
                endpoint = %endpoint,
                id = %entry.id,
                use_count = entry.use_count,
                "Reusing connection"
            );
            entry.handle()
        }))
    }

    /// Create a connection; the caller holds the endpoint's creation lock
    async fn create_locked(&self, config: &EndpointConfig) -> Result<PooledConnection, PoolError> {
        let breaker = self
            .inner
            .breakers
            .get_or_create(&config.url)
            .await
            .ok_or(PoolError::ShutDown)?;
        let reservation = self.reserve_slot().await?;

        match breaker.execute(|| self.open_session(config)).await {
            Ok(session) => self.store(config, session, reservation).await,
            Err(CircuitError::Open { endpoint, retry_in }) => {
                debug!(endpoint = %endpoint, "Circuit open, not connecting");
                Err(PoolError::CircuitOpen { endpoint, retry_in })
            }
            Err(CircuitError::Inner(source)) => {
                warn!(endpoint = %config.url, error = %source, "Failed to create connection");
                Err(PoolError::Connection {
                    endpoint: config.url.clone(),
                    source,
                })
            }
        }
    }

    async fn open_session(
        &self,
        config: &EndpointConfig,
    ) -> Result<Arc<dyn ProtocolSession>, SessionError> {
        let timeout = self.inner.config.connect_timeout;
        let options = ConnectOptions {
            timeout,
            retry_attempts: self.inner.config.retry_attempts,
            retry_delay: self.inner.config.retry_delay,
        };

        let attempt = async {
            let session: Arc<dyn ProtocolSession> =
                Arc::from(self.inner.factory.connect(&config.url, &options).await?);

            if let Err(e) = session.create_session(&config.credentials).await {
                if let Err(close_err) = session.close_transport().await {
                    debug!(
                        endpoint = %config.url,
                        error = %close_err,
                        "Failed to close transport after session error"
                    );
                }
                return Err(e);
            }

            Ok::<_, SessionError>(session)
        };

        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| SessionError::Timeout(timeout))?
    }

    async fn store(
        &self,
        config: &EndpointConfig,
        session: Arc<dyn ProtocolSession>,
        reservation: Reservation<'_>,
    ) -> Result<PooledConnection, PoolError> {
        let mut state = self.inner.state.lock().await;

        if state.shutdown {
            drop(state);
            drop(reservation);
            warn!(endpoint = %config.url, "Connection opened after shutdown began, closing it");
            close_quietly(&config.url, session.as_ref(), self.inner.config.connect_timeout).await;
            return Err(PoolError::ShutDown);
        }

        let now = Instant::now();
        let entry = PoolEntry {
            id: Uuid::new_v4(),
            endpoint: config.url.clone(),
            session,
            is_connected: true,
            last_used: now,
            created_at: now,
            use_count: 1,
            consecutive_errors: 0,
        };
        let handle = entry.handle();
        state.entries.insert(entry.id, entry);

        // Release the slot only once the entry itself is counted
        drop(reservation);
        let total = state.entries.len();
        drop(state);

        info!(
            endpoint = %config.url,
            id = %handle.id(),
            total = total,
            "Created new connection"
        );
        self.emit(PoolEvent::ConnectionCreated {
            id: handle.id(),
            endpoint: config.url.clone(),
        });

        Ok(handle)
    }

    async fn reserve_slot(&self) -> Result<Reservation<'_>, PoolError> {
        if let Some(reservation) = self.try_reserve().await? {
            return Ok(reservation);
        }

        let evicted = self.close_idle_connections().await;
        debug!(evicted = evicted, "Pool at capacity, tried idle eviction");

        match self.try_reserve().await? {
            Some(reservation) => Ok(reservation),
            None => {
                let max = self.inner.config.max_connections;
                warn!(max = max, "Connection pool exhausted");
                Err(PoolError::PoolExhausted { max })
            }
        }
    }

    async fn try_reserve(&self) -> Result<Option<Reservation<'_>>, PoolError> {
        let state = self.inner.state.lock().await;
        if state.shutdown {
            return Err(PoolError::ShutDown);
        }

        let in_use = state.entries.len() + self.inner.pending.load(Ordering::SeqCst);
        if in_use >= self.inner.config.max_connections {
            return Ok(None);
        }

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Reservation {
            pending: &self.inner.pending,
        }))
    }

    /// Close a connection already removed from the map
    pub(super) async fn finish_close(&self, entry: PoolEntry, reason: CloseReason) {
        close_quietly(
            &entry.endpoint,
            entry.session.as_ref(),
            self.inner.config.connect_timeout,
        )
        .await;

        info!(
            endpoint = %entry.endpoint,
            id = %entry.id,
            reason = %reason,
            use_count = entry.use_count,
            "Closed connection"
        );
        self.emit(PoolEvent::ConnectionClosed {
            id: entry.id,
            endpoint: entry.endpoint,
            reason,
        });
    }

    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn creation_lock(&self, endpoint: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .inner
            .creation_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(endpoint.to_string()).or_default())
    }

    /// Remember credentials used when `get_connection` opens a session to
    /// one of these endpoints. Unknown endpoints connect anonymously.
    pub fn register_endpoints(&self, configs: &[EndpointConfig]) {
        let mut known = self
            .inner
            .credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for config in configs {
            known.insert(config.url.clone(), config.credentials.clone());
        }
    }

    fn credentials_for(&self, endpoint: &str) -> Credentials {
        self.inner
            .credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .cloned()
            .unwrap_or_default()
    }
}

/// Close the session, then the transport; each step fails independently
async fn close_quietly(endpoint: &str, session: &dyn ProtocolSession, timeout: Duration) {
    match tokio::time::timeout(timeout, session.close_session()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(endpoint = %endpoint, error = %e, "Failed to close session"),
        Err(_) => warn!(endpoint = %endpoint, "Timed out closing session"),
    }

    match tokio::time::timeout(timeout, session.close_transport()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(endpoint = %endpoint, error = %e, "Failed to close transport"),
        Err(_) => warn!(endpoint = %endpoint, "Timed out closing transport"),
    }
}
