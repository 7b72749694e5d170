//! Circuit breaker implementation for fault tolerance
//!
//! Each endpoint gets its own breaker with three states:
//! - Closed: Normal operation, calls pass through
//! - Open: Endpoint has failed, calls are rejected without being attempted
//! - HalfOpen: Testing recovery, a limited number of trial calls pass
//!
//! Breakers live in a [`BreakerRegistry`] for the lifetime of the pool so
//! failure history survives reconnect attempts.

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::connection::PoolError;

/// Circuit breaker error types
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    #[error("Circuit breaker is open for endpoint: {endpoint}")]
    Open {
        endpoint: String,
        /// Time left until a trial call is allowed, if known
        retry_in: Option<Duration>,
    },

    #[error(transparent)]
    Inner(E),
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Normal operation - calls are allowed
    Closed,

    /// Endpoint has failed - calls are rejected
    Open,

    /// Testing recovery - limited trial calls allowed
    HalfOpen,
}

impl CircuitState {
    /// Get a human-readable state name
    pub fn name(&self) -> &str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within `monitoring_period` that open the circuit
    pub failure_threshold: u32,

    /// How long to stay open before allowing a trial call
    pub reset_timeout: Duration,

    /// Rolling window for counting failures in Closed state
    pub monitoring_period: Duration,

    /// Trial calls allowed in HalfOpen; this many consecutive successes close it
    pub half_open_max_attempts: u32,
}

impl CircuitBreakerConfig {
    /// A zero threshold or trial budget would leave a breaker unable to recover
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.failure_threshold == 0 {
            return Err(PoolError::InvalidConfig(
                "failure_threshold must be greater than zero".to_string(),
            ));
        }
        if self.half_open_max_attempts == 0 {
            return Err(PoolError::InvalidConfig(
                "half_open_max_attempts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(120),
            half_open_max_attempts: 3,
        }
    }
}

/// Mutable breaker state, guarded by a short-lived lock
#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    recent_failures: Vec<Instant>,
    last_failure_time: Option<Instant>,
    half_open_attempts: u32,
    half_open_successes: u32,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    rejected: u64,
    open_count: u64,
    last_transition: Instant,
}

impl BreakerCore {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            recent_failures: Vec::new(),
            last_failure_time: None,
            half_open_attempts: 0,
            half_open_successes: 0,
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            rejected: 0,
            open_count: 0,
            last_transition: Instant::now(),
        }
    }

    fn transition_to_closed(&mut self) {
        self.state = CircuitState::Closed;
        self.recent_failures.clear();
        self.half_open_attempts = 0;
        self.half_open_successes = 0;
        self.last_transition = Instant::now();
    }

    fn transition_to_open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.last_failure_time = Some(now);
        self.half_open_attempts = 0;
        self.half_open_successes = 0;
        self.open_count += 1;
        self.last_transition = now;
    }

    fn transition_to_half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.half_open_attempts = 0;
        self.half_open_successes = 0;
        self.last_transition = Instant::now();
    }
}

/// Statistics for one endpoint's breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub endpoint: String,
    pub state: CircuitState,
    /// Failures inside the current monitoring window
    pub failure_count: u32,
    pub half_open_attempts: u32,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected: u64,
    pub open_count: u64,
    pub time_in_state_ms: u64,
    /// Time since the most recent failure, if any
    pub since_last_failure_ms: Option<u64>,
}

/// Per-endpoint circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint: String,
    config: CircuitBreakerConfig,
    core: Mutex<BreakerCore>,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            core: Mutex::new(BreakerCore::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` through the breaker.
    ///
    /// Short-circuits with [`CircuitError::Open`] without calling `f` while
    /// the circuit is open or the half-open trial budget is spent. A call
    /// dropped before completing counts as a failure.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.check_request()?;

        let mut trial = Trial {
            breaker: self,
            finished: false,
        };

        let result = f().await;
        trial.finished = true;

        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Admit or reject a call, moving Open to HalfOpen once the reset timeout passed
    fn check_request<E>(&self) -> Result<(), CircuitError<E>> {
        let mut core = self.lock();
        let now = Instant::now();

        if core.state == CircuitState::Open {
            let opened_at = core.last_failure_time.unwrap_or(core.last_transition);
            let elapsed = now.saturating_duration_since(opened_at);

            if elapsed >= self.config.reset_timeout {
                info!(endpoint = %self.endpoint, "Circuit transitioning from Open to HalfOpen");
                core.transition_to_half_open();
            } else {
                core.rejected += 1;
                return Err(CircuitError::Open {
                    endpoint: self.endpoint.clone(),
                    retry_in: Some(self.config.reset_timeout - elapsed),
                });
            }
        }

        if core.state == CircuitState::HalfOpen {
            if core.half_open_attempts >= self.config.half_open_max_attempts {
                core.rejected += 1;
                debug!(endpoint = %self.endpoint, "HalfOpen trial budget exhausted");
                return Err(CircuitError::Open {
                    endpoint: self.endpoint.clone(),
                    retry_in: None,
                });
            }
            core.half_open_attempts += 1;
        }

        core.total_requests += 1;
        Ok(())
    }

    fn record_success(&self) {
        let mut core = self.lock();
        core.total_successes += 1;

        match core.state {
            CircuitState::Closed => {
                core.recent_failures.clear();
            }

            CircuitState::Open => {
                // A trial admitted before a concurrent failure reopened the circuit
                debug!(endpoint = %self.endpoint, "Late success ignored in Open state");
            }

            CircuitState::HalfOpen => {
                core.half_open_successes += 1;
                debug!(
                    endpoint = %self.endpoint,
                    successes = core.half_open_successes,
                    "Trial succeeded in HalfOpen state"
                );

                if core.half_open_successes >= self.config.half_open_max_attempts {
                    info!(endpoint = %self.endpoint, "Circuit transitioning from HalfOpen to Closed");
                    core.transition_to_closed();
                }
            }
        }
    }

    fn record_failure(&self) {
        let mut core = self.lock();
        let now = Instant::now();
        core.total_failures += 1;

        match core.state {
            CircuitState::Closed => {
                let window = self.config.monitoring_period;
                core.recent_failures.push(now);
                core.recent_failures
                    .retain(|&t| now.saturating_duration_since(t) < window);
                core.last_failure_time = Some(now);

                let failures = core.recent_failures.len() as u32;
                debug!(
                    endpoint = %self.endpoint,
                    failures = failures,
                    threshold = self.config.failure_threshold,
                    "Call failed in Closed state"
                );

                if failures >= self.config.failure_threshold {
                    warn!(
                        endpoint = %self.endpoint,
                        failures = failures,
                        "Circuit transitioning from Closed to Open"
                    );
                    core.transition_to_open(now);
                }
            }

            CircuitState::Open => {
                debug!(endpoint = %self.endpoint, "Call failed in Open state");
            }

            CircuitState::HalfOpen => {
                warn!(
                    endpoint = %self.endpoint,
                    successes = core.half_open_successes,
                    "Trial failed in HalfOpen state - reopening circuit"
                );
                core.transition_to_open(now);
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Manually reset the circuit to Closed
    pub fn reset(&self) {
        info!(endpoint = %self.endpoint, "Manually resetting circuit to Closed");
        self.lock().transition_to_closed();
    }

    pub fn stats(&self) -> CircuitStats {
        let core = self.lock();
        CircuitStats {
            endpoint: self.endpoint.clone(),
            state: core.state,
            failure_count: core.recent_failures.len() as u32,
            half_open_attempts: core.half_open_attempts,
            total_requests: core.total_requests,
            total_successes: core.total_successes,
            total_failures: core.total_failures,
            rejected: core.rejected,
            open_count: core.open_count,
            time_in_state_ms: core.last_transition.elapsed().as_millis() as u64,
            since_last_failure_ms: core
                .last_failure_time
                .map(|t| t.elapsed().as_millis() as u64),
        }
    }
}

/// Counts a call that never reported back as a failure
struct Trial<'a> {
    breaker: &'a CircuitBreaker,
    finished: bool,
}

impl Drop for Trial<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(endpoint = %self.breaker.endpoint, "Call dropped before completing");
            self.breaker.record_failure();
        }
    }
}

/// Breakers for every endpoint seen so far, created on first use
#[derive(Debug)]
pub struct BreakerRegistry {
    inner: RwLock<RegistryState>,
    config: CircuitBreakerConfig,
}

#[derive(Debug, Default)]
struct RegistryState {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    closed: bool,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: RwLock::new(RegistryState::default()),
            config,
        }
    }

    /// Get the endpoint's breaker, creating it on first use.
    ///
    /// Returns `None` once the registry is closed.
    pub async fn get_or_create(&self, endpoint: &str) -> Option<Arc<CircuitBreaker>> {
        {
            let state = self.inner.read().await;
            if state.closed {
                return None;
            }
            if let Some(breaker) = state.breakers.get(endpoint) {
                return Some(Arc::clone(breaker));
            }
        }

        let mut state = self.inner.write().await;
        if state.closed {
            return None;
        }
        let breaker = state.breakers.entry(endpoint.to_string()).or_insert_with(|| {
            info!(endpoint = %endpoint, "Registering endpoint with circuit breaker");
            Arc::new(CircuitBreaker::new(endpoint, self.config.clone()))
        });
        Some(Arc::clone(breaker))
    }

    pub async fn get(&self, endpoint: &str) -> Option<Arc<CircuitBreaker>> {
        self.inner.read().await.breakers.get(endpoint).cloned()
    }

    /// Manually reset an endpoint's breaker; returns false if it is unknown
    pub async fn reset(&self, endpoint: &str) -> bool {
        match self.get(endpoint).await {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Stats for all breakers, sorted by endpoint
    pub async fn snapshot(&self) -> Vec<CircuitStats> {
        let state = self.inner.read().await;
        let mut stats: Vec<CircuitStats> = state.breakers.values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        stats
    }

    /// Drop every breaker and refuse to create new ones
    pub async fn close(&self) {
        let mut state = self.inner.write().await;
        state.closed = true;
        state.breakers.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.breakers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.breakers.is_empty()
    }
}
