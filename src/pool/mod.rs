//! Connection pooling and circuit breaker module
//!
//! This module provides:
//! - Pooling of long-lived sessions to industrial protocol endpoints
//! - A circuit breaker per endpoint
//! - Periodic health probing and idle eviction
//! - Lifecycle notifications over a broadcast channel

pub mod circuit;
pub mod connection;
pub mod events;
pub mod health;

pub use circuit::{
    BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState, CircuitStats,
};
pub use connection::{
    ConnectionId, ConnectionInfo, ConnectionPool, PoolConfig, PoolError, PoolMetrics,
    PooledConnection,
};
pub use events::{CloseReason, PoolEvent};
pub use health::{HealthReport, MAX_CONSECUTIVE_PROBE_FAILURES};
