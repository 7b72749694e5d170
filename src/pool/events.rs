//! Pool lifecycle notifications
//!
//! Observers (loggers, metrics exporters, dashboards) subscribe through
//! [`ConnectionPool::subscribe`](super::ConnectionPool::subscribe). Slow
//! receivers lag and skip events; they never block the pool.

use serde::Serialize;
use std::fmt;

use super::connection::ConnectionId;

/// Capacity of the lifecycle broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Why a pooled connection was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    /// Closed by an explicit `close_connection` call
    Requested,
    /// Reclaimed by idle eviction
    Idle,
    /// Too many consecutive failed health probes
    HealthCheckFailed,
    /// Pool shutdown
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::Requested => "requested",
            CloseReason::Idle => "idle",
            CloseReason::HealthCheckFailed => "health_check_failed",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    ConnectionCreated {
        id: ConnectionId,
        endpoint: String,
    },
    ConnectionClosed {
        id: ConnectionId,
        endpoint: String,
        reason: CloseReason,
    },
}
