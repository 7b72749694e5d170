//! Health probing and idle eviction
//!
//! A [`HealthChecker`] task ticks every `health_check_interval`, probes
//! every pooled connection, and reclaims idle connections when the pool is
//! at capacity. It holds only a weak reference to the pool, so dropping the
//! last pool handle ends the loop even without an explicit shutdown.

use futures::future::join_all;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{ConnectionId, ConnectionPool, PoolEntry, PoolInner};
use super::events::CloseReason;
use crate::session::SessionError;

/// A connection is removed once its consecutive probe failures exceed this
pub const MAX_CONSECUTIVE_PROBE_FAILURES: u32 = 3;

/// Outcome of one health check pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub probed: usize,
    pub healthy: usize,
    pub failed: usize,
    pub evicted: usize,
}

/// Periodic health check task
pub(super) struct HealthChecker {
    pool: Weak<PoolInner>,
    interval: Duration,
    cancel: CancellationToken,
}

impl HealthChecker {
    pub(super) fn new(pool: Weak<PoolInner>, interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            pool,
            interval,
            cancel,
        }
    }

    /// Spawn the loop. It runs until the token is cancelled or the pool is dropped.
    pub(super) fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.interval.as_secs(),
                "Health checker started"
            );

            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(inner) = self.pool.upgrade() else {
                    break;
                };
                let pool = ConnectionPool::from_inner(inner);

                let start = Instant::now();
                let report = pool.check_health().await;
                let reclaimed = pool.sweep_idle_at_capacity().await;

                debug!(
                    probed = report.probed,
                    failed = report.failed,
                    evicted = report.evicted,
                    reclaimed = reclaimed,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Health check cycle completed"
                );
            }

            info!("Health checker stopped");
        })
    }
}

impl ConnectionPool {
    /// Probe every pooled connection once.
    ///
    /// Probes run concurrently, each bounded by `connect_timeout`; results are
    /// applied afterwards one by one. Connections past
    /// [`MAX_CONSECUTIVE_PROBE_FAILURES`] are closed.
    pub async fn check_health(&self) -> HealthReport {
        let targets: Vec<_> = {
            let state = self.inner.state.lock().await;
            if state.shutdown {
                return HealthReport::default();
            }
            state
                .entries
                .values()
                .map(|e| (e.id, e.endpoint.clone(), Arc::clone(&e.session)))
                .collect()
        };

        if targets.is_empty() {
            return HealthReport::default();
        }

        let timeout = self.inner.config.connect_timeout;
        let handles: Vec<_> = targets
            .iter()
            .map(|(_, _, session)| {
                let session = Arc::clone(session);
                tokio::spawn(async move {
                    match tokio::time::timeout(timeout, session.probe()).await {
                        Ok(result) => result,
                        Err(_) => Err(SessionError::Timeout(timeout)),
                    }
                })
            })
            .collect();

        let results = join_all(handles).await;

        let mut report = HealthReport {
            probed: targets.len(),
            ..HealthReport::default()
        };
        let mut removed: Vec<PoolEntry> = Vec::new();
        {
            let mut state = self.inner.state.lock().await;
            for ((id, endpoint, _), joined) in targets.iter().zip(results) {
                let outcome = joined.unwrap_or_else(|e| {
                    Err(SessionError::Session(format!("probe task failed: {}", e)))
                });

                // Closed or evicted while probing
                let Some(entry) = state.entries.get_mut(id) else {
                    continue;
                };

                match outcome {
                    Ok(()) => {
                        if !entry.is_connected {
                            info!(endpoint = %endpoint, id = %id, "Connection recovered");
                        }
                        entry.is_connected = true;
                        entry.consecutive_errors = 0;
                        report.healthy += 1;
                    }
                    Err(e) => {
                        entry.is_connected = false;
                        entry.consecutive_errors += 1;
                        report.failed += 1;
                        warn!(
                            endpoint = %endpoint,
                            id = %id,
                            consecutive_errors = entry.consecutive_errors,
                            error = %e,
                            "Health probe failed"
                        );

                        if entry.consecutive_errors > MAX_CONSECUTIVE_PROBE_FAILURES {
                            if let Some(entry) = state.entries.remove(id) {
                                removed.push(entry);
                            }
                        }
                    }
                }
            }
        }

        report.evicted = removed.len();
        for entry in removed {
            self.finish_close(entry, CloseReason::HealthCheckFailed).await;
        }

        report
    }

    /// Close connections idle past `idle_timeout`, most idle first, never
    /// going below `min_connections`. Returns how many were closed.
    pub async fn close_idle_connections(&self) -> usize {
        let victims: Vec<PoolEntry> = {
            let mut state = self.inner.state.lock().await;
            let now = Instant::now();
            let allowed = state
                .entries
                .len()
                .saturating_sub(self.inner.config.min_connections);

            let idle: Vec<(ConnectionId, Duration)> = state
                .entries
                .values()
                .map(|e| (e.id, now.saturating_duration_since(e.last_used)))
                .collect();

            select_idle_victims(idle, self.inner.config.idle_timeout, allowed)
                .into_iter()
                .filter_map(|id| state.entries.remove(&id))
                .collect()
        };

        let closed = victims.len();
        for entry in victims {
            self.finish_close(entry, CloseReason::Idle).await;
        }

        if closed > 0 {
            info!(closed = closed, "Closed idle connections");
        }
        closed
    }

    async fn sweep_idle_at_capacity(&self) -> usize {
        if self.size().await < self.inner.config.max_connections {
            return 0;
        }
        self.close_idle_connections().await
    }
}

/// Pick which connections to evict: idle longer than `idle_timeout`, most
/// idle first, at most `allowed` of them.
fn select_idle_victims(
    mut idle: Vec<(ConnectionId, Duration)>,
    idle_timeout: Duration,
    allowed: usize,
) -> Vec<ConnectionId> {
    idle.retain(|(_, idle_for)| *idle_for > idle_timeout);
    idle.sort_by(|a, b| b.1.cmp(&a.1));
    idle.truncate(allowed);
    idle.into_iter().map(|(id, _)| id).collect()
}
