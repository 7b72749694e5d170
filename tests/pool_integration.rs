//! Integration tests for the connection pool, its circuit breakers and the
//! health checker
//!
//! Sessions come from the in-memory `MockSessionFactory`; time-dependent
//! tests run on a paused tokio clock.

use futures::future::join_all;
use opcpool::pool::{
    CircuitBreakerConfig, CircuitState, CloseReason, ConnectionPool, PoolConfig, PoolError,
    PoolEvent,
};
use opcpool::session::{EndpointConfig, MockSessionFactory};
use std::sync::Arc;
use std::time::Duration;

const A: &str = "opc.tcp://plc-a.factory.local:4840";
const B: &str = "opc.tcp://plc-b.factory.local:4840";
const C: &str = "opc.tcp://plc-c.factory.local:4840";
const D: &str = "opc.tcp://plc-d.factory.local:4840";

fn pool_config(max: usize, min: usize) -> PoolConfig {
    PoolConfig {
        max_connections: max,
        min_connections: min,
        idle_timeout: Duration::from_secs(60),
        health_check_interval: Duration::from_secs(3600),
        connect_timeout: Duration::from_secs(5),
        retry_attempts: 0,
        retry_delay: Duration::from_millis(100),
    }
}

fn breaker_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 3,
        reset_timeout: Duration::from_secs(30),
        monitoring_period: Duration::from_secs(60),
        half_open_max_attempts: 2,
    }
}

fn setup(config: PoolConfig) -> (ConnectionPool, MockSessionFactory) {
    let factory = MockSessionFactory::new();
    let pool = ConnectionPool::new(config, breaker_config(), Arc::new(factory.clone()))
        .expect("valid pool config");
    (pool, factory)
}

#[tokio::test(start_paused = true)]
async fn test_pool_size_never_exceeds_max() {
    let (pool, factory) = setup(pool_config(3, 0));
    factory.set_connect_delay(Some(Duration::from_millis(10)));

    let endpoints: Vec<String> = (0..10)
        .map(|i| format!("opc.tcp://plc-{}.factory.local:4840", i))
        .collect();

    let results = join_all(endpoints.iter().map(|e| pool.get_connection(e))).await;

    let ok = results.iter().filter(|r| r.is_ok()).count();
    let exhausted = results
        .iter()
        .filter(|r| matches!(r, Err(PoolError::PoolExhausted { max: 3 })))
        .count();

    assert_eq!(ok, 3);
    assert_eq!(exhausted, 7);
    assert_eq!(pool.size().await, 3);
    assert_eq!(pool.get_metrics().await.pending_creations, 0);

    // Reuse still works at capacity
    let again = join_all(endpoints.iter().map(|e| pool.get_connection(e))).await;
    assert_eq!(again.iter().filter(|r| r.is_ok()).count(), 3);
    assert!(pool.size().await <= 3);
}

#[tokio::test]
async fn test_initialize_warms_min_connections() {
    let (pool, factory) = setup(pool_config(5, 3));
    let configs: Vec<_> = [A, B, C, D].iter().map(|e| EndpointConfig::new(*e)).collect();

    let created = pool.initialize(&configs).await.unwrap();
    assert_eq!(created, 3);

    let metrics = pool.get_metrics().await;
    assert!(metrics.active_connections >= 3);
    assert_eq!(metrics.total_connections, 3);
    assert_eq!(factory.sessions_created(), 3);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_reuse_returns_same_id_with_growing_use_count() {
    let (pool, factory) = setup(pool_config(5, 1));

    let mut last_count = 0;
    let first = pool.get_connection(A).await.unwrap();
    for _ in 0..5 {
        let conn = pool.get_connection(A).await.unwrap();
        assert_eq!(conn.id(), first.id());
        assert!(conn.use_count() > last_count);
        last_count = conn.use_count();
        pool.release_connection(conn.id()).await;
    }

    assert_eq!(factory.connect_attempts(), 1);
    assert_eq!(pool.get_metrics().await.total_use_count, 6);
}

#[tokio::test(start_paused = true)]
async fn test_idle_eviction_closes_most_idle_first() {
    let (pool, _factory) = setup(pool_config(4, 2));

    let a = pool.get_connection(A).await.unwrap().id();
    let b = pool.get_connection(B).await.unwrap().id();
    let c = pool.get_connection(C).await.unwrap().id();
    let d = pool.get_connection(D).await.unwrap().id();

    tokio::time::advance(Duration::from_secs(5)).await;
    pool.release_connection(d).await;
    tokio::time::advance(Duration::from_secs(5)).await;
    pool.release_connection(b).await;
    tokio::time::advance(Duration::from_secs(10)).await;
    pool.release_connection(c).await;

    // Idle: a=75s, d=70s, b=65s, c=55s
    tokio::time::advance(Duration::from_secs(55)).await;

    assert_eq!(pool.close_idle_connections().await, 2);

    let remaining: Vec<_> = pool.connections().await.into_iter().map(|c| c.id).collect();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.contains(&b));
    assert!(remaining.contains(&c));
    assert!(!remaining.contains(&a));

    // Already at min_connections
    assert_eq!(pool.close_idle_connections().await, 0);
    assert_eq!(pool.size().await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_idle_eviction_never_goes_below_min() {
    let (pool, factory) = setup(pool_config(4, 1));

    for endpoint in [A, B, C] {
        pool.get_connection(endpoint).await.unwrap();
    }

    tokio::time::advance(Duration::from_secs(600)).await;

    assert_eq!(pool.close_idle_connections().await, 2);
    assert_eq!(pool.size().await, 1);
    assert_eq!(factory.transports_closed(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_recently_used_connections_are_not_idle() {
    let (pool, _factory) = setup(pool_config(4, 0));

    let conn = pool.get_connection(A).await.unwrap();
    tokio::time::advance(Duration::from_secs(59)).await;
    pool.release_connection(conn.id()).await;
    tokio::time::advance(Duration::from_secs(59)).await;

    assert_eq!(pool.close_idle_connections().await, 0);
    assert_eq!(pool.size().await, 1);
}

#[tokio::test]
async fn test_breaker_opens_after_threshold() {
    let (pool, factory) = setup(pool_config(4, 0));
    factory.set_unreachable(A, true);

    for _ in 0..3 {
        let err = pool.get_connection(A).await.unwrap_err();
        assert!(matches!(err, PoolError::Connection { .. }), "got {}", err);
    }

    let err = pool.get_connection(A).await.unwrap_err();
    match err {
        PoolError::CircuitOpen { endpoint, retry_in } => {
            assert_eq!(endpoint, A);
            assert!(retry_in.is_some());
        }
        other => panic!("expected CircuitOpen, got {}", other),
    }

    assert_eq!(factory.connect_attempts(), 3);
    assert_eq!(pool.breaker_state(A).await, Some(CircuitState::Open));
    assert_eq!(pool.size().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_successes_close_breaker() {
    let (pool, factory) = setup(pool_config(4, 0));
    factory.set_unreachable(A, true);

    for _ in 0..3 {
        let _ = pool.get_connection(A).await;
    }
    assert_eq!(pool.breaker_state(A).await, Some(CircuitState::Open));

    factory.set_unreachable(A, false);
    tokio::time::advance(Duration::from_secs(31)).await;

    pool.get_connection(A).await.unwrap();
    assert_eq!(pool.breaker_state(A).await, Some(CircuitState::HalfOpen));

    pool.create_connection(&EndpointConfig::new(A)).await.unwrap();
    assert_eq!(pool.breaker_state(A).await, Some(CircuitState::Closed));

    // Behaves as Closed again
    pool.create_connection(&EndpointConfig::new(A)).await.unwrap();
    assert_eq!(pool.size().await, 3);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_failure_reopens_breaker() {
    let (pool, factory) = setup(pool_config(4, 0));
    factory.set_unreachable(A, true);

    for _ in 0..3 {
        let _ = pool.get_connection(A).await;
    }

    tokio::time::advance(Duration::from_secs(31)).await;

    // Trial call reaches the endpoint and fails
    assert!(matches!(
        pool.get_connection(A).await,
        Err(PoolError::Connection { .. })
    ));
    assert_eq!(factory.connect_attempts(), 4);
    assert_eq!(pool.breaker_state(A).await, Some(CircuitState::Open));

    // Reset timer restarted with the reopen
    tokio::time::advance(Duration::from_secs(20)).await;
    assert!(matches!(
        pool.get_connection(A).await,
        Err(PoolError::CircuitOpen { .. })
    ));
    assert_eq!(factory.connect_attempts(), 4);
}

#[tokio::test]
async fn test_manual_breaker_reset() {
    let (pool, factory) = setup(pool_config(4, 0));
    factory.set_unreachable(A, true);
    for _ in 0..3 {
        let _ = pool.get_connection(A).await;
    }

    factory.set_unreachable(A, false);
    assert!(pool.reset_breaker(A).await);
    assert!(!pool.reset_breaker(B).await);

    assert!(pool.get_connection(A).await.is_ok());
    assert_eq!(pool.breaker_state(A).await, Some(CircuitState::Closed));
}

#[tokio::test]
async fn test_failed_probes_remove_connection() {
    let (pool, factory) = setup(pool_config(4, 1));
    let mut events = pool.subscribe();

    let conn = pool.get_connection(A).await.unwrap();
    let before = pool.get_metrics().await;
    assert_eq!(before.active_connections, 1);

    factory.set_unhealthy(A, true);
    for round in 1..=3 {
        let report = pool.check_health().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.evicted, 0, "evicted too early in round {}", round);
    }

    let metrics = pool.get_metrics().await;
    assert_eq!(metrics.total_connections, 1);
    assert_eq!(metrics.total_errors, 3);

    let report = pool.check_health().await;
    assert_eq!(report.evicted, 1);

    let after = pool.get_metrics().await;
    assert_eq!(after.total_connections, 0);
    assert_eq!(after.active_connections, before.active_connections - 1);
    assert_eq!(factory.transports_closed(), 1);

    assert!(matches!(events.recv().await.unwrap(), PoolEvent::ConnectionCreated { .. }));
    assert_eq!(
        events.recv().await.unwrap(),
        PoolEvent::ConnectionClosed {
            id: conn.id(),
            endpoint: A.to_string(),
            reason: CloseReason::HealthCheckFailed,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_hung_probe_does_not_stall_other_endpoints() {
    let (pool, factory) = setup(pool_config(4, 0));
    pool.get_connection(A).await.unwrap();
    pool.get_connection(B).await.unwrap();
    let healthy = pool.get_connection(C).await.unwrap().id();

    factory.set_probe_delay(A, Some(Duration::from_secs(3600)));
    factory.set_unhealthy(B, true);

    let started = tokio::time::Instant::now();
    let report = pool.check_health().await;
    let elapsed = started.elapsed();

    assert_eq!(report.probed, 3);
    assert_eq!(report.healthy, 1);
    assert_eq!(report.failed, 2);
    // Probes run side by side, so the pass is bounded by one timeout
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_secs(6), "pass took {:?}", elapsed);

    let infos = pool.connections().await;
    let state = |endpoint: &str| {
        infos
            .iter()
            .find(|i| i.endpoint == endpoint)
            .map(|i| i.is_connected)
    };
    assert_eq!(state(A), Some(false));
    assert_eq!(state(B), Some(false));
    assert_eq!(state(C), Some(true));

    let conn = pool.get_connection(C).await.unwrap();
    assert_eq!(conn.id(), healthy);
}

#[tokio::test]
async fn test_unhealthy_connection_is_not_reused() {
    let (pool, factory) = setup(pool_config(4, 0));

    let first = pool.get_connection(A).await.unwrap();
    factory.set_unhealthy(A, true);
    pool.check_health().await;

    let second = pool.get_connection(A).await.unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(pool.size().await, 2);
}

#[tokio::test]
async fn test_probe_success_resets_errors() {
    let (pool, factory) = setup(pool_config(4, 0));
    pool.get_connection(A).await.unwrap();

    factory.set_unhealthy(A, true);
    pool.check_health().await;
    pool.check_health().await;
    assert_eq!(pool.get_metrics().await.active_connections, 0);

    factory.set_unhealthy(A, false);
    let report = pool.check_health().await;
    assert_eq!(report.healthy, 1);

    let metrics = pool.get_metrics().await;
    assert_eq!(metrics.active_connections, 1);
    assert_eq!(metrics.total_errors, 0);
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_probes_and_evicts() {
    let config = PoolConfig {
        health_check_interval: Duration::from_secs(10),
        ..pool_config(4, 1)
    };
    let (pool, factory) = setup(config);
    pool.initialize(&[EndpointConfig::new(A)]).await.unwrap();
    assert_eq!(pool.size().await, 1);

    factory.set_unhealthy(A, true);
    tokio::time::sleep(Duration::from_secs(45)).await;

    assert_eq!(factory.probes(), 4);
    assert_eq!(pool.size().await, 0);

    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_sweeps_idle_at_capacity() {
    let config = PoolConfig {
        health_check_interval: Duration::from_secs(30),
        ..pool_config(2, 0)
    };
    let (pool, _factory) = setup(config);
    pool.initialize(&[]).await.unwrap();

    pool.get_connection(A).await.unwrap();
    pool.get_connection(B).await.unwrap();

    // Ticks at 30s and 60s see nothing idle past 60s; the 90s tick does
    tokio::time::sleep(Duration::from_secs(75)).await;
    assert_eq!(pool.size().await, 2);

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(pool.size().await, 0);

    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_empties_pool_and_stops_health_checks() {
    let config = PoolConfig {
        health_check_interval: Duration::from_secs(10),
        ..pool_config(4, 2)
    };
    let (pool, factory) = setup(config);
    let mut events = pool.subscribe();

    pool.initialize(&[EndpointConfig::new(A), EndpointConfig::new(B)])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(factory.probes(), 2);

    pool.shutdown().await;

    let metrics = pool.get_metrics().await;
    assert_eq!(metrics.total_connections, 0);
    assert_eq!(factory.transports_closed(), 2);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(factory.probes(), 2);

    assert!(matches!(pool.get_connection(A).await, Err(PoolError::ShutDown)));
    assert!(pool.is_shut_down().await);

    let mut shutdown_closes = 0;
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::ConnectionClosed {
            reason: CloseReason::Shutdown,
            ..
        } = event
        {
            shutdown_closes += 1;
        }
    }
    assert_eq!(shutdown_closes, 2);
}

#[tokio::test]
async fn test_capacity_scenario() {
    let config = PoolConfig {
        idle_timeout: Duration::from_secs(300),
        ..pool_config(2, 1)
    };
    let (pool, _factory) = setup(config);
    let configs = vec![
        EndpointConfig::new(A),
        EndpointConfig::new(B),
        EndpointConfig::new(C),
    ];

    assert_eq!(pool.initialize(&configs).await.unwrap(), 1);

    pool.get_connection(A).await.unwrap();
    pool.get_connection(B).await.unwrap();
    assert_eq!(pool.size().await, 2);

    match pool.get_connection(C).await {
        Err(PoolError::PoolExhausted { max }) => assert_eq!(max, 2),
        other => panic!("expected PoolExhausted, got {:?}", other),
    }
    assert_eq!(pool.size().await, 2);

    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_capacity_freed_by_idle_eviction() {
    let (pool, _factory) = setup(pool_config(2, 1));

    pool.get_connection(A).await.unwrap();
    pool.get_connection(B).await.unwrap();

    tokio::time::advance(Duration::from_secs(120)).await;

    let conn = pool.get_connection(C).await.unwrap();
    assert_eq!(conn.endpoint(), C);
    assert_eq!(pool.size().await, 2);
}
