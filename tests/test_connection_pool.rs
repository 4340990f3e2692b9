//! Connection pool: HTTP agent reuse and bounded database slots

use flowcore::pool::ConnectionPool;
use flowcore::{CoreError, PoolConfig};
use std::sync::Arc;
use std::time::Duration;

fn pool(max_db_connections: usize, connection_timeout: Duration) -> ConnectionPool {
    ConnectionPool::new(PoolConfig {
        max_db_connections,
        connection_timeout,
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_http_agent_reuse_per_host() {
    let pool = pool(1, Duration::from_secs(1));

    let a1 = pool.get_http_agent("https://api.example.com/v1/users").unwrap();
    let a2 = pool.get_http_agent("https://api.example.com/v1/orders?x=1").unwrap();
    let b = pool.get_http_agent("https://other.example.com/").unwrap();

    assert!(Arc::ptr_eq(&a1, &a2));
    assert!(!Arc::ptr_eq(&a1, &b));
    assert_eq!(pool.get_metrics().http.agents, 2);
}

#[tokio::test]
async fn test_http_latency_average() {
    let pool = pool(1, Duration::from_secs(1));
    let url = "https://api.example.com/search";

    for ms in [100, 200, 300] {
        pool.begin_http_request(url).unwrap();
        pool.release_http_connection(url, ms).unwrap();
    }

    let agent = pool.get_http_agent(url).unwrap();
    assert_eq!(agent.requests_served(), 3);
    assert!((agent.average_response_time_ms() - 200.0).abs() < f64::EPSILON);
    assert_eq!(pool.get_metrics().http.total_requests, 3);
}

// Five slots: the sixth acquisition times out, then succeeds once a slot frees
#[tokio::test(start_paused = true)]
async fn test_pool_exhaustion_and_recovery() {
    let pool = Arc::new(pool(5, Duration::from_millis(200)));

    let mut held = Vec::new();
    for _ in 0..5 {
        held.push(pool.acquire_db_connection().await.unwrap());
    }

    let sixth = pool.acquire_db_connection().await;
    assert!(matches!(sixth, Err(CoreError::AcquireTimeout { .. })));
    assert!(sixth.unwrap_err().is_retryable());

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire_db_connection().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let released = held.pop().unwrap();
    pool.release_db_connection(&released, 12).unwrap();

    let late = waiter.await.unwrap();
    assert!(late.is_ok());

    let metrics = pool.get_metrics().database;
    assert_eq!(metrics.acquire_timeouts, 1);
    assert_eq!(metrics.active, 5);
    assert_eq!(metrics.queries_executed, 1);
}

#[tokio::test]
async fn test_double_release_rejected() {
    let pool = pool(2, Duration::from_secs(1));
    let conn = pool.acquire_db_connection().await.unwrap();

    pool.release_db_connection(&conn, 5).unwrap();
    let again = pool.release_db_connection(&conn, 5);
    assert!(matches!(again, Err(CoreError::ConnectionNotActive { .. })));

    let metrics = pool.get_metrics().database;
    assert_eq!(metrics.double_releases, 1);
    assert_eq!(metrics.active, 0);
    assert_eq!(metrics.idle, 2);
    assert_eq!(metrics.queries_executed, 1);
}

#[tokio::test]
async fn test_shutdown_fails_acquisition() {
    let pool = pool(1, Duration::from_secs(1));
    pool.shutdown();
    assert!(pool.is_closed());
    assert!(matches!(
        pool.acquire_db_connection().await,
        Err(CoreError::PoolClosed)
    ));
}

#[tokio::test]
async fn test_metrics_idempotent() {
    let pool = pool(3, Duration::from_secs(1));
    let _conn = pool.acquire_db_connection().await.unwrap();
    pool.get_http_agent("https://a.example.com").unwrap();
    assert_eq!(pool.get_metrics(), pool.get_metrics());
}

// A holder cancelled mid-query still gives its slot back
#[tokio::test(start_paused = true)]
async fn test_cancelled_holder_frees_slot() {
    let pool = pool(1, Duration::from_millis(100));

    let cancelled = tokio::time::timeout(
        Duration::from_millis(10),
        pool.with_db_connection(|_conn| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, CoreError>(())
        }),
    )
    .await;
    assert!(cancelled.is_err());

    let metrics = pool.get_metrics().database;
    assert_eq!(metrics.active, 0);
    assert_eq!(metrics.idle, 1);
    assert!(pool.acquire_db_connection().await.is_ok());
}
