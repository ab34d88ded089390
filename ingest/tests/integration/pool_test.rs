use std::time::Duration;

use ingest::error::{ErrorKind, IngestError};
use ingest::pool::{PgPool, PooledConnection};
use ingest::test_utils::database::{TestDatabase, spawn_database, test_pool_config};
use ingest::test_utils::notify::{DEFAULT_TEST_TIMEOUT, within};
use ingest::transaction::ScopedTransaction;
use ingest_config::shared::PoolConfig;
use ingest_telemetry::tracing::init_test_tracing;

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_acquisitions_beyond_max_are_rejected() {
    init_test_tracing();
    let database = spawn_database().await;
    let pool = database.open_pool(2).await;

    // Five callers race for two slots; the winners hold on longer than the losers wait.
    let attempts = (0..5).map(|_| {
        let pool = pool.clone();
        tokio::spawn(async move {
            let conn = pool.acquire(Duration::from_secs(1)).await?;
            tokio::time::sleep(Duration::from_secs(2)).await;
            conn.release();
            Ok::<(), IngestError>(())
        })
    });
    let results = within(DEFAULT_TEST_TIMEOUT, futures::future::join_all(attempts)).await;

    let mut succeeded = 0;
    let mut exhausted = 0;
    for result in results {
        match result.unwrap() {
            Ok(()) => succeeded += 1,
            Err(err) => {
                assert_eq!(err.kind(), ErrorKind::PoolExhausted);
                exhausted += 1;
            }
        }
    }
    assert_eq!(succeeded, 2);
    assert_eq!(exhausted, 3);

    let stats = pool.stats();
    assert!(stats.total <= 2);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.max, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn released_connections_are_reused() {
    init_test_tracing();
    let database = spawn_database().await;
    let pool = database.open_pool(1).await;

    let conn = pool.acquire_default().await.unwrap();
    let first_id = conn.id();
    assert_eq!(pool.stats().in_use, 1);
    pool.release(conn);

    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 1);

    let conn = pool.acquire_default().await.unwrap();
    assert_eq!(conn.id(), first_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn waiting_acquisition_gets_the_released_connection() {
    init_test_tracing();
    let database = spawn_database().await;
    let pool = database.open_pool(1).await;

    let held = pool.acquire_default().await.unwrap();
    let held_id = held.id();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    held.release();

    let conn = within(DEFAULT_TEST_TIMEOUT, waiter).await.unwrap().unwrap();
    assert_eq!(conn.id(), held_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn abandoned_operation_closes_the_connection() {
    init_test_tracing();
    let database = spawn_database().await;
    let pool = database.open_pool(1).await;

    let mut conn = pool.acquire_default().await.unwrap();
    let abandoned_id = conn.id();

    let cancelled = tokio::time::timeout(
        Duration::from_millis(200),
        ScopedTransaction::run(&mut conn, async |tx| {
            tx.execute("select pg_sleep(10)", &[]).await?;
            Ok(())
        }),
    )
    .await;
    assert!(cancelled.is_err());
    conn.release();

    let conn = pool.acquire_default().await.unwrap();
    assert_ne!(conn.id(), abandoned_id);
    assert!(!conn.is_broken());
}

#[tokio::test(flavor = "multi_thread")]
async fn health_check_passes_on_open_pool() {
    init_test_tracing();
    let database = spawn_database().await;
    let pool = database.open_pool(2).await;

    pool.health_check().await.unwrap();
    assert_eq!(pool.stats().in_use, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn closed_pool_rejects_acquisitions() {
    init_test_tracing();
    let database = spawn_database().await;
    let pool = database.open_pool(2).await;

    let leased = pool.acquire_default().await.unwrap();
    pool.close();
    assert!(pool.is_closed());

    let err = pool.acquire(Duration::from_secs(1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolClosed);

    // The lease outlives the close and the session is closed when it ends.
    leased.release();
    assert_eq!(pool.stats().total, 0);
    assert_eq!(pool.stats().idle, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn opening_against_missing_database_fails() {
    init_test_tracing();
    let database = spawn_database().await;

    let mut config = database.config.clone();
    config.name = format!("{}_missing", config.name);

    let err = PgPool::open(config, test_pool_config(1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
}

async fn backend_pid(conn: &PooledConnection) -> i32 {
    conn.client()
        .query_one("select pg_backend_pid()", &[])
        .await
        .unwrap()
        .get(0)
}

/// Counts the pool's sessions on the server, leaving out `excluded` backends.
async fn pool_sessions(database: &mut TestDatabase, excluded: &[i32]) -> i64 {
    let excluded = excluded
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "select count(*) from pg_stat_activity \
         where datname = '{}' and application_name = 'ingest_pool' and pid not in ({excluded})",
        database.config.name
    );
    database.query_scalar(&sql).await
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_acquisition_keeps_accounting_intact() {
    init_test_tracing();
    let database = spawn_database().await;
    let pool = database
        .open_pool_with(PoolConfig {
            health_check_period_ms: 200,
            ..test_pool_config(2)
        })
        .await;

    // Long enough idle for the next acquisition to probe the connection before handing it out.
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    let cancelled = tokio::time::timeout(Duration::ZERO, pool.acquire(Duration::from_secs(5))).await;
    assert!(cancelled.is_err());

    let stats = pool.stats();
    assert_eq!(stats.total, stats.idle + stats.in_use);
    assert_eq!(stats.in_use, 0);

    // Maintenance brings the pool back to its warm minimum.
    within(DEFAULT_TEST_TIMEOUT, async {
        while pool.stats().idle < 1 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert_eq!(pool.stats().total, 1);

    pool.health_check().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn connections_past_max_lifetime_are_replaced() {
    init_test_tracing();
    let database = spawn_database().await;
    let pool = database
        .open_pool_with(PoolConfig {
            max_lifetime_ms: 300,
            ..test_pool_config(1)
        })
        .await;

    let conn = pool.acquire_default().await.unwrap();
    let old_id = conn.id();
    conn.release();

    tokio::time::sleep(Duration::from_millis(500)).await;

    let conn = pool.acquire_default().await.unwrap();
    assert_ne!(conn.id(), old_id);
    assert_eq!(pool.stats().total, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_connections_are_recycled_by_maintenance() {
    init_test_tracing();
    let mut database = spawn_database().await;
    let pool = database
        .open_pool_with(PoolConfig {
            max_idle_ms: 500,
            health_check_period_ms: 100,
            ..test_pool_config(1)
        })
        .await;

    let conn = pool.acquire_default().await.unwrap();
    let old_id = conn.id();
    let old_pid = backend_pid(&conn).await;
    conn.release();

    // Nobody acquires here, so only maintenance can open the replacement.
    within(DEFAULT_TEST_TIMEOUT, async {
        while pool_sessions(&mut database, &[old_pid]).await < 1 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;

    let conn = pool.acquire_default().await.unwrap();
    assert_ne!(conn.id(), old_id);
    assert_eq!(pool.stats().total, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn terminated_session_is_replaced_on_acquire() {
    init_test_tracing();
    let mut database = spawn_database().await;
    let pool = database.open_pool(1).await;

    let conn = pool.acquire_default().await.unwrap();
    let old_id = conn.id();
    let pid = backend_pid(&conn).await;
    conn.release();

    database
        .run_sql(&format!("select pg_terminate_backend({pid})"))
        .await;
    tokio::time::sleep(Duration::from_millis(1_200)).await;

    let conn = pool.acquire_default().await.unwrap();
    assert_ne!(conn.id(), old_id);
    assert_ne!(backend_pid(&conn).await, pid);
    assert!(!conn.is_broken());
}

#[tokio::test(flavor = "multi_thread")]
async fn maintenance_tops_up_to_min_connections() {
    init_test_tracing();
    let mut database = spawn_database().await;
    let pool = database
        .open_pool_with(PoolConfig {
            min_connections: 2,
            health_check_period_ms: 100,
            ..test_pool_config(3)
        })
        .await;
    assert_eq!(pool.stats().total, 2);

    let first = pool.acquire_default().await.unwrap();
    let second = pool.acquire_default().await.unwrap();
    let old_pids = [backend_pid(&first).await, backend_pid(&second).await];
    first.release();
    second.release();

    for pid in old_pids {
        database
            .run_sql(&format!("select pg_terminate_backend({pid})"))
            .await;
    }

    // Nobody acquires here, so only maintenance can open the replacements.
    within(DEFAULT_TEST_TIMEOUT, async {
        while pool_sessions(&mut database, &old_pids).await < 2 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;

    let stats = pool.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.in_use, 0);
}
