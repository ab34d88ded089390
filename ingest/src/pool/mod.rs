//! Bounded pool of Postgres connections.
//!
//! [`PgPool`] is a cheaply cloneable handle. Leases are bounded by a semaphore with
//! `max_connections` permits; idle sessions wait in a mutex-guarded free list. A background task
//! recycles idle sessions past their lifetime or idle limit and tops the pool back up to
//! `min_connections`.

mod connect;
mod connection;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use ingest_config::shared::{INGEST_POOL_OPTIONS, PgConnectionConfig, PoolConfig};
use metrics::{counter, gauge, histogram};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub use connection::PooledConnection;
pub(crate) use connect::{build_tls_config, connect, connect_error};

use crate::bail;
use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::error::{ErrorKind, IngestResult};
use crate::metrics::{
    INGEST_POOL_ACQUIRE_DURATION_SECONDS, INGEST_POOL_ACQUISITIONS_TOTAL, INGEST_POOL_CONNECTIONS,
    INGEST_POOL_DISCARDED_TOTAL, INGEST_POOL_EXHAUSTED_TOTAL, REASON_LABEL,
};
use connection::{DiscardReason, PgConnection};

/// Idle time after which a connection is probed with `SELECT 1` before being handed out.
const PROBE_AFTER_IDLE: Duration = Duration::from_secs(1);

/// Point-in-time view of the pool's accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Live connections, idle and leased.
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max: usize,
}

pub(crate) struct PoolInner {
    connection_config: PgConnectionConfig,
    pool_config: PoolConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<PgConnection>>,
    total: AtomicUsize,
    in_use: AtomicUsize,
    closed: AtomicBool,
    next_id: AtomicU64,
    shutdown_tx: ShutdownTx,
}

impl PoolInner {
    fn idle_list(&self) -> MutexGuard<'_, VecDeque<PgConnection>> {
        // The free list holds no invariant a panicking holder could break.
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn lease_ended(&self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn push_idle(&self, conn: PgConnection) {
        let mut idle = self.idle_list();
        // `close` may have drained the list after the lease checked the flag.
        if self.is_closed() {
            drop(idle);
            self.discard(conn, DiscardReason::PoolClosed);
            return;
        }
        idle.push_back(conn);
    }

    pub(crate) fn discard(&self, conn: PgConnection, reason: DiscardReason) {
        debug!(connection_id = conn.id, reason = reason.as_str(), "discarding connection");
        drop(conn);

        let total = self.total.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        counter!(INGEST_POOL_DISCARDED_TOTAL, REASON_LABEL => reason.as_str()).increment(1);
        gauge!(INGEST_POOL_CONNECTIONS).set(total as f64);
    }

    fn is_expired(&self, conn: &PgConnection) -> bool {
        conn.created_at.elapsed() >= self.pool_config.max_lifetime()
            || conn.last_used.elapsed() >= self.pool_config.max_idle()
    }

    async fn open_connection(&self) -> IngestResult<PgConnection> {
        let connect = connect(&self.connection_config, &INGEST_POOL_OPTIONS);
        let client = match tokio::time::timeout(self.pool_config.connect_timeout(), connect).await
        {
            Ok(client) => client?,
            Err(_) => bail!(
                ErrorKind::ConnectionFailed,
                "Timed out connecting to postgres",
                format!(
                    "no connection established within {:?}",
                    self.pool_config.connect_timeout()
                )
            ),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let total = self.total.fetch_add(1, Ordering::AcqRel) + 1;
        gauge!(INGEST_POOL_CONNECTIONS).set(total as f64);

        Ok(PgConnection::new(id, client))
    }

    /// Pops idle connections until one passes its checks, probing within what is left of
    /// `timeout` since `started`.
    async fn take_idle(&self, started: Instant, timeout: Duration) -> Option<PgConnection> {
        loop {
            let conn = self.idle_list().pop_back()?;

            if conn.client.is_closed() {
                self.discard(conn, DiscardReason::Closed);
                continue;
            }
            if self.is_expired(&conn) {
                self.discard(conn, DiscardReason::Expired);
                continue;
            }
            if conn.last_used.elapsed() < PROBE_AFTER_IDLE {
                return Some(conn);
            }

            let checkout = Checkout::new(self, conn);
            let budget = probe_budget(self.pool_config.connect_timeout(), timeout, started.elapsed());
            let alive = self.probe(checkout.connection(), budget).await;
            let conn = checkout.finish();
            if !alive {
                self.discard(conn, DiscardReason::ProbeFailed);
                continue;
            }

            return Some(conn);
        }
    }

    async fn probe(&self, conn: &PgConnection, budget: Duration) -> bool {
        let probe = conn.client.simple_query("select 1");
        match tokio::time::timeout(budget, probe).await {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                warn!(connection_id = conn.id, error = %err, "liveness probe failed");
                false
            }
            Err(_) => {
                warn!(connection_id = conn.id, "liveness probe timed out");
                false
            }
        }
    }

    /// Closes expired idle connections and tops the pool up to `min_connections`.
    async fn maintain(&self) {
        let expired: Vec<PgConnection> = {
            let mut idle = self.idle_list();
            let (expired, kept): (Vec<_>, Vec<_>) = idle
                .drain(..)
                .partition(|conn| conn.client.is_closed() || self.is_expired(conn));
            idle.extend(kept);
            expired
        };
        for conn in expired {
            let reason = if conn.client.is_closed() {
                DiscardReason::Closed
            } else {
                DiscardReason::Expired
            };
            self.discard(conn, reason);
        }

        let min_connections = self.pool_config.min_connections as usize;
        while !self.is_closed() && self.total.load(Ordering::Acquire) < min_connections {
            // New sessions are opened under a permit so the pool never exceeds its maximum.
            let Ok(_permit) = self.semaphore.clone().try_acquire_owned() else {
                break;
            };

            match self.open_connection().await {
                Ok(conn) => self.push_idle(conn),
                Err(err) => {
                    warn!(error = %err, "failed to replenish connection pool");
                    break;
                }
            }
        }
    }
}

/// A connection taken off the free list while it is being probed.
///
/// Dropped before [`Checkout::finish`], which happens when the acquiring future is cancelled, the
/// connection is discarded so that the pool's count stays right.
struct Checkout<'a> {
    pool: &'a PoolInner,
    conn: Option<PgConnection>,
}

impl<'a> Checkout<'a> {
    fn new(pool: &'a PoolInner, conn: PgConnection) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }

    fn connection(&self) -> &PgConnection {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("the connection is only taken by `finish`"),
        }
    }

    fn finish(mut self) -> PgConnection {
        match self.conn.take() {
            Some(conn) => conn,
            None => unreachable!("the connection is only taken by `finish`"),
        }
    }
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn, DiscardReason::InFlight);
        }
    }
}

/// Time a liveness probe may take: the connect timeout, cut short by what is left of the acquire's.
fn probe_budget(connect_timeout: Duration, timeout: Duration, elapsed: Duration) -> Duration {
    connect_timeout.min(timeout.saturating_sub(elapsed))
}

/// Handle to a bounded pool of Postgres connections.
#[derive(Clone)]
pub struct PgPool {
    inner: Arc<PoolInner>,
}

impl PgPool {
    /// Opens the pool, establishing `min_connections` sessions (at least one, to verify that the
    /// database is reachable), and starts the maintenance task.
    pub async fn open(
        connection_config: PgConnectionConfig,
        pool_config: PoolConfig,
    ) -> IngestResult<Self> {
        connection_config.validate()?;
        pool_config.validate()?;

        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(pool_config.max_connections as usize)),
            idle: Mutex::new(VecDeque::new()),
            total: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            shutdown_tx,
            connection_config,
            pool_config,
        });

        let warm = inner.pool_config.min_connections.max(1) as usize;
        let connections =
            futures::future::try_join_all((0..warm).map(|_| inner.open_connection())).await?;
        for conn in connections {
            inner.push_idle(conn);
        }

        tokio::spawn(run_maintenance(Arc::downgrade(&inner), shutdown_rx));

        info!(
            host = %inner.connection_config.host,
            database = %inner.connection_config.name,
            warm_connections = warm,
            max_connections = inner.pool_config.max_connections,
            "connection pool opened"
        );

        Ok(Self { inner })
    }

    /// Leases a connection, waiting at most `timeout` for a free slot.
    ///
    /// Fails with [`ErrorKind::PoolExhausted`] when every slot stays taken for the whole wait and
    /// with [`ErrorKind::PoolClosed`] after [`PgPool::close`].
    pub async fn acquire(&self, timeout: Duration) -> IngestResult<PooledConnection> {
        let started = Instant::now();

        let permit = self.acquire_permit(timeout).await?;

        let conn = match self.inner.take_idle(started, timeout).await {
            Some(conn) => conn,
            None => {
                let remaining = timeout.saturating_sub(started.elapsed());
                match tokio::time::timeout(remaining, self.inner.open_connection()).await {
                    Ok(conn) => conn?,
                    Err(_) => {
                        counter!(INGEST_POOL_EXHAUSTED_TOTAL).increment(1);
                        bail!(
                            ErrorKind::PoolExhausted,
                            "No connection available",
                            format!("a new connection could not be opened within {timeout:?}")
                        )
                    }
                }
            }
        };

        // `close` may have run while the connection was being checked or opened.
        if self.inner.is_closed() {
            self.inner.discard(conn, DiscardReason::PoolClosed);
            bail!(ErrorKind::PoolClosed, "Connection pool is closed");
        }

        self.inner.in_use.fetch_add(1, Ordering::AcqRel);
        counter!(INGEST_POOL_ACQUISITIONS_TOTAL).increment(1);
        histogram!(INGEST_POOL_ACQUIRE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        Ok(PooledConnection::new(conn, self.inner.clone(), permit))
    }

    /// Leases a connection with the configured `acquire_timeout_ms`.
    pub async fn acquire_default(&self) -> IngestResult<PooledConnection> {
        self.acquire(self.inner.pool_config.acquire_timeout()).await
    }

    async fn acquire_permit(&self, timeout: Duration) -> IngestResult<OwnedSemaphorePermit> {
        if self.inner.is_closed() {
            bail!(ErrorKind::PoolClosed, "Connection pool is closed");
        }

        let acquire = self.inner.semaphore.clone().acquire_owned();
        match tokio::time::timeout(timeout, acquire).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => bail!(ErrorKind::PoolClosed, "Connection pool is closed"),
            Err(_) => {
                counter!(INGEST_POOL_EXHAUSTED_TOTAL).increment(1);
                bail!(
                    ErrorKind::PoolExhausted,
                    "No connection available",
                    format!(
                        "all {} connections stayed in use for {timeout:?}",
                        self.inner.pool_config.max_connections
                    )
                )
            }
        }
    }

    /// Ends a lease. Same as dropping the connection.
    pub fn release(&self, conn: PooledConnection) {
        conn.release();
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.inner.idle_list().len();
        PoolStats {
            total: self.inner.total.load(Ordering::Acquire),
            idle,
            in_use: self.inner.in_use.load(Ordering::Acquire),
            max: self.inner.pool_config.max_connections as usize,
        }
    }

    /// Runs `select 1` on a leased connection.
    pub async fn health_check(&self) -> IngestResult<()> {
        let mut conn = self.acquire_default().await?;

        conn.mark_in_flight();
        let result: IngestResult<()> = conn
            .client()
            .simple_query("select 1")
            .await
            .map(|_| ())
            .map_err(Into::into);
        conn.mark_completed(&result);

        result
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Closes every idle connection and rejects further acquisitions with
    /// [`ErrorKind::PoolClosed`]. Leased connections are closed when their lease ends.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.semaphore.close();
        self.inner.shutdown_tx.shutdown();

        let drained: Vec<PgConnection> = self.inner.idle_list().drain(..).collect();
        let count = drained.len();
        for conn in drained {
            self.inner.discard(conn, DiscardReason::PoolClosed);
        }

        info!(closed_connections = count, "connection pool closed");
    }
}

impl std::fmt::Debug for PgPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgPool").field("stats", &self.stats()).finish()
    }
}

async fn run_maintenance(pool: Weak<PoolInner>, mut shutdown_rx: ShutdownRx) {
    let period = match pool.upgrade() {
        Some(inner) => inner.pool_config.health_check_period(),
        None => return,
    };

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.wait() => {
                debug!("pool maintenance task stopped");
                return;
            }
            _ = interval.tick() => {
                let Some(inner) = pool.upgrade() else {
                    return;
                };
                inner.maintain().await;
            }
        }
    }
}
