//! Cross-process mutual exclusion on top of Postgres session advisory locks.
//!
//! Locks belong to the session of the leased connection. They are released explicitly, or by the
//! server when the session ends, which is why a lease still holding locks is closed instead of
//! returning to the pool.

use std::fmt;
use std::time::Duration;

use aws_lc_rs::digest;
use metrics::counter;
use tokio_postgres::error::SqlState;
use tracing::{debug, warn};

use crate::bail;
use crate::error::{ErrorKind, IngestError, IngestResult};
use crate::metrics::{INGEST_LOCK_ATTEMPTS_TOTAL, OUTCOME_LABEL};
use crate::pool::PooledConnection;

/// Extra time granted to the client-side deadline over the server-side `lock_timeout`.
const CLIENT_DEADLINE_SLACK: Duration = Duration::from_millis(500);

/// Key in the database-wide 64-bit advisory lock space.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey(i64);

impl LockKey {
    pub const fn new(key: i64) -> Self {
        Self(key)
    }

    /// Derives a key from `feature:resource` so that features picking their own resource names do
    /// not collide. The key is the first 8 bytes of the SHA-256 digest, big-endian.
    pub fn namespaced(feature: &str, resource: &str) -> Self {
        let mut context = digest::Context::new(&digest::SHA256);
        context.update(feature.as_bytes());
        context.update(b":");
        context.update(resource.as_bytes());
        let digest = context.finish();

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_ref()[..8]);

        Self(i64::from_be_bytes(prefix))
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl From<i64> for LockKey {
    fn from(key: i64) -> Self {
        Self(key)
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Advisory lock client bound to one leased connection.
///
/// Advisory locks stack: acquiring a key twice requires releasing it twice.
pub struct DistributedLock<'a> {
    conn: &'a mut PooledConnection,
}

impl<'a> DistributedLock<'a> {
    pub fn new(conn: &'a mut PooledConnection) -> Self {
        Self { conn }
    }

    /// Takes the lock if it is free. Never waits.
    pub async fn try_acquire(&mut self, key: LockKey) -> IngestResult<bool> {
        self.conn.mark_in_flight();
        let result = async {
            let row = self
                .conn
                .client()
                .query_one("select pg_try_advisory_lock($1)", &[&key.value()])
                .await?;
            Ok::<bool, IngestError>(row.try_get(0)?)
        }
        .await;
        self.conn.mark_completed(&result);

        let acquired = result?;
        if acquired {
            self.conn.record_lock(key.value());
        }
        record_attempt(acquired);
        debug!(%key, acquired, "advisory lock attempt");

        Ok(acquired)
    }

    /// Waits up to `timeout` for the lock. Returns `false` if the deadline passes first.
    ///
    /// The wait is bounded by a `lock_timeout` scoped to a short transaction, and by a client-side
    /// deadline slightly longer than it. If the client-side deadline fires the session is in an
    /// unknown state and is closed when the lease ends.
    pub async fn acquire(&mut self, key: LockKey, timeout: Duration) -> IngestResult<bool> {
        if timeout.is_zero() {
            return self.try_acquire(key).await;
        }

        self.conn.mark_in_flight();
        let wait = wait_for_lock(self.conn, key, timeout);
        let outcome = tokio::time::timeout(timeout + CLIENT_DEADLINE_SLACK, wait).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(%key, ?timeout, "advisory lock wait exceeded the client deadline");
                self.conn.poison();
                Ok(false)
            }
        };
        self.conn.mark_completed(&result);

        let acquired = result?;
        if acquired {
            self.conn.record_lock(key.value());
        }
        record_attempt(acquired);
        debug!(%key, acquired, ?timeout, "advisory lock wait finished");

        Ok(acquired)
    }

    /// Waits up to `timeout` for the lock and returns a guard releasing it.
    ///
    /// Fails with [`ErrorKind::LockTimeout`] if the lock stays taken.
    pub async fn lock(&mut self, key: LockKey, timeout: Duration) -> IngestResult<LockGuard<'_>> {
        if !self.acquire(key, timeout).await? {
            bail!(
                ErrorKind::LockTimeout,
                "Advisory lock is held by another session",
                format!("lock {key} was not acquired within {timeout:?}")
            );
        }

        Ok(LockGuard {
            conn: Some(&mut *self.conn),
            key,
        })
    }

    /// Releases one acquisition of `key`. Returns `false` if this session did not hold it.
    pub async fn release(&mut self, key: LockKey) -> IngestResult<bool> {
        release_key(self.conn, key).await
    }

    /// Releases every advisory lock held by the session.
    pub async fn release_all(&mut self) -> IngestResult<()> {
        self.conn.mark_in_flight();
        let result: IngestResult<()> = self
            .conn
            .client()
            .execute("select pg_advisory_unlock_all()", &[])
            .await
            .map(|_| ())
            .map_err(IngestError::from);
        self.conn.mark_completed(&result);
        result?;

        self.conn.forget_all_locks();
        debug!("released all advisory locks");

        Ok(())
    }

    pub fn held_lock_count(&self) -> usize {
        self.conn.held_lock_count()
    }
}

/// Holds an advisory lock until [`LockGuard::release`] is called.
///
/// Dropping the guard without releasing marks the connection for closing, which makes the server
/// release the lock once the lease ends.
pub struct LockGuard<'a> {
    conn: Option<&'a mut PooledConnection>,
    key: LockKey,
}

impl LockGuard<'_> {
    pub fn key(&self) -> LockKey {
        self.key
    }

    /// Connection holding the lock, for work done under it.
    pub fn connection(&mut self) -> &mut PooledConnection {
        match &mut self.conn {
            Some(conn) => &mut **conn,
            None => unreachable!("the connection is only taken when the guard is released"),
        }
    }

    /// Releases the lock. Returns `false` if the server did not consider it held.
    pub async fn release(mut self) -> IngestResult<bool> {
        let Some(conn) = self.conn.take() else {
            return Ok(false);
        };

        release_key(conn, self.key).await
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(key = %self.key, "lock guard dropped without release, connection will be closed");
            conn.poison();
        }
    }
}

impl fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("released", &self.conn.is_none())
            .finish()
    }
}

async fn wait_for_lock(
    conn: &mut PooledConnection,
    key: LockKey,
    timeout: Duration,
) -> IngestResult<bool> {
    let lock_timeout = format!("{}ms", timeout.as_millis().max(1));

    let transaction = conn.client_mut().transaction().await?;
    transaction
        .execute(
            "select set_config('lock_timeout', $1, true)",
            &[&lock_timeout],
        )
        .await?;

    match transaction
        .execute("select pg_advisory_lock($1)", &[&key.value()])
        .await
    {
        Ok(_) => {
            // Session locks survive the commit; only the `lock_timeout` setting is reset.
            transaction.commit().await?;
            Ok(true)
        }
        Err(err) if err.code() == Some(&SqlState::LOCK_NOT_AVAILABLE) => {
            transaction.rollback().await?;
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}

async fn release_key(conn: &mut PooledConnection, key: LockKey) -> IngestResult<bool> {
    conn.mark_in_flight();
    let result = async {
        let row = conn
            .client()
            .query_one("select pg_advisory_unlock($1)", &[&key.value()])
            .await?;
        Ok::<bool, IngestError>(row.try_get(0)?)
    }
    .await;
    conn.mark_completed(&result);

    let released = result?;
    if released {
        conn.forget_lock(key.value());
    } else {
        warn!(%key, "advisory lock was not held by this session");
    }

    Ok(released)
}

fn record_attempt(acquired: bool) {
    let outcome = if acquired { "acquired" } else { "busy" };
    counter!(INGEST_LOCK_ATTEMPTS_TOTAL, OUTCOME_LABEL => outcome).increment(1);
}
