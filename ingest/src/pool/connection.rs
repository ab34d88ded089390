use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::OwnedSemaphorePermit;
use tokio_postgres::Client;
use tracing::warn;

use crate::error::{ErrorKind, IngestResult};
use crate::pool::PoolInner;

/// A live Postgres session owned by the pool.
pub(crate) struct PgConnection {
    pub(crate) id: u64,
    pub(crate) client: Client,
    pub(crate) created_at: Instant,
    pub(crate) last_used: Instant,
}

impl PgConnection {
    pub(crate) fn new(id: u64, client: Client) -> Self {
        let now = Instant::now();
        Self {
            id,
            client,
            created_at: now,
            last_used: now,
        }
    }
}

/// Why a connection leaves the pool instead of returning to the free list.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum DiscardReason {
    Closed,
    InFlight,
    Poisoned,
    HoldsLocks,
    PoolClosed,
    Expired,
    ProbeFailed,
}

impl DiscardReason {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::Closed => "closed",
            DiscardReason::InFlight => "in_flight",
            DiscardReason::Poisoned => "poisoned",
            DiscardReason::HoldsLocks => "holds_locks",
            DiscardReason::PoolClosed => "pool_closed",
            DiscardReason::Expired => "expired",
            DiscardReason::ProbeFailed => "probe_failed",
        }
    }
}

/// A connection leased from a [`crate::pool::PgPool`].
///
/// The lease is exclusive to its holder and ends with [`PooledConnection::release`] or when the
/// value is dropped, whichever comes first. Connections that may carry session state the next
/// lessee must not see are closed instead of being returned: an operation of this crate was
/// abandoned midway, the connection failed with [`ErrorKind::ConnectionLost`], or advisory locks
/// are still held.
pub struct PooledConnection {
    conn: Option<PgConnection>,
    pool: Arc<PoolInner>,
    in_flight: bool,
    poisoned: bool,
    held_locks: HashMap<i64, u32>,
    // Released after the connection went back to the free list.
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub(crate) fn new(conn: PgConnection, pool: Arc<PoolInner>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn: Some(conn),
            pool,
            in_flight: false,
            poisoned: false,
            held_locks: HashMap::new(),
            _permit: permit,
        }
    }

    fn connection(&self) -> &PgConnection {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("the connection is only taken when the lease ends"),
        }
    }

    fn connection_mut(&mut self) -> &mut PgConnection {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("the connection is only taken when the lease ends"),
        }
    }

    /// Identifier of the underlying session, stable for its lifetime.
    pub fn id(&self) -> u64 {
        self.connection().id
    }

    pub fn client(&self) -> &Client {
        &self.connection().client
    }

    /// Mutable access, needed to open a transaction on the client.
    pub fn client_mut(&mut self) -> &mut Client {
        &mut self.connection_mut().client
    }

    /// Returns `true` if the session is known to be unusable.
    pub fn is_broken(&self) -> bool {
        self.poisoned || self.connection().client.is_closed()
    }

    /// Number of advisory locks taken through this lease and not yet released.
    pub fn held_lock_count(&self) -> usize {
        self.held_locks.values().map(|count| *count as usize).sum()
    }

    /// Ends the lease. Equivalent to dropping the value.
    pub fn release(self) {
        drop(self);
    }

    pub(crate) fn mark_in_flight(&mut self) {
        self.in_flight = true;
    }

    /// Clears the in-flight mark and poisons the connection if the operation lost it.
    pub(crate) fn mark_completed<T>(&mut self, result: &IngestResult<T>) {
        self.in_flight = false;
        if let Err(err) = result
            && err.kinds().contains(&ErrorKind::ConnectionLost)
        {
            self.poisoned = true;
        }
    }

    /// Marks the session as unfit for reuse. It is closed when the lease ends.
    pub(crate) fn poison(&mut self) {
        self.poisoned = true;
    }

    pub(crate) fn record_lock(&mut self, key: i64) {
        *self.held_locks.entry(key).or_default() += 1;
    }

    /// Forgets one acquisition of `key`. Returns `false` if it was not held.
    pub(crate) fn forget_lock(&mut self, key: i64) -> bool {
        match self.held_locks.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.held_locks.remove(&key);
                true
            }
            None => false,
        }
    }

    pub(crate) fn forget_all_locks(&mut self) {
        self.held_locks.clear();
    }

    fn discard_reason(&self, conn: &PgConnection) -> Option<DiscardReason> {
        if self.pool.is_closed() {
            Some(DiscardReason::PoolClosed)
        } else if conn.client.is_closed() {
            Some(DiscardReason::Closed)
        } else if self.in_flight {
            Some(DiscardReason::InFlight)
        } else if self.poisoned {
            Some(DiscardReason::Poisoned)
        } else if !self.held_locks.is_empty() {
            Some(DiscardReason::HoldsLocks)
        } else {
            None
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };

        self.pool.lease_ended();

        match self.discard_reason(&conn) {
            Some(reason) => {
                if reason == DiscardReason::HoldsLocks {
                    warn!(
                        connection_id = conn.id,
                        held_locks = self.held_locks.len(),
                        "connection returned while holding advisory locks, closing it"
                    );
                }
                self.pool.discard(conn, reason);
            }
            None => {
                conn.last_used = Instant::now();
                self.pool.push_idle(conn);
            }
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.conn.as_ref().map(|conn| conn.id))
            .field("in_flight", &self.in_flight)
            .field("poisoned", &self.poisoned)
            .field("held_locks", &self.held_locks)
            .finish()
    }
}
