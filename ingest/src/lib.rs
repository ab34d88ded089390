//! Bulk ingestion and coordination layer for Postgres.
//!
//! The crate is built around a [`pool::PgPool`] of leased connections. On top of a lease callers
//! run [`transaction::ScopedTransaction`]s, write rows through the [`batch::BatchWriter`], apply
//! staged updates with the [`merge::MergeCoordinator`] and serialize workers with a
//! [`lock::DistributedLock`]. Change events travel through the [`notify::NotificationBus`], which
//! owns a dedicated listening connection.

pub mod batch;
pub mod concurrency;
pub mod error;
pub mod failpoints;
pub mod lock;
mod macros;
pub mod merge;
pub mod metrics;
pub mod notify;
pub mod pool;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transaction;
pub mod types;
