//! Commit-or-rollback units of work.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio_postgres::Transaction;
use tracing::{debug, error};

use crate::error::{IngestError, IngestResult};
use crate::failpoints::{TRANSACTION_ROLLBACK, ingest_fail_point};
use crate::pool::PooledConnection;

/// Runs a closure inside a database transaction.
///
/// The closure receives a shared reference to the [`Transaction`]. Committing, rolling back and
/// opening savepoints all need ownership or a mutable borrow, so the closure can only issue
/// statements, and the reference cannot escape the call.
pub struct ScopedTransaction;

impl ScopedTransaction {
    /// Begins a transaction, runs `f` and commits if it returns `Ok`.
    ///
    /// On error the transaction is rolled back and the original error is returned. If the rollback
    /// fails too, both errors are returned aggregated with the original first. A panic inside `f`
    /// rolls back and then resumes unwinding.
    ///
    /// ```ignore
    /// let count = ScopedTransaction::run(&mut conn, async |tx| {
    ///     tx.execute("insert into sites (name) values ($1)", &[&"north"]).await?;
    ///     Ok(1)
    /// })
    /// .await?;
    /// ```
    pub async fn run<T, F>(conn: &mut PooledConnection, f: F) -> IngestResult<T>
    where
        F: AsyncFnOnce(&Transaction<'_>) -> IngestResult<T>,
    {
        conn.mark_in_flight();
        let result = run_in_transaction(conn, f).await;
        conn.mark_completed(&result);

        result
    }
}

async fn run_in_transaction<T, F>(conn: &mut PooledConnection, f: F) -> IngestResult<T>
where
    F: AsyncFnOnce(&Transaction<'_>) -> IngestResult<T>,
{
    let transaction = conn.client_mut().transaction().await?;

    let outcome = AssertUnwindSafe(f(&transaction)).catch_unwind().await;

    match outcome {
        Ok(Ok(value)) => {
            transaction.commit().await?;
            Ok(value)
        }
        Ok(Err(err)) => {
            debug!(error = %err, "rolling back transaction after error");
            match rollback(transaction).await {
                Ok(()) => Err(err),
                Err(rollback_err) => {
                    error!(error = %rollback_err, "transaction rollback failed");
                    Err(IngestError::from(vec![err, rollback_err]))
                }
            }
        }
        Err(panic) => {
            if let Err(rollback_err) = rollback(transaction).await {
                error!(error = %rollback_err, "transaction rollback after panic failed");
            }
            std::panic::resume_unwind(panic)
        }
    }
}

async fn rollback(transaction: Transaction<'_>) -> IngestResult<()> {
    ingest_fail_point(TRANSACTION_ROLLBACK)?;
    transaction.rollback().await?;

    Ok(())
}
