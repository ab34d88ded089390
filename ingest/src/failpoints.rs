use fail::fail_point;

use crate::bail;
use crate::error::{ErrorKind, IngestResult};

pub const TRANSACTION_ROLLBACK: &str = "transaction.rollback";
pub const BATCH_BEFORE_COPY_FINISH: &str = "batch.before_copy_finish";

/// Fails with an [`crate::error::IngestError`] when the named failpoint is configured with
/// `return`. The optional parameter selects the error kind.
pub fn ingest_fail_point(name: &str) -> IngestResult<()> {
    fail_point!(name, |parameter| {
        let mut error_kind = ErrorKind::QueryFailed;
        if let Some(parameter) = parameter {
            error_kind = match parameter.as_str() {
                "connection_lost" => ErrorKind::ConnectionLost,
                "transaction_aborted" => ErrorKind::TransactionAborted,
                _ => ErrorKind::QueryFailed,
            }
        }

        bail!(
            error_kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
