use std::collections::HashMap;
use std::fmt;

use futures::future::join_all;
use metrics::counter;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Statement};
use tracing::warn;

use crate::error::{ErrorKind, IngestError, IngestResult};
use crate::ingest_error;
use crate::metrics::INGEST_BATCH_FAILED_STATEMENTS_TOTAL;
use crate::pool::PooledConnection;
use crate::types::{Cell, Type};

#[derive(Debug, Clone)]
struct QueuedStatement {
    sql: String,
    types: Vec<Type>,
    params: Vec<Cell>,
}

/// Statements sent back to back on one connection and collected at a single point.
///
/// Every statement runs in its own implicit transaction. A failing statement does not stop the
/// ones queued after it.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    statements: Vec<QueuedStatement>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a statement whose parameter types are inferred by the server.
    pub fn queue(&mut self, sql: impl Into<String>, params: Vec<Cell>) -> &mut Self {
        self.queue_typed(sql, Vec::new(), params)
    }

    /// Queues a statement with explicit parameter types.
    pub fn queue_typed(
        &mut self,
        sql: impl Into<String>,
        types: Vec<Type>,
        params: Vec<Cell>,
    ) -> &mut Self {
        self.statements.push(QueuedStatement {
            sql: sql.into(),
            types,
            params,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Sends every queued statement and waits for all outcomes.
    ///
    /// Each distinct statement text is prepared once. The connection is discarded when the lease
    /// ends if any statement lost it.
    pub async fn execute(self, conn: &mut PooledConnection) -> PipelineReport {
        conn.mark_in_flight();
        let report = execute_statements(conn.client(), &self.statements).await;

        let connection_lost = report
            .outcomes()
            .iter()
            .filter_map(StatementOutcome::error)
            .find(|err| err.kind() == ErrorKind::ConnectionLost);
        let result = match connection_lost {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        };
        conn.mark_completed(&result);

        report
    }
}

async fn execute_statements(client: &Client, statements: &[QueuedStatement]) -> PipelineReport {
    let mut distinct: Vec<(&str, &[Type])> = Vec::new();
    let mut index_of: HashMap<(&str, &[Type]), usize> = HashMap::new();
    for statement in statements {
        let key = (statement.sql.as_str(), statement.types.as_slice());
        index_of.entry(key).or_insert_with(|| {
            distinct.push(key);
            distinct.len() - 1
        });
    }

    let prepared: Vec<Result<Statement, IngestError>> = join_all(
        distinct
            .iter()
            .map(|(sql, types)| async move { client.prepare_typed(sql, types).await }),
    )
    .await
    .into_iter()
    .map(|result| result.map_err(IngestError::from))
    .collect();

    let outcomes = join_all(statements.iter().map(|statement| {
        let key = (statement.sql.as_str(), statement.types.as_slice());
        let prepared = index_of.get(&key).and_then(|index| prepared.get(*index));
        async move {
            let statement_to_run = match prepared {
                Some(Ok(prepared)) => prepared,
                Some(Err(err)) => return StatementOutcome::Failed(err.clone()),
                None => {
                    return StatementOutcome::Failed(ingest_error!(
                        ErrorKind::InvalidState,
                        "Pipelined statement was not prepared"
                    ));
                }
            };

            let params: Vec<&(dyn ToSql + Sync)> = statement
                .params
                .iter()
                .map(|cell| cell as &(dyn ToSql + Sync))
                .collect();

            match client.execute(statement_to_run, &params).await {
                Ok(rows_affected) => StatementOutcome::Applied { rows_affected },
                Err(err) => StatementOutcome::Failed(err.into()),
            }
        }
    }))
    .await;

    PipelineReport { outcomes }
}

/// Result of one pipelined statement.
#[derive(Debug, Clone)]
pub enum StatementOutcome {
    Applied { rows_affected: u64 },
    Failed(IngestError),
}

impl StatementOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, StatementOutcome::Applied { .. })
    }

    pub fn error(&self) -> Option<&IngestError> {
        match self {
            StatementOutcome::Applied { .. } => None,
            StatementOutcome::Failed(err) => Some(err),
        }
    }
}

/// Per-statement outcomes of a pipeline, in queue order.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    outcomes: Vec<StatementOutcome>,
}

impl PipelineReport {
    pub fn outcomes(&self) -> &[StatementOutcome] {
        &self.outcomes
    }

    /// Indices of the statements that failed.
    pub fn failed_indices(&self) -> Vec<usize> {
        self.outcomes
            .iter()
            .enumerate()
            .filter(|(_, outcome)| !outcome.is_applied())
            .map(|(index, _)| index)
            .collect()
    }

    /// Rows affected by the statements that succeeded.
    pub fn rows_affected(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|outcome| match outcome {
                StatementOutcome::Applied { rows_affected } => *rows_affected,
                StatementOutcome::Failed(_) => 0,
            })
            .sum()
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(StatementOutcome::is_applied)
    }

    /// Collapses the report into the affected row count, or a
    /// [`ErrorKind::BatchPartialFailure`] naming every failed statement followed by their errors.
    pub fn into_result(self) -> IngestResult<u64> {
        let failed = self.failed_indices();
        if failed.is_empty() {
            return Ok(self.rows_affected());
        }

        counter!(INGEST_BATCH_FAILED_STATEMENTS_TOTAL).increment(failed.len() as u64);
        warn!(
            failed = failed.len(),
            total = self.outcomes.len(),
            "pipelined statements failed"
        );

        let summary = ingest_error!(
            ErrorKind::BatchPartialFailure,
            "Some pipelined statements failed",
            format!(
                "{} of {} statements failed: {}",
                failed.len(),
                self.outcomes.len(),
                FailedIndices(&failed)
            )
        );

        let mut errors = vec![summary];
        errors.extend(self.outcomes.into_iter().filter_map(|outcome| match outcome {
            StatementOutcome::Applied { .. } => None,
            StatementOutcome::Failed(err) => Some(err),
        }));

        Err(IngestError::from(errors))
    }
}

struct FailedIndices<'a>(&'a [usize]);

impl fmt::Display for FailedIndices<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (position, index) in self.0.iter().enumerate() {
            if position > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{index}")?;
        }
        write!(f, "]")
    }
}
