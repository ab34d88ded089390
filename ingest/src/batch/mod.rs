//! Mass writes with a strategy chosen per batch.
//!
//! Small batches are sent as multi-row `insert` statements, large ones as a binary `COPY`.
//! Pipelined writes send one statement per row without waiting between them and report every
//! outcome, which lets callers retry individual rows.

mod inline;
mod job;
mod pipeline;
mod streaming;

use std::fmt;
use std::time::Instant;

use ingest_config::shared::BatchConfig;
use metrics::{counter, histogram};
use tracing::{debug, info};

pub use job::BatchJob;
pub use pipeline::{Pipeline, PipelineReport, StatementOutcome};
pub(crate) use streaming::copy_rows;

use crate::error::IngestResult;
use crate::metrics::{
    INGEST_BATCH_ROWS_WRITTEN_TOTAL, INGEST_BATCH_WRITE_DURATION_SECONDS, STRATEGY_LABEL,
};
use crate::pool::PooledConnection;
use crate::transaction::ScopedTransaction;

/// How the rows of a batch reach the database.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum WriteStrategy {
    /// Parameterized multi-row `insert`, chunked under the bind parameter limit.
    Inline,
    /// Binary `COPY ... FROM STDIN`.
    Streaming,
    /// One statement per row, all in flight at once.
    Pipelined,
}

impl WriteStrategy {
    /// Picks the strategy for a batch of `row_count` rows using the default threshold.
    pub fn select(row_count: usize) -> WriteStrategy {
        Self::select_with_threshold(row_count, BatchConfig::DEFAULT_STREAMING_THRESHOLD_ROWS)
    }

    /// Inline below `streaming_threshold` rows, streaming from there on. Pipelined writes are
    /// never selected automatically.
    pub fn select_with_threshold(row_count: usize, streaming_threshold: usize) -> WriteStrategy {
        if row_count < streaming_threshold {
            WriteStrategy::Inline
        } else {
            WriteStrategy::Streaming
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WriteStrategy::Inline => "inline",
            WriteStrategy::Streaming => "streaming",
            WriteStrategy::Pipelined => "pipelined",
        }
    }
}

impl fmt::Display for WriteStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Writes [`BatchJob`]s through a leased connection. Never retries.
#[derive(Debug, Clone, Default)]
pub struct BatchWriter {
    config: BatchConfig,
}

impl BatchWriter {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    /// The strategy a write would use: `explicit`, then the job's own, then the size based pick.
    pub fn strategy_for(&self, job: &BatchJob, explicit: Option<WriteStrategy>) -> WriteStrategy {
        explicit.or(job.strategy()).unwrap_or_else(|| {
            WriteStrategy::select_with_threshold(job.len(), self.config.streaming_threshold_rows)
        })
    }

    /// Writes every row of `job` and returns the number of rows written.
    ///
    /// Inline and streaming writes are all-or-nothing. A pipelined write with failed statements
    /// returns [`crate::error::ErrorKind::BatchPartialFailure`]; use
    /// [`BatchWriter::write_pipelined`] to see which rows made it.
    pub async fn write(
        &self,
        conn: &mut PooledConnection,
        job: &BatchJob,
        strategy: Option<WriteStrategy>,
    ) -> IngestResult<u64> {
        if job.is_empty() {
            return Ok(0);
        }

        let strategy = self.strategy_for(job, strategy);
        debug!(
            table = %job.table(),
            rows = job.len(),
            %strategy,
            "writing batch"
        );

        let started = Instant::now();
        let written = match strategy {
            WriteStrategy::Inline => self.write_inline(conn, job).await?,
            WriteStrategy::Streaming => self.write_streaming(conn, job).await?,
            WriteStrategy::Pipelined => self.write_pipelined(conn, job).await.into_result()?,
        };

        counter!(INGEST_BATCH_ROWS_WRITTEN_TOTAL, STRATEGY_LABEL => strategy.as_str())
            .increment(written);
        histogram!(INGEST_BATCH_WRITE_DURATION_SECONDS, STRATEGY_LABEL => strategy.as_str())
            .record(started.elapsed().as_secs_f64());

        info!(table = %job.table(), rows = written, %strategy, "batch written");

        Ok(written)
    }

    /// Sends one `insert` per row in a single pipeline and returns every outcome.
    pub async fn write_pipelined(
        &self,
        conn: &mut PooledConnection,
        job: &BatchJob,
    ) -> PipelineReport {
        let sql = inline::insert_statement(job.table(), job.columns(), 1);
        let types = job.column_types();

        let mut pipeline = Pipeline::new();
        for row in job.rows() {
            pipeline.queue_typed(sql.clone(), types.clone(), row.values().to_vec());
        }

        pipeline.execute(conn).await
    }

    async fn write_inline(&self, conn: &mut PooledConnection, job: &BatchJob) -> IngestResult<u64> {
        let chunk_size = inline::max_rows_per_statement(job.columns().len());

        if job.len() <= chunk_size {
            conn.mark_in_flight();
            let result =
                inline::insert_rows(conn.client(), job.table(), job.columns(), job.rows()).await;
            conn.mark_completed(&result);

            return result;
        }

        // Several statements, one transaction: the job lands whole or not at all.
        ScopedTransaction::run(conn, async |transaction| {
            let mut written = 0;
            for chunk in job.rows().chunks(chunk_size) {
                written +=
                    inline::insert_rows(transaction, job.table(), job.columns(), chunk).await?;
            }
            Ok(written)
        })
        .await
    }

    async fn write_streaming(
        &self,
        conn: &mut PooledConnection,
        job: &BatchJob,
    ) -> IngestResult<u64> {
        let table = job.table().as_quoted_identifier();
        let types = job.column_types();

        conn.mark_in_flight();
        let result = copy_rows(conn.client(), &table, job.column_names(), &types, job.rows()).await;
        conn.mark_completed(&result);

        result
    }
}
