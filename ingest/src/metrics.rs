//! Metric names recorded by the ingestion layer.

/// Label for the write strategy of a batch.
pub const STRATEGY_LABEL: &str = "strategy";

/// Label for the outcome of a lock attempt.
pub const OUTCOME_LABEL: &str = "outcome";

/// Label for the reason a connection was discarded.
pub const REASON_LABEL: &str = "reason";

// Pool metrics

/// Counter for successful connection acquisitions.
pub const INGEST_POOL_ACQUISITIONS_TOTAL: &str = "ingest_pool_acquisitions_total";

/// Counter for acquisitions that timed out waiting for a free slot.
pub const INGEST_POOL_EXHAUSTED_TOTAL: &str = "ingest_pool_exhausted_total";

/// Counter for connections closed instead of being returned to the free list.
pub const INGEST_POOL_DISCARDED_TOTAL: &str = "ingest_pool_discarded_total";

/// Gauge for the number of live connections.
pub const INGEST_POOL_CONNECTIONS: &str = "ingest_pool_connections";

/// Histogram for the time spent waiting in `acquire`, in seconds.
pub const INGEST_POOL_ACQUIRE_DURATION_SECONDS: &str = "ingest_pool_acquire_duration_seconds";

// Batch metrics

/// Counter for rows written, labelled by strategy.
pub const INGEST_BATCH_ROWS_WRITTEN_TOTAL: &str = "ingest_batch_rows_written_total";

/// Counter for pipelined statements that failed.
pub const INGEST_BATCH_FAILED_STATEMENTS_TOTAL: &str = "ingest_batch_failed_statements_total";

/// Histogram for the duration of a batch write, in seconds.
pub const INGEST_BATCH_WRITE_DURATION_SECONDS: &str = "ingest_batch_write_duration_seconds";

// Merge metrics

/// Counter for rows updated by merges.
pub const INGEST_MERGE_ROWS_UPDATED_TOTAL: &str = "ingest_merge_rows_updated_total";

// Lock metrics

/// Counter for lock attempts, labelled by outcome.
pub const INGEST_LOCK_ATTEMPTS_TOTAL: &str = "ingest_lock_attempts_total";

// Notification metrics

/// Counter for notifications handed to subscriber queues.
pub const INGEST_NOTIFICATIONS_DELIVERED_TOTAL: &str = "ingest_notifications_delivered_total";

/// Counter for subscribers terminated because their queue stayed full.
pub const INGEST_NOTIFICATION_OVERFLOWS_TOTAL: &str = "ingest_notification_overflows_total";

/// Counter for notifications published.
pub const INGEST_NOTIFICATIONS_PUBLISHED_TOTAL: &str = "ingest_notifications_published_total";
