//! Logging and metrics setup shared by ingestion services and tests.

pub mod metrics;
pub mod tracing;
