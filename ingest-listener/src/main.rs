//! Notification listener service binary.
//!
//! Subscribes to the configured Postgres notification channels and logs every event it
//! receives. One listener runs per instance name: the instance is guarded by an advisory lock
//! held for the lifetime of the process.

use crate::config::load_listener_config;
use crate::core::start_listener_with_config;
use crate::error::{ListenerError, ListenerResult};

use ingest_config::shared::ListenerConfig;
use ingest_telemetry::metrics::init_metrics;
use ingest_telemetry::tracing::init_tracing;
use tracing::{error, info};

mod config;
mod core;
mod error;

/// Entry point for the listener service.
///
/// Loads configuration, initializes tracing and metrics, starts the async runtime and runs
/// the listener until it is told to stop.
fn main() -> ListenerResult<()> {
    let listener_config = load_listener_config()?;

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME")).map_err(ListenerError::config)?;

    if listener_config.metrics_enabled {
        init_metrics(Some(&listener_config.instance_name)).map_err(ListenerError::config)?;
    } else {
        info!("metrics disabled, skipping prometheus exporter");
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(listener_config))?;

    Ok(())
}

async fn async_main(listener_config: ListenerConfig) -> ListenerResult<()> {
    if let Err(err) = start_listener_with_config(listener_config).await {
        error!("{err}");
        eprint!("{}", err.render_report());

        return Err(err);
    }

    Ok(())
}
