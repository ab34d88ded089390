use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tracing::{info, trace};

/// Port the Prometheus scrape endpoint listens on.
pub const METRICS_PORT: u16 = 9000;

/// How often histogram buckets are drained to bound memory.
const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

// Installing a recorder is process-global and fails on the second attempt, which tests hit.
static INSTALLED: Mutex<bool> = Mutex::new(false);

/// Installs the Prometheus recorder and serves `[::]:9000/metrics`.
///
/// `instance` becomes a global `instance` label so several deployments can share one
/// Prometheus. Calling this more than once is a no-op.
pub fn init_metrics(instance: Option<&str>) -> Result<(), BuildError> {
    let mut installed = INSTALLED.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if *installed {
        return Ok(());
    }

    let mut builder = PrometheusBuilder::new()
        .with_http_listener(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), METRICS_PORT))
        .upkeep_timeout(UPKEEP_INTERVAL);

    if let Some(instance) = instance {
        builder = builder.add_global_label("instance", instance);
    }

    builder.install()?;
    *installed = true;

    trace!(upkeep_interval = ?UPKEEP_INTERVAL, "metrics upkeep scheduled");
    info!(port = METRICS_PORT, "prometheus exporter listening");

    Ok(())
}
