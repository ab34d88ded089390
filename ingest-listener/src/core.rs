use futures::{Stream, StreamExt};
use futures::stream::select_all;
use ingest::concurrency::shutdown::{ShutdownRx, create_shutdown_channel};
use ingest::error::{ErrorKind, IngestResult};
use ingest::ingest_error;
use ingest::lock::{DistributedLock, LockKey};
use ingest::notify::{NotificationBus, NotificationEvent, Subscription};
use ingest::pool::PgPool;
use ingest_config::shared::{ListenerConfig, NotificationConfig, PgConnectionConfig, PoolConfig};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info, warn};

use crate::error::ListenerResult;

/// Lock namespace shared by every listener deployment.
const LISTENER_LOCK_FEATURE: &str = "ingest-listener";

/// Starts the listener service with the provided configuration.
///
/// Opens the pool, takes the instance lock so that a single listener runs per instance name,
/// then logs every notification received on the configured channels until a shutdown signal
/// arrives or the listening connection is lost.
pub async fn start_listener_with_config(config: ListenerConfig) -> ListenerResult<()> {
    info!("starting listener service");

    log_config(&config);

    let pool = PgPool::open(config.connection.clone(), config.pool.clone()).await?;
    let result = run_with_pool(&config, &pool).await;
    pool.close();

    info!("listener service completed");

    result
}

async fn run_with_pool(config: &ListenerConfig, pool: &PgPool) -> ListenerResult<()> {
    let key = LockKey::namespaced(LISTENER_LOCK_FEATURE, &config.instance_name);
    let mut conn = pool.acquire_default().await?;
    let mut lock = DistributedLock::new(&mut conn);

    if !lock.acquire(key, config.pool.acquire_timeout()).await? {
        let err = ingest_error!(
            ErrorKind::LockTimeout,
            "Another listener instance is running",
            format!(
                "instance '{}' is locked by another session (lock {key})",
                config.instance_name
            )
        );
        return Err(err.into());
    }
    info!(instance = %config.instance_name, %key, "instance lock acquired");

    let result = listen(config).await;

    // Locks end with the session too, so a failed release only delays the next instance.
    match lock.release(key).await {
        Ok(_) => info!(%key, "instance lock released"),
        Err(err) => warn!(%key, error = %err, "failed to release instance lock"),
    }

    result
}

async fn listen(config: &ListenerConfig) -> ListenerResult<()> {
    let bus = NotificationBus::connect(&config.connection, config.notification.clone()).await?;

    let mut subscriptions: Vec<Subscription> = Vec::with_capacity(config.channels.len());
    for channel in &config.channels {
        subscriptions.push(bus.subscribe(channel).await?);
        info!(%channel, "subscribed");
    }

    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let mut sigterm = signal(SignalKind::terminate())?;
    let signal_handle = tokio::spawn(async move {
        // SIGTERM is what container orchestrators send before killing the process.
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("sigint (ctrl+c) received, shutting down listener");
            }
            _ = sigterm.recv() => {
                info!("sigterm received, shutting down listener");
            }
        }

        shutdown_tx.shutdown();
    });

    let result = consume(select_all(subscriptions), shutdown_rx).await;

    signal_handle.abort();
    bus.close().await;

    result
}

/// Logs events until shutdown. The first terminal subscription error ends the loop.
async fn consume<S>(mut events: S, mut shutdown_rx: ShutdownRx) -> ListenerResult<()>
where
    S: Stream<Item = IngestResult<NotificationEvent>> + Unpin,
{
    let mut received: u64 = 0;

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.wait() => {
                info!(received, "listener stopping");
                return Ok(());
            }
            event = events.next() => match event {
                Some(Ok(event)) => {
                    received += 1;
                    info!(
                        channel = %event.channel,
                        sequence = event.sequence,
                        sender_pid = event.process_id,
                        payload = %event.payload,
                        "notification received"
                    );
                }
                Some(Err(err)) => {
                    error!(error = %err, "subscription ended with an error");
                    return Err(err.into());
                }
                None => {
                    debug!(received, "all subscriptions ended");
                    return Ok(());
                }
            }
        }
    }
}

fn log_config(config: &ListenerConfig) {
    debug!(
        instance = config.instance_name,
        channels = ?config.channels,
        metrics_enabled = config.metrics_enabled,
        "listener config"
    );
    log_pg_connection_config(&config.connection);
    log_pool_config(&config.pool);
    log_notification_config(&config.notification);
}

fn log_pg_connection_config(config: &PgConnectionConfig) {
    debug!(
        host = config.host,
        port = config.port,
        dbname = config.name,
        username = config.username,
        tls_enabled = config.tls.enabled,
        "postgres connection config",
    );
}

fn log_pool_config(config: &PoolConfig) {
    debug!(
        min_connections = config.min_connections,
        max_connections = config.max_connections,
        acquire_timeout = ?config.acquire_timeout(),
        "pool config"
    );
}

fn log_notification_config(config: &NotificationConfig) {
    debug!(
        queue_capacity = config.queue_capacity,
        max_block_ms = config.max_block_ms,
        "notification config"
    );
}
