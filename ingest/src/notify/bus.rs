use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use futures::StreamExt;
use futures::stream::BoxStream;
use ingest_config::shared::{
    INGEST_LISTENER_OPTIONS, IntoConnectOptions, NotificationConfig, PgConnectionConfig,
};
use metrics::counter;
use pg_escape::quote_identifier;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, Client, Config, NoTls, Notification};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, error, info, warn};

use crate::bail;
use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::error::{ErrorKind, IngestError, IngestResult};
use crate::ingest_error;
use crate::metrics::{INGEST_NOTIFICATION_OVERFLOWS_TOTAL, INGEST_NOTIFICATIONS_DELIVERED_TOTAL};
use crate::notify::subscription::{Subscription, Terminal};
use crate::notify::{NotificationEvent, validate_channel};
use crate::pool::{build_tls_config, connect_error};

type MessageStream = BoxStream<'static, Result<AsyncMessage, tokio_postgres::Error>>;

struct SubscriberEntry {
    id: u64,
    queue: mpsc::Sender<NotificationEvent>,
    terminal: Terminal,
}

#[derive(Default)]
struct Registry {
    channels: HashMap<String, Vec<SubscriberEntry>>,
    next_subscriber_id: u64,
}

/// State shared by the bus handle, its driver task and its subscriptions.
pub(crate) struct BusShared {
    client: Client,
    config: NotificationConfig,
    registry: Mutex<Registry>,
    // Serializes `listen` and `unlisten` so they reach the server in registry order.
    listen_lock: tokio::sync::Mutex<()>,
    sequence: AtomicU64,
    closed: AtomicBool,
    lost: AtomicBool,
}

impl BusShared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_subscribers(&self, channel: &str) -> bool {
        self.registry()
            .channels
            .get(channel)
            .is_some_and(|subscribers| !subscribers.is_empty())
    }

    /// Removes a subscriber. Returns `true` if it was the last one on its channel.
    pub(crate) fn remove_subscriber(&self, channel: &str, id: u64) -> bool {
        let mut registry = self.registry();
        let Some(subscribers) = registry.channels.get_mut(channel) else {
            return false;
        };

        subscribers.retain(|entry| entry.id != id);
        if subscribers.is_empty() {
            registry.channels.remove(channel);
            return true;
        }

        false
    }

    /// Queues `notification` for every subscriber of its channel.
    ///
    /// Subscribers with room get the event right away. For those whose queue is full the driver
    /// waits, all of them together, for at most `max_block`; a subscriber still full by then is
    /// ended with [`ErrorKind::SubscriberOverflow`].
    async fn dispatch(self: &Arc<Self>, notification: Notification) {
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let event = NotificationEvent {
            channel: notification.channel().to_string(),
            payload: notification.payload().to_string(),
            sequence,
            process_id: notification.process_id(),
        };

        let (blocked, now_empty) = {
            let mut registry = self.registry();
            let Some(subscribers) = registry.channels.get_mut(&event.channel) else {
                debug!(channel = %event.channel, "notification without subscribers");
                return;
            };

            let mut blocked = Vec::new();
            subscribers.retain(|entry| match entry.queue.try_send(event.clone()) {
                Ok(()) => {
                    counter!(INGEST_NOTIFICATIONS_DELIVERED_TOTAL).increment(1);
                    true
                }
                Err(TrySendError::Full(_)) => {
                    blocked.push((entry.id, entry.queue.clone(), entry.terminal.clone()));
                    true
                }
                // The subscription was dropped.
                Err(TrySendError::Closed(_)) => false,
            });

            let now_empty = subscribers.is_empty();
            if now_empty {
                registry.channels.remove(&event.channel);
            }
            (blocked, now_empty)
        };

        if now_empty {
            tokio::spawn(unlisten(self.clone(), event.channel.clone()));
        }
        if blocked.is_empty() {
            return;
        }

        let max_block = self.config.max_block();
        let waits = blocked.into_iter().map(|(id, queue, terminal)| {
            let event = event.clone();
            async move { (id, terminal, queue.send_timeout(event, max_block).await) }
        });

        for (id, terminal, result) in futures::future::join_all(waits).await {
            match result {
                Ok(()) => {
                    counter!(INGEST_NOTIFICATIONS_DELIVERED_TOTAL).increment(1);
                }
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(
                        channel = %event.channel,
                        sequence,
                        ?max_block,
                        "subscriber queue stayed full, ending subscription"
                    );
                    counter!(INGEST_NOTIFICATION_OVERFLOWS_TOTAL).increment(1);
                    // Set before the queue's last sender goes away with the registry entry.
                    let _ = terminal.set(ingest_error!(
                        ErrorKind::SubscriberOverflow,
                        "Subscriber fell behind",
                        format!(
                            "event {sequence} on channel '{}' could not be queued within {max_block:?}",
                            event.channel
                        )
                    ));
                    if self.remove_subscriber(&event.channel, id) {
                        tokio::spawn(unlisten(self.clone(), event.channel.clone()));
                    }
                }
                Err(SendTimeoutError::Closed(_)) => {}
            }
        }
    }

    /// Ends every subscription, with `error` as their final item if given.
    fn end_all(&self, error: Option<IngestError>) {
        let channels = std::mem::take(&mut self.registry().channels);
        for entry in channels.into_values().flatten() {
            if let Some(error) = &error {
                let _ = entry.terminal.set(error.clone());
            }
        }
    }
}

/// Issues `unlisten` for `channel` unless it gained subscribers in the meantime.
pub(crate) async fn unlisten(shared: Arc<BusShared>, channel: String) {
    let _guard = shared.listen_lock.lock().await;
    if shared.closed.load(Ordering::Acquire)
        || shared.lost.load(Ordering::Acquire)
        || shared.has_subscribers(&channel)
    {
        return;
    }

    let statement = format!("unlisten {}", quote_identifier(&channel));
    match shared.client.batch_execute(&statement).await {
        Ok(()) => debug!(%channel, "stopped listening"),
        Err(err) => warn!(%channel, error = %err, "failed to stop listening"),
    }
}

/// Fans out `LISTEN`/`NOTIFY` notifications to local subscribers.
///
/// The bus owns one dedicated connection that is never leased from a pool. Each subscriber gets a
/// bounded queue of `queue_capacity` events and the bus never holds more than that for it. When a
/// queue is full the bus stops reading the connection, leaving further notifications with the
/// server, and waits at most `max_block` for room. A subscriber still full after that ends with
/// [`ErrorKind::SubscriberOverflow`] while the others carry on.
pub struct NotificationBus {
    shared: Arc<BusShared>,
    shutdown_tx: ShutdownTx,
    driver: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl NotificationBus {
    /// Opens the listening connection and starts delivering notifications.
    pub async fn connect(
        connection_config: &PgConnectionConfig,
        config: NotificationConfig,
    ) -> IngestResult<Self> {
        connection_config.validate()?;
        config.validate()?;

        let (client, messages) = open_listener(connection_config).await?;

        let shared = Arc::new(BusShared {
            client,
            config,
            registry: Mutex::new(Registry::default()),
            listen_lock: tokio::sync::Mutex::new(()),
            sequence: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            lost: AtomicBool::new(false),
        });

        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let driver = tokio::spawn(drive(messages, shared.clone(), shutdown_rx));

        info!(host = %connection_config.host, "notification bus connected");

        Ok(Self {
            shared,
            shutdown_tx,
            driver: tokio::sync::Mutex::new(Some(driver)),
        })
    }

    /// Subscribes to `channel`, issuing `listen` if nobody on this bus listens to it yet.
    pub async fn subscribe(&self, channel: &str) -> IngestResult<Subscription> {
        validate_channel(channel)?;

        let _guard = self.shared.listen_lock.lock().await;
        self.ensure_open()?;

        let (queue, receiver) = mpsc::channel(self.shared.config.queue_capacity);
        let terminal: Terminal = Arc::new(OnceLock::new());

        let (id, first) = {
            let mut registry = self.shared.registry();
            let id = registry.next_subscriber_id;
            registry.next_subscriber_id += 1;

            let subscribers = registry.channels.entry(channel.to_string()).or_default();
            let first = subscribers.is_empty();
            subscribers.push(SubscriberEntry {
                id,
                queue,
                terminal: terminal.clone(),
            });
            (id, first)
        };

        if first {
            let statement = format!("listen {}", quote_identifier(channel));
            if let Err(err) = self.shared.client.batch_execute(&statement).await {
                self.shared.remove_subscriber(channel, id);
                return Err(err.into());
            }
            debug!(%channel, "started listening");
        }

        Ok(Subscription::new(
            channel.to_string(),
            id,
            receiver,
            terminal,
            Arc::downgrade(&self.shared),
        ))
    }

    /// Publishes on the bus's own connection.
    pub async fn publish(&self, channel: &str, payload: &str) -> IngestResult<()> {
        self.ensure_open()?;
        super::publish(&self.shared.client, channel, payload).await
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.shared
            .registry()
            .channels
            .get(channel)
            .map_or(0, Vec::len)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stops the bus. Every subscription ends once it has drained its queue.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown_tx.shutdown();
        if let Some(driver) = self.driver.lock().await.take()
            && let Err(err) = driver.await
        {
            error!(error = %err, "notification driver task failed");
        }

        info!("notification bus closed");
    }

    fn ensure_open(&self) -> IngestResult<()> {
        if self.shared.lost.load(Ordering::Acquire) {
            bail!(
                ErrorKind::ConnectionLost,
                "Notification bus lost its connection"
            );
        }
        if self.shared.closed.load(Ordering::Acquire) {
            bail!(ErrorKind::InvalidState, "Notification bus is closed");
        }

        Ok(())
    }
}

impl Drop for NotificationBus {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shutdown_tx.shutdown();
    }
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Connects the listening session and turns its connection into a stream of messages.
async fn open_listener(
    connection_config: &PgConnectionConfig,
) -> IngestResult<(Client, MessageStream)> {
    let config: Config = connection_config.with_db(Some(&INGEST_LISTENER_OPTIONS));

    if connection_config.tls.enabled {
        let tls_config = build_tls_config(&connection_config.tls.trusted_root_certs)?;
        let (client, mut connection) = config
            .connect(MakeRustlsConnect::new(tls_config))
            .await
            .map_err(connect_error)?;
        let messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx)).boxed();
        Ok((client, messages))
    } else {
        let (client, mut connection) = config.connect(NoTls).await.map_err(connect_error)?;
        let messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx)).boxed();
        Ok((client, messages))
    }
}

/// Drives the listening connection and dispatches its notifications until shutdown or loss.
async fn drive(mut messages: MessageStream, shared: Arc<BusShared>, mut shutdown_rx: ShutdownRx) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.wait() => {
                shared.closed.store(true, Ordering::Release);
                shared.end_all(None);
                debug!("notification driver stopped");
                return;
            }
            message = messages.next() => match message {
                Some(Ok(AsyncMessage::Notification(notification))) => {
                    shared.dispatch(notification).await;
                }
                Some(Ok(AsyncMessage::Notice(notice))) => {
                    debug!(notice = %notice, "notice on listening connection");
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    error!(error = %err, "listening connection failed");
                    let error = ingest_error!(
                        ErrorKind::ConnectionLost,
                        "Listening connection lost",
                        err.to_string(),
                        source: err
                    );
                    connection_lost(&shared, error);
                    return;
                }
                None => {
                    let error =
                        ingest_error!(ErrorKind::ConnectionLost, "Listening connection closed");
                    connection_lost(&shared, error);
                    return;
                }
            }
        }
    }
}

fn connection_lost(shared: &BusShared, error: IngestError) {
    if shared.closed.load(Ordering::Acquire) {
        shared.end_all(None);
        return;
    }

    shared.lost.store(true, Ordering::Release);
    shared.end_all(Some(error));
}
