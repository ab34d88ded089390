//! Change notifications over Postgres `LISTEN`/`NOTIFY`.

mod bus;
mod event;
mod subscription;

use metrics::counter;
use serde::Serialize;
use tokio_postgres::GenericClient;
use tracing::debug;

pub use bus::NotificationBus;
pub use event::NotificationEvent;
pub use subscription::Subscription;

use crate::{bail, ingest_error};
use crate::error::{ErrorKind, IngestResult};
use crate::metrics::INGEST_NOTIFICATIONS_PUBLISHED_TOTAL;

/// Payloads must be strictly shorter than this many bytes.
pub const MAX_PAYLOAD_BYTES: usize = 8_000;

/// Longest channel name Postgres keeps without truncating it.
pub const MAX_CHANNEL_BYTES: usize = 63;

pub(crate) fn validate_channel(channel: &str) -> IngestResult<()> {
    if channel.is_empty() {
        bail!(ErrorKind::InvalidData, "Notification channel name is empty");
    }
    if channel.len() > MAX_CHANNEL_BYTES {
        bail!(
            ErrorKind::InvalidData,
            "Notification channel name is too long",
            format!(
                "channel name has {} bytes, at most {MAX_CHANNEL_BYTES} are allowed",
                channel.len()
            )
        );
    }

    Ok(())
}

fn validate_payload(payload: &str) -> IngestResult<()> {
    if payload.len() >= MAX_PAYLOAD_BYTES {
        bail!(
            ErrorKind::InvalidData,
            "Notification payload is too large",
            format!(
                "payload has {} bytes, it must be shorter than {MAX_PAYLOAD_BYTES}",
                payload.len()
            )
        );
    }

    Ok(())
}

/// Sends `payload` on `channel` with `pg_notify`.
///
/// Inside a transaction the notification is delivered on commit.
pub async fn publish<C>(client: &C, channel: &str, payload: &str) -> IngestResult<()>
where
    C: GenericClient + Sync,
{
    validate_channel(channel)?;
    validate_payload(payload)?;

    client
        .execute("select pg_notify($1, $2)", &[&channel, &payload])
        .await?;

    counter!(INGEST_NOTIFICATIONS_PUBLISHED_TOTAL).increment(1);
    debug!(%channel, bytes = payload.len(), "notification published");

    Ok(())
}

/// Serializes `value` to JSON and publishes it.
pub async fn publish_json<C, T>(client: &C, channel: &str, value: &T) -> IngestResult<()>
where
    C: GenericClient + Sync,
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_string(value).map_err(|err| {
        ingest_error!(
            ErrorKind::SerializationError,
            "Failed to serialize notification payload",
            err.to_string(),
            source: err
        )
    })?;
    publish(client, channel, &payload).await
}
