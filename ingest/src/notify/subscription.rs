use std::pin::Pin;
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::error::{IngestError, IngestResult};
use crate::notify::NotificationEvent;
use crate::notify::bus::{BusShared, unlisten};

/// Error that ended a subscription, set once by whoever ends it.
pub(crate) type Terminal = Arc<OnceLock<IngestError>>;

/// Events of one channel, in the order the bus received them.
///
/// The stream ends with `None` after [`crate::notify::NotificationBus::close`]. It ends with one
/// final error when the subscriber fell behind for longer than the configured block time or when
/// the listening connection was lost. Dropping the subscription unsubscribes.
pub struct Subscription {
    channel: String,
    id: u64,
    receiver: mpsc::Receiver<NotificationEvent>,
    terminal: Terminal,
    finished: bool,
    shared: Weak<BusShared>,
}

impl Subscription {
    pub(crate) fn new(
        channel: String,
        id: u64,
        receiver: mpsc::Receiver<NotificationEvent>,
        terminal: Terminal,
        shared: Weak<BusShared>,
    ) -> Self {
        Self {
            channel,
            id,
            receiver,
            terminal,
            finished: false,
            shared,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Number of events queued for this subscriber and not yet received.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Waits for the next event. Returns `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<IngestResult<NotificationEvent>> {
        self.next().await
    }
}

impl Stream for Subscription {
    type Item = IngestResult<NotificationEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(self.terminal.get().cloned().map(Err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        if shared.remove_subscriber(&self.channel, self.id)
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            handle.spawn(unlisten(shared, self.channel.clone()));
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish()
    }
}
