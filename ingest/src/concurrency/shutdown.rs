//! Shutdown signalling built on a watch channel.
//!
//! Every receiver observes the same signal, so one [`ShutdownTx`] can stop the pool maintenance
//! task, a notification bus driver and a worker loop at once.

use tokio::sync::watch;

/// Sending side of the shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<bool>);

impl ShutdownTx {
    /// Signals shutdown to every receiver. Returns `false` if no receiver is left.
    pub fn shutdown(&self) -> bool {
        self.0.send(true).is_ok()
    }

    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }
}

/// Receiving side of the shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownRx {
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown was signalled or every sender was dropped.
    pub async fn wait(&mut self) {
        // A closed channel counts as shutdown.
        let _ = self.0.wait_for(|shutdown| *shutdown).await;
    }
}

/// Creates a connected shutdown sender and receiver.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(tx), ShutdownRx(rx))
}
