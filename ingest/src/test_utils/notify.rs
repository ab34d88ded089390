use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;

/// Default timeout for anything a test waits on.
///
/// Most waits take well under a second, so a generous bound only matters when a test is broken.
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Awaits `future`, panicking if it does not complete within `duration`.
pub async fn within<F>(duration: Duration, future: F) -> F::Output
where
    F: Future,
{
    match timeout(duration, future).await {
        Ok(output) => output,
        Err(_) => panic!("Test wait timed out after {duration:?}"),
    }
}

/// A [`Notify`] whose waits panic after a timeout instead of hanging the test.
#[derive(Clone)]
pub struct TimedNotify {
    notify: Arc<Notify>,
    timeout_duration: Duration,
}

impl TimedNotify {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TEST_TIMEOUT)
    }

    pub fn with_timeout(timeout_duration: Duration) -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            timeout_duration,
        }
    }

    /// Wakes the waiter, or the next one to wait.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Waits for a notification.
    ///
    /// # Panics
    ///
    /// Panics if the timeout elapses first.
    pub async fn notified(&self) {
        within(self.timeout_duration, self.notify.notified()).await
    }
}

impl Default for TimedNotify {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimedNotify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedNotify")
            .field("timeout_duration", &self.timeout_duration)
            .finish()
    }
}
