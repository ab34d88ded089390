use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::shared::ValidationError;

/// Delivery settings of the notification bus.
///
/// Every subscriber owns a queue of `queue_capacity` events. When the queue is full the bus
/// waits up to `max_block_ms` for room before terminating that subscriber.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NotificationConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_block_ms")]
    pub max_block_ms: u64,
}

impl NotificationConfig {
    pub const DEFAULT_QUEUE_CAPACITY: usize = 1_024;

    pub const DEFAULT_MAX_BLOCK_MS: u64 = 5_000;

    pub fn max_block(&self) -> Duration {
        Duration::from_millis(self.max_block_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.queue_capacity == 0 {
            return Err(ValidationError::invalid(
                "notification.queue_capacity",
                "must be greater than 0",
            ));
        }

        if self.max_block_ms == 0 {
            return Err(ValidationError::invalid(
                "notification.max_block_ms",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_block_ms: default_max_block_ms(),
        }
    }
}

fn default_queue_capacity() -> usize {
    NotificationConfig::DEFAULT_QUEUE_CAPACITY
}

fn default_max_block_ms() -> u64 {
    NotificationConfig::DEFAULT_MAX_BLOCK_MS
}
