use serde::de::DeserializeOwned;

use crate::error::IngestResult;

/// A notification received on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub channel: String,
    pub payload: String,
    /// Position in the order the bus received notifications, starting at 1.
    pub sequence: u64,
    /// Backend process id of the sending session.
    pub process_id: i32,
}

impl NotificationEvent {
    /// Deserializes a JSON payload.
    pub fn payload_json<T>(&self) -> IngestResult<T>
    where
        T: DeserializeOwned,
    {
        Ok(serde_json::from_str(&self.payload)?)
    }
}
