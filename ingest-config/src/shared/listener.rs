use serde::Deserialize;

use crate::Config;
use crate::shared::{NotificationConfig, PgConnectionConfig, PoolConfig, ValidationError};

/// Top-level configuration of the notification listener service.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub connection: PgConnectionConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    /// Channels the listener subscribes to.
    pub channels: Vec<String>,
    /// Name identifying the deployment. Only one listener per name runs at a time.
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    /// Whether the Prometheus exporter is started.
    #[serde(default)]
    pub metrics_enabled: bool,
}

impl ListenerConfig {
    pub const DEFAULT_INSTANCE_NAME: &'static str = "default";

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.connection.validate()?;
        self.pool.validate()?;
        self.notification.validate()?;

        if self.channels.is_empty() {
            return Err(ValidationError::invalid(
                "channels",
                "at least one channel is required",
            ));
        }

        if self.channels.iter().any(|channel| channel.trim().is_empty()) {
            return Err(ValidationError::invalid(
                "channels",
                "channel names cannot be empty",
            ));
        }

        Ok(())
    }
}

impl Config for ListenerConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &["channels"];
}

fn default_instance_name() -> String {
    ListenerConfig::DEFAULT_INSTANCE_NAME.to_string()
}
