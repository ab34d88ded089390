use ingest_config::load_config;
use ingest_config::shared::ListenerConfig;

use crate::error::{ListenerError, ListenerResult};

/// Loads and validates the listener configuration.
///
/// Uses the standard configuration loading mechanism from [`ingest_config`] and
/// validates the resulting [`ListenerConfig`] before returning it.
pub fn load_listener_config() -> ListenerResult<ListenerConfig> {
    let config = load_config::<ListenerConfig>().map_err(ListenerError::config)?;
    config.validate().map_err(ListenerError::config)?;

    Ok(config)
}
