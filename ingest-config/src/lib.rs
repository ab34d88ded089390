//! Configuration types and loading for the ingestion layer.
//!
//! Connection, pool, batching and notification settings live in [`shared`]. Services load
//! their top-level configuration through [`load_config`].

pub mod environment;
mod load;
pub mod shared;

pub use load::{Config, LoadConfigError, load_config, load_config_from_dir};
