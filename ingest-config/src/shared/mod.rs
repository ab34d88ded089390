//! Shared configuration types.

mod base;
mod batch;
mod connection;
mod listener;
mod notification;
mod pool;

pub use base::ValidationError;
pub use batch::BatchConfig;
pub use connection::{
    INGEST_LISTENER_OPTIONS, INGEST_POOL_OPTIONS, IntoConnectOptions, PgConnectionConfig,
    PgConnectionConfigWithoutSecrets, PgConnectionOptions, TcpKeepaliveConfig, TlsConfig,
};
pub use listener::ListenerConfig;
pub use notification::NotificationConfig;
pub use pool::PoolConfig;
