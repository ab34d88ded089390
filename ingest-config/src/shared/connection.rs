use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions as SqlxConnectOptions, PgSslMode as SqlxSslMode};
use std::time::Duration;
use tokio_postgres::{Config as TokioPgConnectOptions, config::SslMode as TokioPgSslMode};

use crate::Config;
use crate::shared::ValidationError;

/// Session settings applied to every connection opened by the ingestion layer, so that values
/// are rendered identically whichever strategy wrote them.
const SESSION_SETTINGS: [(&str, &str); 5] = [
    ("datestyle", "ISO"),
    ("intervalstyle", "postgres"),
    ("extra_float_digits", "3"),
    ("client_encoding", "UTF8"),
    ("timezone", "UTC"),
];

/// Session options for pooled connections used by batch writes, merges and locks.
///
/// Lock waits are bounded per call, so the session-wide `lock_timeout` stays disabled.
pub const INGEST_POOL_OPTIONS: PgConnectionOptions = PgConnectionOptions {
    application_name: "ingest_pool",
    statement_timeout_ms: 300_000,
    lock_timeout_ms: 0,
    idle_in_transaction_session_timeout_ms: 60_000,
};

/// Session options for the dedicated `LISTEN` connection of a notification bus.
pub const INGEST_LISTENER_OPTIONS: PgConnectionOptions = PgConnectionOptions {
    application_name: "ingest_notification_listener",
    statement_timeout_ms: 5_000,
    lock_timeout_ms: 5_000,
    idle_in_transaction_session_timeout_ms: 0,
};

/// Per-role session options layered on top of the shared session settings. A timeout of `0`
/// disables it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgConnectionOptions {
    pub application_name: &'static str,
    pub statement_timeout_ms: u32,
    pub lock_timeout_ms: u32,
    pub idle_in_transaction_session_timeout_ms: u32,
}

impl PgConnectionOptions {
    /// Every setting as `(name, value)`, shared settings first.
    pub fn settings(&self) -> Vec<(String, String)> {
        let timeouts = [
            ("statement_timeout", self.statement_timeout_ms),
            ("lock_timeout", self.lock_timeout_ms),
            (
                "idle_in_transaction_session_timeout",
                self.idle_in_transaction_session_timeout_ms,
            ),
        ];

        SESSION_SETTINGS
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .chain(
                timeouts
                    .iter()
                    .map(|(name, value)| (name.to_string(), value.to_string())),
            )
            .chain([(
                "application_name".to_string(),
                self.application_name.to_string(),
            )])
            .collect()
    }

    /// Renders the settings as a libpq `options` string (`-c name=value ...`).
    pub fn to_options_string(&self) -> String {
        self.settings()
            .iter()
            .map(|(name, value)| format!("-c {name}={value}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Postgres connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PgConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Database name.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: Option<SecretString>,
    #[serde(default = "TlsConfig::disabled")]
    pub tls: TlsConfig,
    /// TCP keepalive settings. Keepalives are disabled when `None`.
    #[serde(default)]
    pub keepalive: Option<TcpKeepaliveConfig>,
}

impl PgConnectionConfig {
    pub const DEFAULT_HOST: &'static str = "localhost";

    pub const DEFAULT_PORT: u16 = 5432;

    pub const DEFAULT_NAME: &'static str = "postgres";

    pub const DEFAULT_USERNAME: &'static str = "postgres";

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.trim().is_empty() {
            return Err(ValidationError::invalid("connection.host", "cannot be empty"));
        }

        if self.port == 0 {
            return Err(ValidationError::invalid(
                "connection.port",
                "must be greater than 0",
            ));
        }

        if self.name.trim().is_empty() {
            return Err(ValidationError::invalid("connection.name", "cannot be empty"));
        }

        self.tls.validate()
    }
}

impl Default for PgConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            name: default_name(),
            username: default_username(),
            password: None,
            tls: TlsConfig::disabled(),
            keepalive: None,
        }
    }
}

impl Config for PgConnectionConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}

/// [`PgConnectionConfig`] without the password, safe to log and serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgConnectionConfigWithoutSecrets {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub username: String,
    pub tls: TlsConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive: Option<TcpKeepaliveConfig>,
}

impl From<PgConnectionConfig> for PgConnectionConfigWithoutSecrets {
    fn from(value: PgConnectionConfig) -> Self {
        PgConnectionConfigWithoutSecrets {
            host: value.host,
            port: value.port,
            name: value.name,
            username: value.username,
            tls: value.tls,
            keepalive: value.keepalive,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM-encoded root certificates trusted when verifying the server.
    #[serde(default)]
    pub trusted_root_certs: String,
    #[serde(default)]
    pub enabled: bool,
}

impl TlsConfig {
    pub fn disabled() -> Self {
        Self {
            trusted_root_certs: String::new(),
            enabled: false,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.enabled && self.trusted_root_certs.trim().is_empty() {
            return Err(ValidationError::MissingTrustedRootCerts);
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpKeepaliveConfig {
    pub idle_secs: u64,
    pub interval_secs: u64,
    pub retries: u32,
}

impl Default for TcpKeepaliveConfig {
    fn default() -> Self {
        Self {
            idle_secs: 30,
            interval_secs: 30,
            retries: 3,
        }
    }
}

/// Converts connection settings into a driver-specific connect options value.
pub trait IntoConnectOptions<Output> {
    /// Options targeting the server without selecting a database.
    fn without_db(&self, options: Option<&PgConnectionOptions>) -> Output;
    fn with_db(&self, options: Option<&PgConnectionOptions>) -> Output;
}

impl IntoConnectOptions<SqlxConnectOptions> for PgConnectionConfig {
    fn without_db(&self, options: Option<&PgConnectionOptions>) -> SqlxConnectOptions {
        let ssl_mode = if self.tls.enabled {
            SqlxSslMode::VerifyFull
        } else {
            SqlxSslMode::Prefer
        };
        let mut connect_options = SqlxConnectOptions::new_without_pgpass()
            .host(&self.host)
            .username(&self.username)
            .port(self.port)
            .ssl_mode(ssl_mode);

        if self.tls.enabled {
            connect_options = connect_options
                .ssl_root_cert_from_pem(self.tls.trusted_root_certs.clone().into_bytes());
        }

        if let Some(password) = &self.password {
            connect_options = connect_options.password(password.expose_secret());
        }

        if let Some(opts) = options {
            connect_options = connect_options.options(opts.settings());
        }

        connect_options
    }

    fn with_db(&self, options: Option<&PgConnectionOptions>) -> SqlxConnectOptions {
        let connect_options: SqlxConnectOptions = self.without_db(options);
        connect_options.database(&self.name)
    }
}

impl IntoConnectOptions<TokioPgConnectOptions> for PgConnectionConfig {
    fn without_db(&self, options: Option<&PgConnectionOptions>) -> TokioPgConnectOptions {
        let ssl_mode = if self.tls.enabled {
            TokioPgSslMode::Require
        } else {
            TokioPgSslMode::Prefer
        };
        let mut config = TokioPgConnectOptions::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.username)
            .ssl_mode(ssl_mode);

        if let Some(password) = &self.password {
            config.password(password.expose_secret());
        }

        if let Some(keepalive) = &self.keepalive {
            config
                .keepalives(true)
                .keepalives_idle(Duration::from_secs(keepalive.idle_secs))
                .keepalives_interval(Duration::from_secs(keepalive.interval_secs))
                .keepalives_retries(keepalive.retries);
        }

        if let Some(opts) = options {
            config.options(&opts.to_options_string());
        }

        config
    }

    fn with_db(&self, options: Option<&PgConnectionOptions>) -> TokioPgConnectOptions {
        let mut config: TokioPgConnectOptions = self.without_db(options);
        config.dbname(&self.name);
        config
    }
}

fn default_host() -> String {
    PgConnectionConfig::DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    PgConnectionConfig::DEFAULT_PORT
}

fn default_name() -> String {
    PgConnectionConfig::DEFAULT_NAME.to_string()
}

fn default_username() -> String {
    PgConnectionConfig::DEFAULT_USERNAME.to_string()
}
