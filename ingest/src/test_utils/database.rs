use ingest_config::shared::{IntoConnectOptions, PgConnectionConfig, PoolConfig, TlsConfig};
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, Executor, PgConnection};
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::pool::PgPool;
use crate::types::TableName;

/// Schema holding the tables created by tests.
pub const TEST_DATABASE_SCHEMA: &str = "test";

/// Creates a [`TableName`] in the test schema.
pub fn test_table_name(name: &str) -> TableName {
    TableName::new(TEST_DATABASE_SCHEMA, name)
}

/// Connection settings for a uniquely named database on the local test server.
///
/// Configuration is read from environment variables:
/// - `TESTS_DATABASE_HOST`: Postgres server hostname (required)
/// - `TESTS_DATABASE_PORT`: Postgres server port (required)
/// - `TESTS_DATABASE_USERNAME`: Database user (required)
/// - `TESTS_DATABASE_PASSWORD`: Database password (optional)
pub fn local_pg_connection_config() -> PgConnectionConfig {
    PgConnectionConfig {
        host: std::env::var("TESTS_DATABASE_HOST").expect("TESTS_DATABASE_HOST must be set"),
        port: std::env::var("TESTS_DATABASE_PORT")
            .expect("TESTS_DATABASE_PORT must be set")
            .parse()
            .expect("TESTS_DATABASE_PORT must be a valid port number"),
        name: Uuid::new_v4().to_string(),
        username: std::env::var("TESTS_DATABASE_USERNAME")
            .expect("TESTS_DATABASE_USERNAME must be set"),
        password: std::env::var("TESTS_DATABASE_PASSWORD")
            .ok()
            .map(Into::into),
        tls: TlsConfig::disabled(),
        keepalive: None,
    }
}

/// Pool settings for tests: no warm connections beyond the first and quick timeouts.
pub fn test_pool_config(max_connections: u32) -> PoolConfig {
    PoolConfig {
        min_connections: 1,
        max_connections,
        acquire_timeout_ms: 5_000,
        connect_timeout_ms: 5_000,
        ..PoolConfig::default()
    }
}

/// A throwaway database, dropped together with its connections when this value is dropped.
///
/// Dropping requires a multi-threaded runtime.
pub struct TestDatabase {
    pub config: PgConnectionConfig,
    connection: Option<PgConnection>,
}

impl TestDatabase {
    /// Creates a new database with a random name and the test schema in it.
    pub async fn new() -> Self {
        let config = local_pg_connection_config();
        create_pg_database(&config).await;

        let options: PgConnectOptions = config.with_db(None);
        let mut connection = PgConnection::connect_with(&options)
            .await
            .expect("Failed to connect to the test database");
        connection
            .execute(&*format!("create schema {TEST_DATABASE_SCHEMA}"))
            .await
            .expect("Failed to create test schema");

        Self {
            config,
            connection: Some(connection),
        }
    }

    /// Executes one or more statements outside the code under test.
    pub async fn run_sql(&mut self, sql: &str) -> u64 {
        let connection = self.connection.as_mut().expect("connection is open until drop");
        connection
            .execute(sql)
            .await
            .expect("Failed to run SQL")
            .rows_affected()
    }

    /// Runs a query returning a single `bigint` scalar.
    pub async fn query_scalar(&mut self, sql: &str) -> i64 {
        let connection = self.connection.as_mut().expect("connection is open until drop");
        sqlx::query_scalar::<_, i64>(sql)
            .fetch_one(connection)
            .await
            .expect("Failed to run scalar query")
    }

    pub async fn count_rows(&mut self, table: &TableName) -> i64 {
        self.query_scalar(&format!(
            "select count(*) from {}",
            table.as_quoted_identifier()
        ))
        .await
    }

    /// Opens a pool on this database.
    pub async fn open_pool(&self, max_connections: u32) -> PgPool {
        self.open_pool_with(test_pool_config(max_connections)).await
    }

    pub async fn open_pool_with(&self, pool_config: PoolConfig) -> PgPool {
        PgPool::open(self.config.clone(), pool_config)
            .await
            .expect("Failed to open connection pool")
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        let connection = self.connection.take();
        let config = self.config.clone();

        // `block_in_place` needs a multi-threaded runtime.
        tokio::task::block_in_place(move || {
            Handle::current().block_on(async move {
                if let Some(connection) = connection {
                    let _ = connection.close().await;
                }
                drop_pg_database(&config).await;
            });
        });
    }
}

/// Creates a new test database.
pub async fn spawn_database() -> TestDatabase {
    TestDatabase::new().await
}

/// Creates the database named in `config`.
///
/// # Panics
/// Panics if connection or database creation fails.
pub async fn create_pg_database(config: &PgConnectionConfig) {
    let options: PgConnectOptions = config.without_db(None);
    let mut connection = PgConnection::connect_with(&options)
        .await
        .expect("Failed to connect to Postgres");
    connection
        .execute(&*format!(r#"create database "{}";"#, config.name))
        .await
        .expect("Failed to create database");
}

/// Terminates every connection to the database named in `config` and drops it.
///
/// Errors are printed and ignored so cleanup never fails a test.
pub async fn drop_pg_database(config: &PgConnectionConfig) {
    let options: PgConnectOptions = config.without_db(None);
    let mut connection = match PgConnection::connect_with(&options).await {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("warning: failed to connect to Postgres for cleanup: {e}");
            return;
        }
    };

    if let Err(e) = connection
        .execute(&*format!(
            r#"
            select pg_terminate_backend(pg_stat_activity.pid)
            from pg_stat_activity
            where pg_stat_activity.datname = '{}'
            and pid <> pg_backend_pid();"#,
            config.name
        ))
        .await
    {
        eprintln!(
            "warning: failed to terminate connections for database {}: {}",
            config.name, e
        );
    }

    if let Err(e) = connection
        .execute(&*format!(r#"drop database if exists "{}";"#, config.name))
        .await
    {
        eprintln!("warning: failed to drop database {}: {}", config.name, e);
    }
}
