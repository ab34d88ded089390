use std::io::BufReader;
use std::sync::Arc;

use ingest_config::shared::{IntoConnectOptions, PgConnectionConfig, PgConnectionOptions};
use rustls::ClientConfig;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::{Client, Config, Connection, NoTls, Socket};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{Instrument, debug, error};

use crate::error::{ErrorKind, IngestError, IngestResult};

/// Spawns a task driving a Postgres connection until it terminates.
///
/// The task ends when the [`Client`] is dropped, so its handle is not kept.
fn spawn_postgres_connection<T>(connection: Connection<Socket, T::Stream>)
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let span = tracing::Span::current();
    let task = async move {
        let result = connection.await;

        match result {
            Err(err) => error!("an error occurred during the postgres connection: {}", err),
            Ok(()) => debug!("postgres connection terminated successfully"),
        }
    }
    .instrument(span);

    tokio::spawn(task);
}

/// Builds the rustls configuration trusting the PEM roots of `tls.trusted_root_certs`.
pub(crate) fn build_tls_config(trusted_root_certs: &str) -> IngestResult<ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();
    let mut root_certs_reader = BufReader::new(trusted_root_certs.as_bytes());
    for cert in rustls_pemfile::certs(&mut root_certs_reader) {
        let cert = cert?;
        root_store.add(cert)?;
    }

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(tls_config)
}

/// Opens a single connection with the given session options, using TLS when configured.
pub(crate) async fn connect(
    pg_connection_config: &PgConnectionConfig,
    options: &PgConnectionOptions,
) -> IngestResult<Client> {
    let config: Config = pg_connection_config.with_db(Some(options));

    let client = if pg_connection_config.tls.enabled {
        let tls_config = build_tls_config(&pg_connection_config.tls.trusted_root_certs)?;
        let (client, connection) = config
            .connect(MakeRustlsConnect::new(tls_config))
            .await
            .map_err(connect_error)?;
        spawn_postgres_connection::<MakeRustlsConnect>(connection);
        client
    } else {
        let (client, connection) = config.connect(NoTls).await.map_err(connect_error)?;
        spawn_postgres_connection::<NoTls>(connection);
        client
    };

    debug!(
        host = %pg_connection_config.host,
        tls = pg_connection_config.tls.enabled,
        "connected to postgres"
    );

    Ok(client)
}

/// Failures while establishing a connection are reported as [`ErrorKind::ConnectionFailed`]
/// unless the server rejected the credentials.
pub(crate) fn connect_error(err: tokio_postgres::Error) -> IngestError {
    use tokio_postgres::error::SqlState;

    let kind = match err.code() {
        Some(code)
            if *code == SqlState::INVALID_PASSWORD
                || *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION =>
        {
            ErrorKind::AuthenticationError
        }
        _ => ErrorKind::ConnectionFailed,
    };

    crate::ingest_error!(kind, "Failed to connect to postgres", err.to_string(), source: err)
}
