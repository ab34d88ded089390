//! Error types and result definitions for ingestion operations.
//!
//! [`IngestError`] carries a classification ([`ErrorKind`]), a static description, optional
//! dynamic detail, an optional source and the callsite where it was raised. Several errors can
//! be aggregated into one, which is how rollback failures travel next to the error that caused
//! the rollback and how pipelined statement failures are reported together.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

/// Result type for ingestion operations.
pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the ingestion layer.
///
/// Errors are cheap to clone so the same failure can be handed to several subscribers or
/// recorded in a per-statement report.
#[derive(Debug, Clone)]
pub struct IngestError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Aggregated errors. The first one determines the reported [`ErrorKind`].
    Many {
        errors: Vec<IngestError>,
        location: &'static Location<'static>,
    },
}

/// Categories of failures surfaced by the ingestion layer.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Pool
    PoolExhausted,
    PoolClosed,

    // Connection
    ConnectionFailed,
    ConnectionLost,
    AuthenticationError,
    EncryptionError,

    // Statement execution
    QueryFailed,
    ConstraintViolation,
    TransactionAborted,
    LockTimeout,
    OperationCanceled,
    SchemaError,

    // Batching
    BatchPartialFailure,

    // Notifications
    SubscriberOverflow,

    // Data
    InvalidData,
    ConversionError,
    SerializationError,
    DeserializationError,

    // Configuration and environment
    ConfigError,
    IoError,

    InvalidState,

    Unknown,
}

impl IngestError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For aggregated errors, returns the kind of the first error or [`ErrorKind::Unknown`]
    /// when the aggregate is empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every [`ErrorKind`] contained in this error, flattened.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    /// Returns the static description, or the first one of an aggregate.
    pub fn description(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.description.as_ref()),
            ErrorRepr::Many { ref errors, .. } => errors.first().and_then(|e| e.description()),
        }
    }

    /// Returns the dynamic detail, or the first available one of an aggregate.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the aggregated errors, if this is an aggregate.
    pub fn errors(&self) -> Option<&[IngestError]> {
        match self.repr {
            ErrorRepr::Single(_) => None,
            ErrorRepr::Many { ref errors, .. } => Some(errors),
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches an originating error. Has no effect on aggregates.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        IngestError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for IngestError {
    fn eq(&self, other: &IngestError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Hash for IngestError {
    /// Hashes only the kind and static description so that occurrences of the same failure
    /// group together regardless of location or detail.
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.repr).hash(state);
        match &self.repr {
            ErrorRepr::Single(payload) => {
                payload.kind.hash(state);
                payload.description.hash(state);
            }
            ErrorRepr::Many { errors, .. } => {
                errors.len().hash(state);
                for error in errors {
                    error.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                write_indented_block(f, "Detail", payload.detail.as_deref())?;

                let backtrace = payload.backtrace.to_string();
                if !backtrace.trim().is_empty() {
                    write_indented_block(f, "Backtrace", Some(&backtrace))?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if errors.is_empty() {
                    write!(f, "\n  (no inner errors provided)")?;
                }

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for IngestError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

fn write_indented_block(
    f: &mut fmt::Formatter<'_>,
    title: &str,
    content: Option<&str>,
) -> fmt::Result {
    let Some(content) = content else {
        return Ok(());
    };

    if content.trim().is_empty() {
        return write!(f, "\n  {title}: <empty>");
    }

    write!(f, "\n  {title}:")?;
    for line in content.lines() {
        if line.trim().is_empty() {
            write!(f, "\n    ")?;
        } else {
            write!(f, "\n    {line}")?;
        }
    }

    Ok(())
}

impl From<(ErrorKind, &'static str)> for IngestError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> IngestError {
        IngestError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for IngestError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> IngestError {
        IngestError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors. A single-element vector yields that error unchanged.
impl<E> From<Vec<E>> for IngestError
where
    E: Into<IngestError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> IngestError {
        let location = Location::caller();

        let mut errors: Vec<IngestError> = errors.into_iter().map(Into::into).collect();
        if errors.len() == 1
            && let Some(error) = errors.pop()
        {
            return error;
        }

        IngestError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for IngestError {
    #[track_caller]
    fn from(err: std::io::Error) -> IngestError {
        let detail = err.to_string();
        IngestError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<serde_json::Error> for IngestError {
    #[track_caller]
    fn from(err: serde_json::Error) -> IngestError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        let detail = err.to_string();
        IngestError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Maps Postgres failures onto [`ErrorKind`]s using the SQLSTATE code, or the client-side cause
/// when the server never answered.
impl From<tokio_postgres::Error> for IngestError {
    #[track_caller]
    fn from(err: tokio_postgres::Error) -> IngestError {
        let (kind, description) = classify_postgres_error(&err);

        let detail = err.to_string();
        IngestError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

fn classify_postgres_error(err: &tokio_postgres::Error) -> (ErrorKind, &'static str) {
    use tokio_postgres::error::SqlState;

    let Some(sqlstate) = err.code() else {
        if err.is_closed() {
            return (ErrorKind::ConnectionLost, "PostgreSQL connection closed");
        }
        // Without a SQLSTATE the error came from the client: transport failures carry an I/O
        // source, value encoding and decoding failures carry the conversion error.
        return match std::error::Error::source(err) {
            Some(source) if source.is::<std::io::Error>() => {
                (ErrorKind::ConnectionLost, "PostgreSQL connection failed")
            }
            Some(_) => (
                ErrorKind::ConversionError,
                "PostgreSQL value conversion failed",
            ),
            None => (ErrorKind::QueryFailed, "PostgreSQL client error"),
        };
    };

    match *sqlstate {
        // Connection exceptions (08xxx) and server shutdown (57P0x)
        SqlState::CONNECTION_EXCEPTION
        | SqlState::CONNECTION_DOES_NOT_EXIST
        | SqlState::CONNECTION_FAILURE
        | SqlState::ADMIN_SHUTDOWN
        | SqlState::CRASH_SHUTDOWN
        | SqlState::IDLE_SESSION_TIMEOUT => {
            (ErrorKind::ConnectionLost, "PostgreSQL connection lost")
        }
        SqlState::SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION
        | SqlState::SQLSERVER_REJECTED_ESTABLISHMENT_OF_SQLCONNECTION
        | SqlState::CANNOT_CONNECT_NOW
        | SqlState::TOO_MANY_CONNECTIONS => (
            ErrorKind::ConnectionFailed,
            "PostgreSQL connection could not be established",
        ),

        // Authentication (28xxx)
        SqlState::INVALID_AUTHORIZATION_SPECIFICATION | SqlState::INVALID_PASSWORD => (
            ErrorKind::AuthenticationError,
            "PostgreSQL authentication failed",
        ),

        // Integrity constraint violations (23xxx)
        SqlState::INTEGRITY_CONSTRAINT_VIOLATION
        | SqlState::RESTRICT_VIOLATION
        | SqlState::NOT_NULL_VIOLATION
        | SqlState::FOREIGN_KEY_VIOLATION
        | SqlState::UNIQUE_VIOLATION
        | SqlState::CHECK_VIOLATION
        | SqlState::EXCLUSION_VIOLATION => (
            ErrorKind::ConstraintViolation,
            "PostgreSQL constraint violation",
        ),

        // Transaction rollback (40xxx) and failed transaction state (25xxx)
        SqlState::TRANSACTION_ROLLBACK
        | SqlState::T_R_SERIALIZATION_FAILURE
        | SqlState::T_R_DEADLOCK_DETECTED
        | SqlState::T_R_INTEGRITY_CONSTRAINT_VIOLATION
        | SqlState::T_R_STATEMENT_COMPLETION_UNKNOWN
        | SqlState::IN_FAILED_SQL_TRANSACTION
        | SqlState::IDLE_IN_TRANSACTION_SESSION_TIMEOUT => (
            ErrorKind::TransactionAborted,
            "PostgreSQL transaction aborted",
        ),
        SqlState::ACTIVE_SQL_TRANSACTION
        | SqlState::NO_ACTIVE_SQL_TRANSACTION
        | SqlState::INVALID_TRANSACTION_STATE => (
            ErrorKind::InvalidState,
            "PostgreSQL transaction state error",
        ),

        // Lock not available (55P03)
        SqlState::LOCK_NOT_AVAILABLE => (ErrorKind::LockTimeout, "PostgreSQL lock not available"),

        // Cancellation (57014)
        SqlState::QUERY_CANCELED => (ErrorKind::OperationCanceled, "PostgreSQL query canceled"),

        // Data exceptions (22xxx)
        SqlState::DATA_EXCEPTION
        | SqlState::INVALID_TEXT_REPRESENTATION
        | SqlState::INVALID_DATETIME_FORMAT
        | SqlState::NUMERIC_VALUE_OUT_OF_RANGE
        | SqlState::STRING_DATA_RIGHT_TRUNCATION
        | SqlState::INVALID_BINARY_REPRESENTATION
        | SqlState::BAD_COPY_FILE_FORMAT
        | SqlState::DIVISION_BY_ZERO => (
            ErrorKind::ConversionError,
            "PostgreSQL data conversion failed",
        ),

        // Missing objects (42xxx)
        SqlState::UNDEFINED_TABLE
        | SqlState::UNDEFINED_COLUMN
        | SqlState::UNDEFINED_FUNCTION
        | SqlState::UNDEFINED_SCHEMA
        | SqlState::DATATYPE_MISMATCH => {
            (ErrorKind::SchemaError, "PostgreSQL schema object mismatch")
        }

        SqlState::PROGRAM_LIMIT_EXCEEDED
        | SqlState::TOO_MANY_COLUMNS
        | SqlState::TOO_MANY_ARGUMENTS => (
            ErrorKind::QueryFailed,
            "PostgreSQL program limit exceeded",
        ),

        SqlState::IO_ERROR | SqlState::DISK_FULL => {
            (ErrorKind::IoError, "PostgreSQL I/O error")
        }

        _ => (ErrorKind::QueryFailed, "PostgreSQL query failed"),
    }
}

impl From<sqlx::Error> for IngestError {
    #[track_caller]
    fn from(err: sqlx::Error) -> IngestError {
        let kind = match &err {
            sqlx::Error::Database(db_err) => match db_err.kind() {
                sqlx::error::ErrorKind::UniqueViolation
                | sqlx::error::ErrorKind::ForeignKeyViolation
                | sqlx::error::ErrorKind::NotNullViolation
                | sqlx::error::ErrorKind::CheckViolation => ErrorKind::ConstraintViolation,
                _ => ErrorKind::QueryFailed,
            },
            sqlx::Error::Io(_) => ErrorKind::IoError,
            sqlx::Error::PoolTimedOut => ErrorKind::PoolExhausted,
            sqlx::Error::PoolClosed => ErrorKind::PoolClosed,
            _ => ErrorKind::QueryFailed,
        };

        let detail = err.to_string();
        IngestError::from_components(
            kind,
            Cow::Borrowed("Database operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<rustls::Error> for IngestError {
    #[track_caller]
    fn from(err: rustls::Error) -> IngestError {
        let detail = err.to_string();
        IngestError::from_components(
            ErrorKind::EncryptionError,
            Cow::Borrowed("TLS configuration failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<ingest_config::shared::ValidationError> for IngestError {
    #[track_caller]
    fn from(err: ingest_config::shared::ValidationError) -> IngestError {
        let detail = err.to_string();
        IngestError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Invalid configuration"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}
