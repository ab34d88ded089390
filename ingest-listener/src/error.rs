use ingest::error::IngestError;
use std::backtrace::Backtrace;
use std::error::Error;
use std::fmt;

/// Returns whether terminal output should include backtraces.
fn should_render_backtrace() -> bool {
    matches!(
        std::env::var("RUST_BACKTRACE").as_deref(),
        Ok("1") | Ok("full")
    )
}

/// Result type for listener operations.
pub type ListenerResult<T> = Result<T, ListenerError>;

/// Captured backtrace wrapper to avoid thiserror's unstable feature detection.
pub struct CapturedBacktrace(Backtrace);

impl CapturedBacktrace {
    fn capture() -> Self {
        Self(Backtrace::capture())
    }
}

impl fmt::Debug for CapturedBacktrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error type for the listener service.
///
/// Wraps [`IngestError`] for database work and provides variants for startup failures.
#[derive(Debug)]
pub enum ListenerError {
    /// Pool, lock or notification error.
    Ingest(IngestError),
    /// Configuration or telemetry setup error.
    Config(Box<dyn Error + Send + Sync>, CapturedBacktrace),
    /// I/O error, such as a failure to register signal handlers.
    Io(std::io::Error, CapturedBacktrace),
}

impl ListenerError {
    /// Returns a short category label for this error.
    pub fn category(&self) -> &'static str {
        match self {
            ListenerError::Ingest(_) => "ingest error",
            ListenerError::Config(_, _) => "configuration error",
            ListenerError::Io(_, _) => "i/o error",
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self {
            ListenerError::Ingest(err) => err.backtrace(),
            ListenerError::Config(_, cb) => Some(&cb.0),
            ListenerError::Io(_, cb) => Some(&cb.0),
        }
    }

    /// Creates a configuration error from any source.
    pub fn config<E: Error + Send + Sync + 'static>(err: E) -> Self {
        ListenerError::Config(Box::new(err), CapturedBacktrace::capture())
    }

    /// Returns a user-oriented report for terminal output.
    pub fn render_report(&self) -> String {
        let mut out = String::new();
        out.push_str("listener failed\n");
        out.push_str(&format!("category: {}\n", self.category()));
        out.push_str(&format!("error: {}\n", self));

        if !matches!(self, ListenerError::Ingest(err) if err.errors().is_some()) {
            let mut source = Error::source(self);
            let mut idx = 1usize;
            while let Some(err) = source {
                out.push_str(&format!("cause {idx}: {err}\n"));
                source = err.source();
                idx += 1;
            }
        }

        if should_render_backtrace()
            && let Some(backtrace) = self.backtrace()
        {
            out.push_str("backtrace:\n");
            out.push_str(&backtrace.to_string());
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }

        out
    }
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerError::Ingest(err) => write!(f, "{err}"),
            ListenerError::Config(source, _) => write!(f, "configuration error: {source}"),
            ListenerError::Io(source, _) => write!(f, "i/o error: {source}"),
        }
    }
}

impl Error for ListenerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ListenerError::Ingest(err) => err.source(),
            ListenerError::Config(source, _) => Some(source.as_ref()),
            ListenerError::Io(source, _) => Some(source),
        }
    }
}

impl From<std::io::Error> for ListenerError {
    fn from(err: std::io::Error) -> Self {
        ListenerError::Io(err, CapturedBacktrace::capture())
    }
}

impl From<IngestError> for ListenerError {
    fn from(err: IngestError) -> Self {
        ListenerError::Ingest(err)
    }
}
