//! Error construction macros.

/// Builds an [`crate::error::IngestError`].
///
/// Accepts a kind and a static description, then optionally a detail (`detail = owned_string`
/// moves it, a bare expression is rendered with `to_string`) and a `source:` error.
///
/// ```ignore
/// ingest_error!(ErrorKind::InvalidData, "Row arity mismatch", format!("expected {n}"));
/// ingest_error!(ErrorKind::ConnectionLost, "Listener stopped", source: err);
/// ```
#[macro_export]
macro_rules! ingest_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::IngestError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, source: $source:expr) => {
        $crate::error::IngestError::from(($kind, $desc)).with_source($source)
    };
    ($kind:expr, $desc:expr, detail = $detail:expr) => {
        $crate::error::IngestError::from(($kind, $desc, $detail))
    };
    ($kind:expr, $desc:expr, detail = $detail:expr, source: $source:expr) => {
        $crate::error::IngestError::from(($kind, $desc, $detail)).with_source($source)
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::IngestError::from(($kind, $desc, $detail.to_string()))
    };
    ($kind:expr, $desc:expr, $detail:expr, source: $source:expr) => {
        $crate::error::IngestError::from(($kind, $desc, $detail.to_string())).with_source($source)
    };
}

/// Returns early with an [`crate::error::IngestError`] built by [`ingest_error!`].
#[macro_export]
macro_rules! bail {
    ($($args:tt)+) => {
        return ::core::result::Result::Err($crate::ingest_error!($($args)+))
    };
}
