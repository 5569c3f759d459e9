use thiserror::Error;

/// Failure kinds surfaced by the aggregation engine.
///
/// Only [`UsageError::Configuration`] is fatal. The other three are caught at
/// the per-provider pipeline boundary and become a disconnected snapshot.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("{0}")]
    Unauthenticated(String),
    #[error("{0}")]
    ProviderUnavailable(String),
    #[error("{0}")]
    ParseError(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthenticated,
    ProviderUnavailable,
    ParseError,
    Configuration,
}

impl UsageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UsageError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            UsageError::ProviderUnavailable(_) => ErrorKind::ProviderUnavailable,
            UsageError::ParseError(_) => ErrorKind::ParseError,
            UsageError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, UsageError::Configuration(_))
    }

    /// Classify a transport-level reqwest failure.
    pub fn from_transport(context: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UsageError::ProviderUnavailable(format!("{context}: request timed out"))
        } else if err.is_decode() {
            UsageError::ParseError(format!("{context}: {err}"))
        } else {
            UsageError::ProviderUnavailable(format!("{context}: {err}"))
        }
    }
}
