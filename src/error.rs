//! Crate-wide error kind and result alias.

use thiserror::Error;

/// Classification of failures surfaced across the detection and persistence
/// pipeline. Matches the recovery policy: I/O and tamper classes are usually
/// handled locally by the caller, the rest propagate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("backend unavailable: {0}")]
    IoUnavailable(String),

    #[error("tampered data: {0}")]
    Tampered(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl ErrorKind {
    /// Stable short code for CLI output and the audit log, independent of
    /// the human-readable message.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::IoUnavailable(_) => "IO_UNAVAILABLE",
            ErrorKind::Tampered(_) => "TAMPERED",
            ErrorKind::Timeout(_) => "TIMEOUT",
            ErrorKind::InvalidInput(_) => "INVALID_INPUT",
            ErrorKind::PermissionDenied(_) => "PERMISSION_DENIED",
            ErrorKind::Internal(_) => "INTERNAL",
        }
    }
}

#[derive(Debug, Error)]
#[error("{kind}")]
pub struct SentinelError {
    pub kind: ErrorKind,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl SentinelError {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }

    pub fn with_source(
        kind: ErrorKind,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }
}

impl From<ErrorKind> for SentinelError {
    fn from(kind: ErrorKind) -> Self {
        SentinelError::new(kind)
    }
}

pub type Result<T> = std::result::Result<T, SentinelError>;
