//! Compositor error types.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result type for compositor operations.
pub type CompositorResult<T> = Result<T, CompositorError>;

/// Closed set of failure categories surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The source path does not exist.
    NotFound,
    /// The source exists but has no decodable stream of the requested kind.
    UnsupportedMedia,
    /// A malformed frame or an unexpected message on the wire.
    ProtocolViolation,
    /// The worker process exited, could not be launched, or is not running.
    WorkerCrashed,
    /// The caller's deadline elapsed before a response arrived.
    Timeout,
    /// Anything the translation table does not recognise.
    Unknown,
}

impl ErrorKind {
    /// Stable name used in logs and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::UnsupportedMedia => "UnsupportedMedia",
            Self::ProtocolViolation => "ProtocolViolation",
            Self::WorkerCrashed => "WorkerCrashed",
            Self::Timeout => "Timeout",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed compositor failure.
///
/// The raw diagnostic text is always kept in `message`, even when the
/// classification is coarse (`ErrorKind::Unknown`).
#[derive(Error, Debug, Clone)]
#[error("Compositor error: {message}")]
pub struct CompositorError {
    kind: ErrorKind,
    message: String,
    backtrace: Option<String>,
}

impl CompositorError {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            backtrace: None,
        }
    }

    /// Attach the worker-side backtrace.
    pub fn with_backtrace(mut self, backtrace: impl Into<String>) -> Self {
        let backtrace = backtrace.into();
        if !backtrace.is_empty() {
            self.backtrace = Some(backtrace);
        }
        self
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolViolation, message)
    }

    pub fn crashed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::WorkerCrashed, message)
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("command timed out after {}ms", after.as_millis()),
        )
    }

    /// The worker could not be launched.
    pub fn spawn_failed(program: &str, err: &io::Error) -> Self {
        Self::crashed(format!("failed to launch compositor binary {program}: {err}"))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The original diagnostic text.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn backtrace(&self) -> Option<&str> {
        self.backtrace.as_deref()
    }

    /// Check if this error indicates the worker is gone.
    pub fn is_worker_crashed(&self) -> bool {
        self.kind == ErrorKind::WorkerCrashed
    }

    /// Check if retrying the command (possibly after a restart) can succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout | ErrorKind::WorkerCrashed)
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for CompositorError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::crashed("response slot dropped before resolution")
    }
}
