//! Error types for the monarch-dl library
//!
//! Provides the failure taxonomy for download operations: task rejection,
//! probe and transfer failures, local storage faults, and finalize checks.

use std::fmt;
use std::path::PathBuf;

use crate::core::task::TaskId;

/// Retryability class of a failure. Retry budgets are counted per block and
/// per class, so a flaky connection does not eat the budget of a slow body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryKind {
    /// Connection-level failure (refused, reset, DNS, TLS, connect timeout)
    Connect,

    /// Response body stalled or was interrupted mid-stream
    Read,

    /// HTTP status worth retrying (408, 429, 5xx)
    Status,
}

/// Main error type for monarch-dl operations
#[derive(Debug)]
pub enum Error {
    /// Destination file is already claimed by an active task
    FileBusy(PathBuf),

    /// An identical task (same url and destination) is already active
    SameTaskBusy(TaskId),

    /// Network connectivity issues (connect, DNS, TLS, timeouts)
    NetworkError(String),

    /// Response body interrupted or stalled after a successful connect
    StreamInterrupted(String),

    /// Unexpected HTTP status code
    HttpStatus { status: u16, context: String },

    /// HTTP-level error that carries no usable status
    HttpError(String),

    /// File I/O error
    IoError(std::io::Error),

    /// Destination file could not be created or pre-allocated
    PreAllocateFailed(std::io::Error),

    /// Transferred bytes do not add up to the probed content length
    SizeMismatch { expected: u64, actual: u64 },

    /// Invalid configuration or parameters
    InvalidInput(String),
}

impl Error {
    /// Classify this error for retry accounting. `None` means the failure is
    /// permanent and escalates straight to a task-terminal error.
    pub fn retry_kind(&self) -> Option<RetryKind> {
        match self {
            Error::NetworkError(_) => Some(RetryKind::Connect),
            Error::StreamInterrupted(_) => Some(RetryKind::Read),
            Error::HttpStatus { status, .. } if matches!(status, 408 | 429 | 500..=599) => {
                Some(RetryKind::Status)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::FileBusy(path) => {
                write!(f, "Destination '{}' is used by an active task", path.display())
            }
            Error::SameTaskBusy(id) => {
                write!(f, "An identical task is already active (id {id})")
            }
            Error::NetworkError(msg) => {
                write!(f, "Network error: {msg}")
            }
            Error::StreamInterrupted(msg) => {
                write!(f, "Stream interrupted: {msg}")
            }
            Error::HttpStatus { status, context } => {
                write!(f, "HTTP {status}: {context}")
            }
            Error::HttpError(msg) => {
                write!(f, "HTTP error: {msg}")
            }
            Error::IoError(err) => {
                write!(f, "I/O error: {err}")
            }
            Error::PreAllocateFailed(err) => {
                write!(f, "Failed to pre-allocate destination file: {err}")
            }
            Error::SizeMismatch { expected, actual } => {
                write!(f, "Size mismatch after fetch: expected {expected} bytes, got {actual}")
            }
            Error::InvalidInput(msg) => {
                write!(f, "Invalid input: {msg}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) | Error::PreAllocateFailed(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Error::NetworkError(err.to_string())
        } else {
            Error::HttpError(err.to_string())
        }
    }
}

/// Convenience result type for monarch-dl operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_kind_classification() {
        assert_eq!(
            Error::NetworkError("reset".into()).retry_kind(),
            Some(RetryKind::Connect)
        );
        assert_eq!(
            Error::StreamInterrupted("stalled".into()).retry_kind(),
            Some(RetryKind::Read)
        );
        assert_eq!(
            Error::HttpStatus { status: 503, context: "range".into() }.retry_kind(),
            Some(RetryKind::Status)
        );
        assert_eq!(
            Error::HttpStatus { status: 429, context: "range".into() }.retry_kind(),
            Some(RetryKind::Status)
        );
    }

    #[test]
    fn test_permanent_errors_have_no_retry_kind() {
        assert_eq!(
            Error::HttpStatus { status: 403, context: "range".into() }.retry_kind(),
            None
        );
        assert_eq!(Error::FileBusy(PathBuf::from("/tmp/x")).retry_kind(), None);
        assert_eq!(
            Error::SizeMismatch { expected: 10, actual: 9 }.retry_kind(),
            None
        );
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(Error::IoError(io).retry_kind(), None);
    }

    #[test]
    fn test_io_error_conversion_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::IoError(_)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_display_formats() {
        let err = Error::SizeMismatch { expected: 1000, actual: 667 };
        assert_eq!(
            err.to_string(),
            "Size mismatch after fetch: expected 1000 bytes, got 667"
        );
        let err = Error::HttpStatus { status: 403, context: "block 1".into() };
        assert_eq!(err.to_string(), "HTTP 403: block 1");
    }
}
