//! # Standardized Error Types
//!
//! Internal error type for the classification engine. Nothing here ever
//! crosses the public `classify`/`log_outcome` boundary; these errors are
//! logged and absorbed by the service.

use std::error::Error as StdError;
use std::fmt;

/// A type alias for Result with the error type defaulting to our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Categorizes the failures the engine can run into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or unreadable configuration
    Configuration,
    /// Filesystem or other I/O failure
    Io,
    /// JSON encoding or decoding failure
    Serialization,
    /// The remote classifier could not be reached or declined to answer
    RemoteUnavailable,
    /// An operation exceeded its time budget
    Timeout,
    /// Durable storage rejected a write or returned bad data
    Storage,
    /// A resource quota was reached
    ResourceExhausted,
    /// Unexpected internal failure
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "Configuration Error"),
            ErrorKind::Io => write!(f, "I/O Error"),
            ErrorKind::Serialization => write!(f, "Serialization Error"),
            ErrorKind::RemoteUnavailable => write!(f, "Remote Unavailable Error"),
            ErrorKind::Timeout => write!(f, "Timeout Error"),
            ErrorKind::Storage => write!(f, "Storage Error"),
            ErrorKind::ResourceExhausted => write!(f, "Resource Exhausted Error"),
            ErrorKind::Internal => write!(f, "Internal Error"),
        }
    }
}

/// Core error type for the classification engine
#[derive(Debug)]
pub struct Error {
    /// The kind of error that occurred
    pub kind: ErrorKind,
    /// Detailed error message
    pub message: String,
    /// Chain of causes
    pub cause: Option<Box<dyn StdError + Send + Sync>>,
    /// Flag indicating if this is a transient error that might succeed on retry
    pub transient: bool,
}

impl Error {
    /// Creates a new error with the specified kind and message
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            transient: false,
        }
    }

    /// Chains this error with its cause
    pub fn cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Marks this error as transient (can be retried)
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Returns true if this error is transient and might succeed on retry
    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_ref().map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, err.to_string()).cause(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Serialization, format!("JSON error: {}", err)).cause(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else {
            ErrorKind::RemoteUnavailable
        };

        let transient = err.is_timeout()
            || err.is_connect()
            || err.status().map_or(false, |s| s.is_server_error());

        let mut error = Self::new(kind, format!("HTTP request error: {}", err)).cause(err);
        if transient {
            error = error.transient();
        }
        error
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::new(ErrorKind::Configuration, err.to_string()).cause(err)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::new(ErrorKind::Timeout, "operation timed out").cause(err).transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::new(ErrorKind::Storage, "state file unreadable");
        let display = format!("{}", err);
        assert!(display.contains("Storage Error"));
        assert!(display.contains("state file unreadable"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_io_error_keeps_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert_eq!(err.kind, ErrorKind::Io);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_json_error_conversion() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = parse.into();
        assert_eq!(err.kind, ErrorKind::Serialization);
        assert!(err.message.starts_with("JSON error"));
    }
}
