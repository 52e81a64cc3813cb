//! Error types for Tabulite

use thiserror::Error;

/// Result type alias for Tabulite operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Tabulite operations
#[derive(Error, Debug)]
pub enum Error {
    /// A platform capability required for the requested path is missing
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Malformed request (no file handle, unknown operator, bad regex)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Unrecoverable decoding error or impossible row shape
    #[error("Parse error: {0}")]
    Parse(String),

    /// I/O related errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Query that needs a loaded dataset was issued against an empty engine
    #[error("Not ready: {0}")]
    NotReady(String),

    /// In-flight ingestion was pre-empted by a new load
    #[error("Cancelled by reload: {0}")]
    CancelledByReload(String),

    /// Stored data failed validation on read-back
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an unsupported-capability error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create an invalid-input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a not-ready error
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    /// Create a cancelled-by-reload error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::CancelledByReload(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Get the wire-level error kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::Parse(_) => ErrorKind::ParseError,
            Error::Io(_) => ErrorKind::IoError,
            Error::NotReady(_) => ErrorKind::NotReady,
            Error::CancelledByReload(_) => ErrorKind::CancelledByReload,
            Error::Corruption(_) => ErrorKind::IoError,
            Error::Serialization(_) => ErrorKind::ParseError,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error is recoverable with a retry
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::NotReady(_) => true,
            Error::CancelledByReload(_) => true,

            Error::Unsupported(_) => false,
            Error::InvalidInput(_) => false,
            Error::Parse(_) => false,
            Error::Corruption(_) => false,
            Error::Serialization(_) => false,
            Error::Internal(_) => false,
        }
    }
}

/// Error kinds surfaced to callers as `{kind, message, cause?}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Missing platform capability
    Unsupported,
    /// Malformed request
    InvalidInput,
    /// Unrecoverable decoding error
    ParseError,
    /// Disk read/write failure
    IoError,
    /// No dataset loaded
    NotReady,
    /// Pre-empted by a new load
    CancelledByReload,
    /// Internal invariant violation
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::InvalidInput => "InvalidInput",
            ErrorKind::ParseError => "ParseError",
            ErrorKind::IoError => "IOError",
            ErrorKind::NotReady => "NotReady",
            ErrorKind::CancelledByReload => "CancelledByReload",
            ErrorKind::Internal => "Internal",
        };
        write!(f, "{}", name)
    }
}

/// Convert from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::invalid_input("unknown operator: like");
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(err.to_string(), "Invalid input: unknown operator: like");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::unsupported("gzip").kind(), ErrorKind::Unsupported);
        assert_eq!(Error::parse("bad row").kind(), ErrorKind::ParseError);
        assert_eq!(Error::corruption("bad header").kind(), ErrorKind::IoError);
        assert_eq!(ErrorKind::IoError.to_string(), "IOError");
    }

    #[test]
    fn test_error_recoverability() {
        assert!(Error::cancelled("reload").is_recoverable());
        assert!(!Error::corruption("evicted batch").is_recoverable());
        assert!(!Error::invalid_input("bad regex").is_recoverable());
    }
}
