//! Error types and Result alias for otterdb
//!
//! The storage core never logs; every fallible operation returns a typed
//! `Result`. I/O and corruption errors are latched onto the pager until the
//! enclosing transaction is rolled back.

use std::fmt;

/// Primary error codes surfaced by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    /// Requested key or bucket does not exist
    NotFound = 1,
    /// Caller error: bad key size, bucket exists, invalid cursor, misuse
    InvalidArgument = 2,
    /// On-disk structure failed validation
    Corruption = 3,
    /// Underlying file or shared-memory operation failed
    IoErr = 4,
    /// Operation is not supported in the current configuration
    NotSupported = 5,
    /// A lock could not be acquired without blocking
    Busy = 6,
    /// Operation aborted (e.g. allocation failure)
    Aborted = 7,
}

/// Secondary error codes refining the primary code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum SubCode {
    /// No additional detail
    #[default]
    None = 0,
    /// Busy: the caller may retry via its busy handler
    Retry = 1,
    /// Aborted: memory could not be allocated
    NoMemory = 2,
}

/// Error value carrying a code, optional subcode, and optional message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    code: ErrorCode,
    subcode: SubCode,
    message: Option<String>,
}

impl Error {
    /// Create an error with just a primary code
    pub fn new(code: ErrorCode) -> Self {
        Error {
            code,
            subcode: SubCode::None,
            message: None,
        }
    }

    /// Create an error with a primary code and a message
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Error {
            code,
            subcode: SubCode::None,
            message: Some(message.into()),
        }
    }

    /// Busy error with the retry subcode
    pub fn busy_retry() -> Self {
        Error {
            code: ErrorCode::Busy,
            subcode: SubCode::Retry,
            message: None,
        }
    }

    /// Aborted error with the no-memory subcode
    pub fn no_memory() -> Self {
        Error {
            code: ErrorCode::Aborted,
            subcode: SubCode::NoMemory,
            message: None,
        }
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        Error::with_message(ErrorCode::Corruption, message)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn subcode(&self) -> SubCode {
        self.subcode
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    pub fn is_busy(&self) -> bool {
        self.code == ErrorCode::Busy
    }

    pub fn is_retry(&self) -> bool {
        self.code == ErrorCode::Busy && self.subcode == SubCode::Retry
    }

    pub fn is_corruption(&self) -> bool {
        self.code == ErrorCode::Corruption
    }

    pub fn is_io_error(&self) -> bool {
        self.code == ErrorCode::IoErr
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.code {
            ErrorCode::NotFound => "not found",
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::Corruption => "corruption",
            ErrorCode::IoErr => "I/O error",
            ErrorCode::NotSupported => "not supported",
            ErrorCode::Busy => "busy",
            ErrorCode::Aborted => "aborted",
        };
        match (&self.message, self.subcode) {
            (Some(msg), _) => write!(f, "{}: {}", name, msg),
            (None, SubCode::Retry) => write!(f, "{} (retry)", name),
            (None, SubCode::NoMemory) => write!(f, "{} (no memory)", name),
            (None, SubCode::None) => write!(f, "{}", name),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::with_message(ErrorCode::IoErr, err.to_string())
    }
}

/// Result type alias for otterdb operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = Error::new(ErrorCode::NotFound);
        assert!(err.is_not_found());
        assert!(!err.is_busy());
        assert_eq!(err.subcode(), SubCode::None);
    }

    #[test]
    fn test_busy_retry() {
        let err = Error::busy_retry();
        assert!(err.is_busy());
        assert!(err.is_retry());
        assert_eq!(err.code(), ErrorCode::Busy);
        assert_eq!(err.subcode(), SubCode::Retry);
    }

    #[test]
    fn test_no_memory() {
        let err = Error::no_memory();
        assert_eq!(err.code(), ErrorCode::Aborted);
        assert_eq!(err.subcode(), SubCode::NoMemory);
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::new(ErrorCode::Corruption).to_string(), "corruption");
        assert_eq!(Error::busy_retry().to_string(), "busy (retry)");
        assert_eq!(
            Error::with_message(ErrorCode::IoErr, "short read").to_string(),
            "I/O error: short read"
        );
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: Error = io.into();
        assert!(err.is_io_error());
    }
}
