//! Core error types for TRACERY.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid payload encoding
    InvalidEncoding {
        /// What failed to encode or decode
        reason: String,
    },

    /// Parse error
    ParseError {
        /// Error message
        message: String,
    },

    /// Not found
    NotFound {
        /// Kind of object
        kind: String,
        /// Object identifier
        id: String,
    },

    /// Validation error
    Validation {
        /// Field that failed validation
        field: String,
        /// Why validation failed
        reason: String,
    },

    /// Substrate or channel I/O error
    Io {
        /// Error message
        message: String,
    },

    /// Persistent store error
    Storage {
        /// Error message
        message: String,
    },

    /// Timeout
    Timeout {
        /// Operation that timed out
        operation: String,
    },

    /// Bus or queue closed
    Closed {
        /// What was closed
        endpoint: String,
    },

    /// Internal error (for unexpected errors)
    Internal {
        /// Error message
        message: String,
    },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEncoding { reason } => write!(f, "Invalid encoding: {}", reason),
            Self::ParseError { message } => write!(f, "Parse error: {}", message),
            Self::NotFound { kind, id } => write!(f, "{} not found: {}", kind, id),
            Self::Validation { field, reason } => {
                write!(f, "Validation failed for {}: {}", field, reason)
            }
            Self::Io { message } => write!(f, "I/O error: {}", message),
            Self::Storage { message } => write!(f, "Storage error: {}", message),
            Self::Timeout { operation } => write!(f, "Timeout: {}", operation),
            Self::Closed { endpoint } => write!(f, "Closed: {}", endpoint),
            Self::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::ParseError {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::NotFound {
            kind: "node".to_string(),
            id: "7".to_string(),
        };
        assert_eq!(format!("{}", err), "node not found: 7");

        let err = CoreError::Timeout {
            operation: "trace".to_string(),
        };
        assert_eq!(format!("{}", err), "Timeout: trace");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<u64>("not a number").unwrap_err();
        let err = CoreError::from(json_err);
        assert!(matches!(err, CoreError::ParseError { .. }));
    }

    #[test]
    fn test_error_equality() {
        let err1 = CoreError::Closed {
            endpoint: "work.trace".to_string(),
        };
        let err2 = CoreError::Closed {
            endpoint: "work.trace".to_string(),
        };
        assert_eq!(err1, err2);
    }
}
