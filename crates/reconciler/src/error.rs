//! Error types for the record and credential stores.

use std::fmt;

use bpfsync_core::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Store error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The write was based on an outdated resource version.
    Conflict {
        name: String,
        stored: u64,
        submitted: u64,
    },
    /// The record does not exist.
    NotFound { name: String },
    /// The record already exists.
    AlreadyExists { name: String },
    /// Stored data could not be decoded.
    Malformed { reason: String },
    /// The backing storage failed.
    Backend { reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict {
                name,
                stored,
                submitted,
            } => {
                write!(
                    f,
                    "record '{name}' changed: write based on version {submitted}, store has {stored}"
                )
            }
            Self::NotFound { name } => {
                write!(f, "record '{name}' not found")
            }
            Self::AlreadyExists { name } => {
                write!(f, "record '{name}' already exists")
            }
            Self::Malformed { reason } => {
                write!(f, "malformed stored data: {reason}")
            }
            Self::Backend { reason } => {
                write!(f, "storage backend error: {reason}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl StoreError {
    /// Create a conflict error.
    pub fn conflict(name: impl Into<String>, stored: u64, submitted: u64) -> Self {
        Self::Conflict {
            name: name.into(),
            stored,
            submitted,
        }
    }

    /// Create a not found error.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Create an already exists error.
    pub fn already_exists(name: impl Into<String>) -> Self {
        Self::AlreadyExists { name: name.into() }
    }

    /// Create a malformed data error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }

    /// Create a backend error.
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { name, .. } => Self::write_conflict(name),
            other => Self::store(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_becomes_write_conflict() {
        let err: Error = StoreError::conflict("xdp-pass", 4, 3).into();
        assert_eq!(err, Error::write_conflict("xdp-pass"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_backend_becomes_store_error() {
        let err: Error = StoreError::backend("disk full").into();
        assert!(matches!(err, Error::Store { .. }));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_display_names_record() {
        assert!(StoreError::not_found("trace1").to_string().contains("trace1"));
    }
}
