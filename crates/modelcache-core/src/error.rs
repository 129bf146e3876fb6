//! Error types for the model cache.
//!
//! Read misses are never errors: lookups return `Option`. The variants here
//! cover rejected input, remote failures, filesystem problems and scan-slot
//! conflicts.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the model cache.
#[derive(Debug, Error)]
pub enum CacheError {
    // Input errors
    #[error("Invalid {field}: {message}")]
    InvalidInput { field: String, message: String },

    #[error("Not found: {what}")]
    NotFound { what: String },

    // Registry errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Rate limited by registry, retry after {retry_after_secs:?} seconds")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Registry returned {status}: {message}")]
    RegistryUnavailable { status: u16, message: String },

    #[error("Registry rejected the request with {status}")]
    RegistryRejected { status: u16 },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Scan errors
    #[error("A scan is already running: {job_id}")]
    AlreadyRunning { job_id: String },

    #[error("Scan root {path:?} is unreadable: {message}")]
    RootUnreadable { path: PathBuf, message: String },

    #[error("Operation was cancelled")]
    Cancelled,

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CacheError::Timeout(std::time::Duration::from_secs(0))
        } else {
            CacheError::Network {
                message: err.to_string(),
                cause: err.url().map(|u| u.to_string()),
            }
        }
    }
}

impl CacheError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        CacheError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Shorthand for an input validation failure.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        CacheError::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Check if this error should trigger a retry.
    ///
    /// Only transient registry failures qualify: network errors, timeouts,
    /// 429 and 5xx responses.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::Network { .. }
                | CacheError::Timeout(_)
                | CacheError::RateLimited { .. }
                | CacheError::RegistryUnavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CacheError::AlreadyRunning {
            job_id: "abc".into(),
        };
        assert_eq!(err.to_string(), "A scan is already running: abc");

        let err = CacheError::invalid("path", "must not be empty");
        assert_eq!(err.to_string(), "Invalid path: must not be empty");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(CacheError::Timeout(std::time::Duration::from_secs(5)).is_retryable());
        assert!(CacheError::RateLimited {
            retry_after_secs: None
        }
        .is_retryable());
        assert!(CacheError::RegistryUnavailable {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(!CacheError::RegistryRejected { status: 401 }.is_retryable());
        assert!(!CacheError::NotFound { what: "x".into() }.is_retryable());
    }
}
