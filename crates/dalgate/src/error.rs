//! Error types for dalgate
//!
//! Operational failures (store down, timeout, breaker open) are retriable and
//! handled locally by the gateway; configuration errors are programmer errors
//! and always escalate immediately.

use std::fmt;
use thiserror::Error;

/// Result type for dalgate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection-level failures (retriable)
    Connection,
    /// Query execution errors
    Query,
    /// Timeouts (retriable)
    Timeout,
    /// Circuit breaker rejected the call without attempting it (retriable later)
    BreakerOpen,
    /// Configuration / programmer errors — never retried or queued
    Configuration,
    /// Sync queue errors
    Queue,
    /// Snapshot persistence errors
    Persistence,
    /// Everything else
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout | Self::BreakerOpen)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connection => "connection",
            Self::Query => "query",
            Self::Timeout => "timeout",
            Self::BreakerOpen => "breaker_open",
            Self::Configuration => "configuration",
            Self::Queue => "queue",
            Self::Persistence => "persistence",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// Main error type for dalgate
#[derive(Error, Debug)]
pub enum Error {
    /// Connection-level failure (network blip, store unreachable, closed connector)
    #[error("connection error: {message}")]
    Connection {
        /// Human-readable failure description
        message: String,
    },

    /// Query execution failed at the store
    #[error("query error: {message}")]
    Query {
        /// Human-readable failure description
        message: String,
        /// Offending statement, when known
        sql: Option<String>,
    },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout {
        /// What timed out
        message: String,
    },

    /// Circuit breaker is open — the underlying call was never attempted
    #[error("circuit breaker open for connector '{connector}'")]
    BreakerOpen {
        /// Connector whose breaker rejected the call
        connector: String,
    },

    /// Referenced connector id is not registered
    #[error("unknown connector: '{id}'")]
    UnknownConnector {
        /// The unregistered id
        id: String,
    },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration {
        /// What is misconfigured
        message: String,
    },

    /// Sync queue item exceeds the configured serialized-size limit
    #[error("queue item too large: {size} bytes (max {max})")]
    ItemTooLarge {
        /// Serialized item size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Queue snapshot persistence failed
    #[error("persistence error: {message}")]
    Persistence {
        /// What failed while persisting or loading
        message: String,
    },

    /// JSON (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation
    #[error("internal error: {message}")]
    Internal {
        /// Description of the violated invariant
        message: String,
    },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::BreakerOpen { .. } => ErrorCategory::BreakerOpen,
            Self::UnknownConnector { .. } | Self::Configuration { .. } => {
                ErrorCategory::Configuration
            }
            Self::ItemTooLarge { .. } => ErrorCategory::Queue,
            Self::Persistence { .. } => ErrorCategory::Persistence,
            Self::Serialization(_) | Self::Io(_) | Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
        }
    }

    /// Create a query error carrying the statement
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a persistence error
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_retriable() {
        assert!(ErrorCategory::Connection.is_retriable());
        assert!(ErrorCategory::Timeout.is_retriable());
        assert!(ErrorCategory::BreakerOpen.is_retriable());

        assert!(!ErrorCategory::Query.is_retriable());
        assert!(!ErrorCategory::Configuration.is_retriable());
        assert!(!ErrorCategory::Queue.is_retriable());
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::connection("refused").is_retriable());
        assert!(Error::timeout("ping").is_retriable());
        assert!(Error::BreakerOpen {
            connector: "primary".into()
        }
        .is_retriable());

        assert!(!Error::config("bad kind").is_retriable());
        assert!(!Error::UnknownConnector { id: "x".into() }.is_retriable());
        assert_eq!(
            Error::UnknownConnector { id: "x".into() }.category(),
            ErrorCategory::Configuration
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::query_with_sql("no such table", "SELECT * FROM nope");
        assert!(err.to_string().contains("no such table"));

        let err = Error::BreakerOpen {
            connector: "primary".into(),
        };
        assert!(err.to_string().contains("primary"));

        let err = Error::ItemTooLarge {
            size: 100,
            max: 10,
        };
        assert!(err.to_string().contains("100"));
    }
}
