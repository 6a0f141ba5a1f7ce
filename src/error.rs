//! Error types for the connection pool.
//!
//! [`PoolError`] is the single error type returned by the pool surface. Errors
//! coming from the underlying transport are [`ConnectionError`]s and are always
//! wrapped with the pool key they belong to.

use std::time::Duration;

use thiserror::Error;

use crate::connection::ConnectionError;

/// Result type alias for pool operations.
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Errors returned by the pool, its entries and its background components.
#[derive(Error, Debug)]
pub enum PoolError {
    // ========================================================================
    // Construction
    // ========================================================================
    /// Invalid settings. Raised before anything is started.
    #[error("Invalid pool configuration: {0}")]
    Configuration(String),

    /// `get` was called for a key that has no registered destination.
    #[error("No connection configuration registered for '{0}'")]
    UnknownKey(String),

    // ========================================================================
    // Acquisition
    // ========================================================================
    /// The factory or the dial failed. Not retried by `get`.
    #[error("Connection to '{key}' failed: {source}")]
    Connection {
        /// Pool key of the destination
        key: String,
        /// Transport error
        #[source]
        source: ConnectionError,
    },

    /// No slot became free before the deadline (or immediately, when failing fast).
    #[error("Connection pool exhausted for '{key}' ({max_connections} connections, waited {waited:?})")]
    PoolExhausted {
        /// Pool key that was requested
        key: String,
        /// Configured capacity
        max_connections: usize,
        /// Time spent waiting for a slot
        waited: Duration,
    },

    /// The caller cancelled the operation.
    #[error("Operation on '{key}' was cancelled")]
    Cancelled {
        /// Pool key of the operation
        key: String,
    },

    /// Operation on a disconnected or closed entry.
    #[error("Connection '{key}' is not connected")]
    NotConnected {
        /// Pool key of the entry
        key: String,
    },

    // ========================================================================
    // Health
    // ========================================================================
    /// A liveness probe failed. Transient; retried on the next tick.
    #[error("Health check failed for '{key}': {message}")]
    HealthCheck {
        /// Pool key of the probed entry
        key: String,
        /// Probe failure description
        message: String,
    },

    /// Every recovery attempt failed.
    #[error("Recovery of '{key}' failed after {attempts} attempts")]
    RecoveryExhausted {
        /// Pool key being recovered
        key: String,
        /// Number of attempts made
        attempts: u32,
        /// Error from the last attempt
        #[source]
        last_error: Option<Box<PoolError>>,
    },

    // ========================================================================
    // Shutdown
    // ========================================================================
    /// Any operation after `close()`.
    #[error("Connection pool is closed")]
    PoolClosed,

    /// Aggregated per-entry failures from `close()`.
    #[error("Failed to close {} pooled connection(s)", .0.len())]
    Close(Vec<PoolError>),
}

impl PoolError {
    /// Wrap a transport error with its pool key.
    pub fn connection(key: impl Into<String>, source: ConnectionError) -> Self {
        PoolError::Connection {
            key: key.into(),
            source,
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            PoolError::PoolExhausted { .. } | PoolError::HealthCheck { .. } => true,
            PoolError::Connection { source, .. } => matches!(
                source,
                ConnectionError::Timeout(_)
                    | ConnectionError::ConnectionFailed(_)
                    | ConnectionError::ConnectionClosed
            ),
            _ => false,
        }
    }

    /// The pool key this error refers to, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            PoolError::UnknownKey(key) => Some(key),
            PoolError::Connection { key, .. }
            | PoolError::PoolExhausted { key, .. }
            | PoolError::Cancelled { key }
            | PoolError::NotConnected { key }
            | PoolError::HealthCheck { key, .. }
            | PoolError::RecoveryExhausted { key, .. } => Some(key),
            PoolError::Configuration(_) | PoolError::PoolClosed | PoolError::Close(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PoolError::connection(
            "ssh://admin@web1:22",
            ConnectionError::AuthenticationFailed("publickey".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "Connection to 'ssh://admin@web1:22' failed: Authentication failed: publickey"
        );

        let close = PoolError::Close(vec![PoolError::PoolClosed, PoolError::PoolClosed]);
        assert_eq!(close.to_string(), "Failed to close 2 pooled connection(s)");
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error as _;

        let err = PoolError::RecoveryExhausted {
            key: "ssh://root@db:22".to_string(),
            attempts: 3,
            last_error: Some(Box::new(PoolError::NotConnected {
                key: "ssh://root@db:22".to_string(),
            })),
        };
        let source = err.source().map(ToString::to_string);
        assert_eq!(
            source.as_deref(),
            Some("Connection 'ssh://root@db:22' is not connected")
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(PoolError::PoolExhausted {
            key: "k".into(),
            max_connections: 1,
            waited: Duration::ZERO,
        }
        .is_transient());
        let timeout = ConnectionError::Timeout(Duration::from_secs(5));
        assert!(PoolError::connection("k", timeout).is_transient());
        assert!(!PoolError::connection(
            "k",
            ConnectionError::AuthenticationFailed("denied".into())
        )
        .is_transient());
        assert!(!PoolError::PoolClosed.is_transient());
    }

    #[test]
    fn test_error_key() {
        assert_eq!(PoolError::UnknownKey("a".into()).key(), Some("a"));
        assert_eq!(PoolError::PoolClosed.key(), None);
    }
}
