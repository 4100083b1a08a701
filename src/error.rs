//! Crate-internal error type for connection, protocol, and pool layers.
//!
//! These are the low-level failures the transport stack works with. The
//! [`ActionExecutor`](crate::ActionExecutor) translates terminal instances
//! into the sanitized, user-facing [`ExecutionError`](crate::ExecutionError).

use thiserror::Error;

/// Result alias used throughout the crate.
pub type AmiResult<T> = Result<T, AmiError>;

/// Low-level AMI client error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AmiError {
    /// Underlying TCP I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking operation did not complete in time.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The TCP connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// The connection is not in a usable state.
    #[error("not connected")]
    NotConnected,

    /// Wire-level protocol violation (malformed frame, desync).
    #[error("protocol error: {message}")]
    ProtocolError {
        /// What went wrong.
        message: String,
    },

    /// A frame line did not parse as `Key: Value`.
    #[error("invalid line in frame: {line}")]
    InvalidLine {
        /// The offending line.
        line: String,
    },

    /// Parser buffer exceeded its safety limit.
    #[error("buffer overflow: {size} bytes exceeds limit {limit}")]
    BufferOverflow {
        /// Current buffer size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// The login handshake was rejected.
    #[error("authentication failed: {message}")]
    AuthenticationFailed {
        /// Server-supplied reason.
        message: String,
    },

    /// The server replied `Response: Error` to an action.
    #[error("action failed: {message}")]
    ActionFailed {
        /// Server-supplied reason.
        message: String,
    },

    /// Configuration validation failure.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Which field and why.
        message: String,
    },

    /// The pool had no connection to hand out within the acquire timeout.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// The pool has been shut down; no further acquires are served.
    #[error("connection pool is shut down")]
    PoolShutdown,

    /// Events were dropped because the per-connection queue was full.
    #[error("event queue full, events were dropped")]
    QueueFull,
}

impl AmiError {
    /// Shorthand for a [`AmiError::ProtocolError`].
    pub fn protocol_error(message: impl Into<String>) -> Self {
        AmiError::ProtocolError {
            message: message.into(),
        }
    }

    /// Shorthand for a [`AmiError::AuthenticationFailed`].
    pub fn auth_failed(message: impl Into<String>) -> Self {
        AmiError::AuthenticationFailed {
            message: message.into(),
        }
    }

    /// Shorthand for a [`AmiError::InvalidConfig`].
    pub fn invalid_config(message: impl Into<String>) -> Self {
        AmiError::InvalidConfig {
            message: message.into(),
        }
    }

    /// Whether a retry on a fresh connection could plausibly succeed.
    ///
    /// Timeouts, I/O failures, and mid-exchange disconnects are transient;
    /// explicit server rejections and configuration problems are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AmiError::Io(_)
                | AmiError::Timeout { .. }
                | AmiError::ConnectionClosed
                | AmiError::NotConnected
                | AmiError::PoolExhausted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(AmiError::ConnectionClosed.is_transient());
        assert!(AmiError::Timeout { timeout_ms: 100 }.is_transient());
        assert!(AmiError::PoolExhausted.is_transient());
        assert!(!AmiError::ActionFailed {
            message: "Permission denied".into()
        }
        .is_transient());
        assert!(!AmiError::invalid_config("host must not be empty").is_transient());
        assert!(!AmiError::PoolShutdown.is_transient());
    }

    #[test]
    fn test_display_timeout() {
        let err = AmiError::Timeout { timeout_ms: 5000 };
        assert_eq!(err.to_string(), "operation timed out after 5000ms");
    }
}
