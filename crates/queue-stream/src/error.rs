//! Error taxonomy for the queue stream engine.

use std::time::Duration;

use thiserror::Error;

/// The main result type used throughout the crate.
pub type QueueResult<T> = Result<T, QueueError>;

/// Every failure a queue operation can report.
///
/// The type is `Clone` so a single failure can be fanned out to every
/// correlation pending on a broken stream.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    /// Caller-supplied arguments violate a precondition.
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Operation not allowed in the current message or transaction state.
    #[error("Usage error: {message}")]
    Usage { message: String },

    /// The stream is not accepting new work right now.
    #[error("Not connected: {message}")]
    NotConnected { message: String },

    /// The stream failed while the request identified by `id` was in flight.
    #[error("Connection lost while waiting for {id}: {reason}")]
    ConnectionLost { id: String, reason: String },

    /// The stream or client was closed.
    #[error("Connection closed{}", .reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    ConnectionClosed { reason: Option<String> },

    /// Read/write failure on the underlying stream.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Auto-reconnect is disabled and the connection is gone for good.
    #[error("Permanent connection failure: {message}")]
    Permanent { message: String },

    /// The broker answered with `is_error = true`.
    #[error("Broker error: {message}")]
    Broker { message: String },

    /// No response arrived within the bounded wait.
    #[error("Request {id} timed out after {duration:?}")]
    RequestTimeout { duration: Duration, id: String },

    /// Connect or ping timeout.
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Too many pending correlations, or a duplicate correlation id.
    #[error("Capacity exceeded: {message}")]
    CapacityExceeded { message: String },

    /// Invalid client configuration.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Envelope encoding or decoding failed.
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl From<std::io::Error> for QueueError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}

impl QueueError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a usage error.
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    /// Usage error for any operation on a completed transaction.
    pub fn transaction_completed(transaction_id: &str) -> Self {
        Self::usage(format!("transaction {transaction_id} already completed"))
    }

    /// Create a not-connected error.
    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::NotConnected {
            message: message.into(),
        }
    }

    /// Create a connection-lost error for the request identified by `id`.
    pub fn connection_lost(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionLost {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create a connection-closed error.
    pub fn connection_closed(reason: Option<String>) -> Self {
        Self::ConnectionClosed { reason }
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a permanent failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Create a broker-reported error.
    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker {
            message: message.into(),
        }
    }

    /// Create a request timeout error.
    pub fn request_timeout(duration: Duration, id: impl Into<String>) -> Self {
        Self::RequestTimeout {
            duration,
            id: id.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create a capacity error.
    pub fn capacity_exceeded(message: impl Into<String>) -> Self {
        Self::CapacityExceeded {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage { .. })
    }

    /// True for every failure caused by the connection rather than the request.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::NotConnected { .. }
                | Self::ConnectionLost { .. }
                | Self::ConnectionClosed { .. }
                | Self::Transport { .. }
                | Self::Permanent { .. }
        )
    }
}
