//! Transport error types.

use std::time::Duration;
use thiserror::Error;

/// A specialized `Result` type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Represents errors that can occur during transport operations.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum TransportError {
    /// Failed to establish a connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection was lost.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Failed to send a command.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to serialize or deserialize a command.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// A protocol-level error occurred.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The broker answered a request with an exception response.
    #[error("Remote exception: {0}")]
    RemoteException(String),

    /// Connection establishment timed out.
    #[error("Connection timed out after {timeout:?} while connecting to {uri}")]
    ConnectionTimeout {
        /// The endpoint that did not answer in time
        uri: String,
        /// The timeout duration that was exceeded
        timeout: Duration,
    },

    /// A request did not receive its correlated response in time.
    #[error("Request {command_id} timed out after {timeout:?}")]
    RequestTimeout {
        /// The command id of the request
        command_id: u32,
        /// The timeout duration that was exceeded
        timeout: Duration,
    },

    /// A caller waited longer than the configured failover timeout for a connection.
    #[error(
        "Failover timeout of {0:?} reached while waiting for a transport. \
         If this is expected, raise the `timeout` option on the failover URI"
    )]
    FailoverTimeout(Duration),

    /// Every reconnect attempt allowed by configuration has failed.
    #[error("Failed to connect after {attempts} attempt(s): {last_error}")]
    ReconnectExhausted {
        /// Number of attempts (full passes over the candidate list) made
        attempts: u32,
        /// Description of the last connect failure
        last_error: String,
    },

    /// There are no candidate URIs to connect to.
    #[error("No URIs available to connect to")]
    NoCandidates,

    /// The transport was configured with invalid parameters.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// A URI could not be parsed.
    #[error("Invalid URI '{uri}': {reason}")]
    InvalidUri {
        /// The offending URI text
        uri: String,
        /// Why it was rejected
        reason: String,
    },

    /// No factory is registered for the URI scheme.
    #[error("No transport registered for scheme '{0}'")]
    UnknownScheme(String),

    /// The transport is not connected.
    #[error("Transport not connected")]
    NotConnected,

    /// The transport has been closed by its owner.
    ///
    /// This is a graceful condition, not a failure: see [`TransportError::is_closed`].
    #[error("Transport closed")]
    Closed,

    /// An underlying I/O error occurred.
    #[error("IO error: {0}")]
    Io(String),

    /// An unexpected internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransportError {
    /// Returns `true` if this error signals a graceful close rather than a failure.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Returns `true` if this error is terminal for a fault-tolerant transport.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::ReconnectExhausted { .. } | Self::NoCandidates | Self::Closed
        )
    }

    /// Returns `true` for errors that originate at the connection level and
    /// should trigger a reconnect when raised by a live transport.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::ConnectionLost(_)
                | Self::SendFailed(_)
                | Self::ConnectionTimeout { .. }
                | Self::NotConnected
                | Self::Io(_)
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for TransportError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUri {
            uri: String::new(),
            reason: err.to_string(),
        }
    }
}
