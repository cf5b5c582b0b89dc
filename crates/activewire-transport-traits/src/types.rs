//! Connection lifecycle as seen from outside a transport.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a transport is in its lifecycle.
///
/// `Closed` and `Failed` are terminal; the failover transport moves between
/// the other three as its children come and go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    /// No live connection.
    Disconnected,
    /// Before the first connection, or while a reconnect cycle runs.
    Connecting,
    /// Commands can be sent.
    Connected,
    /// `stop()` was called.
    Closed,
    /// Gave up; see `reason`.
    Failed {
        /// Display form of the terminal error.
        reason: String,
    },
}

impl TransportState {
    /// `true` once the transport can no longer carry traffic.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed { .. })
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Closed => write!(f, "closed"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(TransportState::Connected.to_string(), "connected");
        assert_eq!(TransportState::Disconnected.to_string(), "disconnected");
        assert_eq!(
            TransportState::Failed {
                reason: "timeout".to_string()
            }
            .to_string(),
            "failed: timeout"
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransportState::Closed.is_terminal());
        assert!(!TransportState::Connecting.is_terminal());
    }
}
