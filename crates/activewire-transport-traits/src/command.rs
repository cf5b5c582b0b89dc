//! Protocol command types.
//!
//! Commands are opaque to the transport layer apart from three things it must
//! know: an identifier, whether a response is expected, and which command
//! family the command belongs to (so that fault-tolerant transports can decide
//! what must survive a reconnect).

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifier of a command, unique per connection.
pub type CommandId = u32;

/// The action carried by a [`CommandKind::TransactionInfo`] command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionAction {
    /// Start a new transaction.
    Begin,
    /// Commit the transaction.
    Commit,
    /// Roll the transaction back.
    Rollback,
}

/// Broker-issued instructions for a client connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionControl {
    /// Ask the client to reconnect to this specific broker URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_to: Option<String>,

    /// The current set of brokers in the cluster, comma separated on the wire.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connected_brokers: Vec<String>,

    /// Ask the client to rebalance its connection across `connected_brokers`.
    #[serde(default)]
    pub rebalance: bool,
}

/// The family a command belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandKind {
    /// Startup handshake negotiating the wire format.
    WireFormatInfo,
    /// Opens a logical connection on the broker.
    ConnectionInfo {
        /// Connection identifier
        connection_id: String,
    },
    /// Opens a session on a connection.
    SessionInfo {
        /// Session identifier
        session_id: String,
    },
    /// Registers a consumer on a session.
    ConsumerInfo {
        /// Consumer identifier
        consumer_id: String,
        /// Owning session
        session_id: String,
        /// Destination consumed from
        destination: String,
    },
    /// Registers a producer on a session.
    ProducerInfo {
        /// Producer identifier
        producer_id: String,
        /// Owning session
        session_id: String,
        /// Default destination, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination: Option<String>,
    },
    /// Creates a (temporary) destination.
    DestinationInfo {
        /// Destination name
        destination: String,
    },
    /// Transaction demarcation.
    TransactionInfo {
        /// Transaction identifier
        transaction_id: String,
        /// What to do with the transaction
        action: TransactionAction,
    },
    /// Removes a previously registered connection, session, consumer, producer or destination.
    RemoveInfo {
        /// Identifier of the object being removed
        object_id: String,
    },
    /// An application message.
    Message {
        /// Sending producer
        producer_id: String,
        /// Target destination
        destination: String,
        /// Message identifier
        message_id: String,
    },
    /// Acknowledges consumed messages.
    MessageAck {
        /// Acknowledging consumer
        consumer_id: String,
    },
    /// Pulls a message for a zero-prefetch consumer.
    MessagePull {
        /// Pulling consumer
        consumer_id: String,
    },
    /// Inactivity-monitor heartbeat.
    KeepAliveInfo,
    /// Orderly shutdown of the logical connection.
    ShutdownInfo,
    /// Successful answer to a command with `response_required`.
    Response {
        /// The command id being answered
        correlation_id: CommandId,
    },
    /// Failed answer to a command with `response_required`.
    ExceptionResponse {
        /// The command id being answered
        correlation_id: CommandId,
        /// Broker-side failure description
        message: String,
    },
    /// Broker instructions for the connection (reconnect, rebalance, cluster update).
    ConnectionControl(ConnectionControl),
    /// Asynchronous connection-level error raised by the broker.
    ConnectionError {
        /// Broker-side failure description
        message: String,
    },
}

impl CommandKind {
    /// Short, stable name of the command family.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::WireFormatInfo => "WireFormatInfo",
            Self::ConnectionInfo { .. } => "ConnectionInfo",
            Self::SessionInfo { .. } => "SessionInfo",
            Self::ConsumerInfo { .. } => "ConsumerInfo",
            Self::ProducerInfo { .. } => "ProducerInfo",
            Self::DestinationInfo { .. } => "DestinationInfo",
            Self::TransactionInfo { .. } => "TransactionInfo",
            Self::RemoveInfo { .. } => "RemoveInfo",
            Self::Message { .. } => "Message",
            Self::MessageAck { .. } => "MessageAck",
            Self::MessagePull { .. } => "MessagePull",
            Self::KeepAliveInfo => "KeepAliveInfo",
            Self::ShutdownInfo => "ShutdownInfo",
            Self::Response { .. } => "Response",
            Self::ExceptionResponse { .. } => "ExceptionResponse",
            Self::ConnectionControl(_) => "ConnectionControl",
            Self::ConnectionError { .. } => "ConnectionError",
        }
    }
}

/// A protocol command travelling over a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Identifier used to correlate responses.
    pub command_id: CommandId,

    /// Whether the sender expects a [`CommandKind::Response`].
    #[serde(default)]
    pub response_required: bool,

    /// The command family and its routing attributes.
    pub kind: CommandKind,

    /// Opaque marshalled body.
    #[serde(default, skip_serializing_if = "Bytes::is_empty")]
    pub payload: Bytes,
}

impl Command {
    /// Creates a command of the given kind with an empty payload.
    pub const fn new(command_id: CommandId, kind: CommandKind) -> Self {
        Self {
            command_id,
            response_required: false,
            kind,
            payload: Bytes::new(),
        }
    }

    /// Creates a successful response to `correlation_id`.
    pub const fn response_to(correlation_id: CommandId) -> Self {
        Self::new(0, CommandKind::Response { correlation_id })
    }

    /// Marks the command as expecting a response.
    #[must_use]
    pub const fn with_response_required(mut self) -> Self {
        self.response_required = true;
        self
    }

    /// Attaches a marshalled body.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Returns the size of the command payload in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Returns `true` for both successful and exception responses.
    pub const fn is_response(&self) -> bool {
        matches!(
            self.kind,
            CommandKind::Response { .. } | CommandKind::ExceptionResponse { .. }
        )
    }

    /// The command id this command answers, if it is a response.
    pub const fn correlation_id(&self) -> Option<CommandId> {
        match self.kind {
            CommandKind::Response { correlation_id }
            | CommandKind::ExceptionResponse { correlation_id, .. } => Some(correlation_id),
            _ => None,
        }
    }

    /// Returns `true` if this is an application message.
    pub const fn is_message(&self) -> bool {
        matches!(self.kind, CommandKind::Message { .. })
    }

    /// Returns `true` if this is a broker connection-control command.
    pub const fn is_connection_control(&self) -> bool {
        matches!(self.kind, CommandKind::ConnectionControl(_))
    }

    /// Returns `true` for removal and acknowledgement commands, which become
    /// stale once the connection they were meant for is gone.
    pub const fn is_stale_after_disconnect(&self) -> bool {
        matches!(
            self.kind,
            CommandKind::RemoveInfo { .. } | CommandKind::MessageAck { .. }
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind.name(), self.command_id)?;
        if self.response_required {
            write!(f, " (response required)")?;
        }
        Ok(())
    }
}

/// Hands out monotonically increasing command ids.
#[derive(Debug)]
pub struct CommandIdGenerator {
    next: AtomicU32,
}

impl Default for CommandIdGenerator {
    fn default() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }
}

impl CommandIdGenerator {
    /// Creates a generator starting at 1 (0 is reserved for responses).
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next id.
    pub fn next_id(&self) -> CommandId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
