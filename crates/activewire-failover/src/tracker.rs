//! Command tracking for replay across reconnects, and request correlation.
//!
//! The tracker keeps a single log ordered by local send sequence. An entry
//! stays in the log while at least one reason to keep it holds:
//!
//! - it establishes broker-side state (connection, session, consumer,
//!   producer, destination, open transaction) that has not been removed
//! - it is a cached message (`trackMessages`), until evicted FIFO
//! - it requires a response that has not arrived yet
//!
//! Replay resends the log in sequence order.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::trace;

use activewire_transport_traits::{
    Command, CommandId, CommandKind, TransactionAction, TransportError, TransportResult,
};

/// Receives the outcome of a request: the response, or the error that ended it.
pub type ResponseWaiter = oneshot::Sender<TransportResult<Command>>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum StateRole {
    Connection,
    Session,
    Child { session_id: String },
    Other,
}

/// One retained command.
#[derive(Debug, Clone)]
pub struct TrackedCommand {
    /// The command as originally sent
    pub command: Command,
    /// When it was first tracked
    pub sent_at: Instant,
    state: Option<(String, StateRole)>,
    cached: bool,
    awaiting_response: bool,
}

impl TrackedCommand {
    fn is_retained(&self) -> bool {
        self.state.is_some() || self.cached || self.awaiting_response
    }
}

/// Whether a command may ever be resent on a new connection.
pub fn is_replayable(command: &Command) -> bool {
    !matches!(
        command.kind,
        CommandKind::WireFormatInfo
            | CommandKind::KeepAliveInfo
            | CommandKind::ShutdownInfo
            | CommandKind::MessageAck { .. }
            | CommandKind::MessagePull { .. }
            | CommandKind::RemoveInfo { .. }
            | CommandKind::Response { .. }
            | CommandKind::ExceptionResponse { .. }
            | CommandKind::ConnectionControl(_)
            | CommandKind::ConnectionError { .. }
    )
}

/// Records commands that must survive a reconnect.
#[derive(Debug)]
pub struct CommandTracker {
    track_messages: bool,
    max_cache_size: usize,
    next_seq: u64,
    log: BTreeMap<u64, TrackedCommand>,
    state_index: HashMap<String, u64>,
    message_cache: VecDeque<u64>,
    awaiting: HashMap<CommandId, u64>,
    waiters: HashMap<CommandId, ResponseWaiter>,
}

impl CommandTracker {
    /// Creates a tracker; messages are cached only when `track_messages` is set.
    pub fn new(track_messages: bool, max_cache_size: usize) -> Self {
        Self {
            track_messages,
            max_cache_size,
            next_seq: 0,
            log: BTreeMap::new(),
            state_index: HashMap::new(),
            message_cache: VecDeque::new(),
            awaiting: HashMap::new(),
            waiters: HashMap::new(),
        }
    }

    /// Applies `command` to the tracked state.
    ///
    /// Returns `true` if the command was retained and will be replayed after a
    /// reconnect.
    pub fn track(&mut self, command: &Command) -> bool {
        match &command.kind {
            CommandKind::RemoveInfo { object_id } => {
                self.remove_object(object_id);
                return false;
            }
            CommandKind::ShutdownInfo => {
                self.clear_state();
                return false;
            }
            CommandKind::TransactionInfo {
                transaction_id,
                action: TransactionAction::Commit | TransactionAction::Rollback,
            } => {
                // Transaction is over; only the completion itself may need replay.
                self.drop_state(transaction_id);
            }
            _ => {}
        }

        if !is_replayable(command) {
            return false;
        }

        let state = state_key(&command.kind);
        let cached = self.track_messages && self.max_cache_size > 0 && command.is_message();
        let awaiting_response = command.response_required;
        if state.is_none() && !cached && !awaiting_response {
            return false;
        }

        if let Some((key, _)) = &state {
            self.drop_state(key);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some((key, _)) = &state {
            self.state_index.insert(key.clone(), seq);
        }
        if awaiting_response {
            self.awaiting.insert(command.command_id, seq);
        }
        self.log.insert(
            seq,
            TrackedCommand {
                command: command.clone(),
                sent_at: Instant::now(),
                state,
                cached,
                awaiting_response,
            },
        );
        if cached {
            self.message_cache.push_back(seq);
            self.evict_messages();
        }
        trace!("tracking {} as #{}", command, seq);
        true
    }

    /// Processes an inbound response.
    ///
    /// Releases the answered command and returns the request waiter, if one
    /// is registered for it. An exception response also forgets any state the
    /// command would have established.
    pub fn resolve(&mut self, response: &Command) -> Option<ResponseWaiter> {
        let id = response.correlation_id()?;
        if let Some(seq) = self.awaiting.remove(&id) {
            let failed = matches!(response.kind, CommandKind::ExceptionResponse { .. });
            let mut released = false;
            if let Some(entry) = self.log.get_mut(&seq) {
                entry.awaiting_response = false;
                if failed {
                    if let Some((key, _)) = entry.state.take() {
                        self.state_index.remove(&key);
                    }
                }
                released = !entry.is_retained();
            }
            if released {
                self.log.remove(&seq);
            }
        }
        self.waiters.remove(&id)
    }

    /// Registers a caller waiting for the response to `command_id`.
    pub fn register_waiter(&mut self, command_id: CommandId) -> oneshot::Receiver<TransportResult<Command>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(command_id, tx);
        rx
    }

    /// Forgets the waiter for `command_id` (the caller gave up).
    pub fn cancel_waiter(&mut self, command_id: CommandId) {
        self.waiters.remove(&command_id);
    }

    /// Wakes every waiting caller with `error` and drops all tracked commands.
    pub fn abandon_all(&mut self, error: &TransportError) -> usize {
        let waiters: Vec<ResponseWaiter> = self.waiters.drain().map(|(_, tx)| tx).collect();
        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
        self.log.clear();
        self.state_index.clear();
        self.message_cache.clear();
        self.awaiting.clear();
        count
    }

    /// The commands to resend on a new connection, in original send order.
    pub fn replay_log(&self) -> Vec<Command> {
        self.log.values().map(|entry| entry.command.clone()).collect()
    }

    /// Returns `true` if `command_id` is retained for replay.
    pub fn is_tracked(&self, command_id: CommandId) -> bool {
        self.log.values().any(|entry| entry.command.command_id == command_id)
    }

    /// Number of retained commands.
    pub fn len(&self) -> usize {
        self.log.len()
    }

    /// Returns `true` if nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Number of cached messages.
    pub fn cached_messages(&self) -> usize {
        self.message_cache.len()
    }

    fn evict_messages(&mut self) {
        while self.message_cache.len() > self.max_cache_size {
            let Some(seq) = self.message_cache.pop_front() else {
                break;
            };
            let remove = match self.log.get_mut(&seq) {
                Some(entry) => {
                    entry.cached = false;
                    !entry.is_retained()
                }
                None => false,
            };
            if remove {
                self.log.remove(&seq);
            }
        }
    }

    fn drop_state(&mut self, key: &str) -> Option<StateRole> {
        let seq = self.state_index.remove(key)?;
        let entry = self.log.get_mut(&seq)?;
        let role = entry.state.take().map(|(_, role)| role);
        if !entry.is_retained() {
            self.log.remove(&seq);
        }
        role
    }

    fn remove_object(&mut self, object_id: &str) {
        match self.drop_state(object_id) {
            Some(StateRole::Connection) => self.clear_state(),
            Some(StateRole::Session) => {
                let children: Vec<String> = self
                    .log
                    .values()
                    .filter_map(|entry| match &entry.state {
                        Some((key, StateRole::Child { session_id })) if session_id == object_id => {
                            Some(key.clone())
                        }
                        _ => None,
                    })
                    .collect();
                for key in children {
                    self.drop_state(&key);
                }
            }
            _ => {}
        }
    }

    fn clear_state(&mut self) {
        let keys: Vec<String> = self.state_index.keys().cloned().collect();
        for key in keys {
            self.drop_state(&key);
        }
    }
}

fn state_key(kind: &CommandKind) -> Option<(String, StateRole)> {
    match kind {
        CommandKind::ConnectionInfo { connection_id } => {
            Some((connection_id.clone(), StateRole::Connection))
        }
        CommandKind::SessionInfo { session_id } => Some((session_id.clone(), StateRole::Session)),
        CommandKind::ConsumerInfo {
            consumer_id,
            session_id,
            ..
        } => Some((
            consumer_id.clone(),
            StateRole::Child {
                session_id: session_id.clone(),
            },
        )),
        CommandKind::ProducerInfo {
            producer_id,
            session_id,
            ..
        } => Some((
            producer_id.clone(),
            StateRole::Child {
                session_id: session_id.clone(),
            },
        )),
        CommandKind::DestinationInfo { destination } => Some((destination.clone(), StateRole::Other)),
        CommandKind::TransactionInfo {
            transaction_id,
            action: TransactionAction::Begin,
        } => Some((transaction_id.clone(), StateRole::Other)),
        _ => None,
    }
}
