//! Shared in-process "broker network" the mock transports connect to.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use activewire_transport_traits::{Command, TransportError};

/// Inbound traffic for one mock connection.
#[derive(Debug)]
pub(crate) enum Inbound {
    Command(Command),
    Exception(TransportError),
}

#[derive(Debug)]
struct LiveConnection {
    id: u64,
    inbound: mpsc::UnboundedSender<Inbound>,
}

#[derive(Debug)]
struct Endpoint {
    available: bool,
    creates: u64,
    start_attempts: u64,
    received: Vec<Command>,
    connections: Vec<LiveConnection>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            available: true,
            creates: 0,
            start_attempts: 0,
            received: Vec::new(),
            connections: Vec::new(),
        }
    }
}

/// A registry of named mock endpoints.
///
/// Every `mock://<name>` transport created through a factory bound to the same
/// network talks to the same endpoint record, so tests can inspect what was
/// sent, take endpoints down, break live connections and push inbound commands.
/// Endpoints are available by default.
#[derive(Debug, Default)]
pub struct MockNetwork {
    endpoints: Mutex<HashMap<String, Endpoint>>,
    next_connection_id: AtomicU64,
}

impl MockNetwork {
    /// Creates an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes `name` accept (`true`) or refuse (`false`) new connections.
    ///
    /// Existing connections are not affected; see [`fail_connections`](Self::fail_connections).
    pub fn set_available(&self, name: &str, available: bool) {
        self.endpoints
            .lock()
            .entry(name.to_string())
            .or_default()
            .available = available;
    }

    /// Breaks every live connection to `name`, as if the broker went away.
    ///
    /// Returns the number of connections that were broken.
    pub fn fail_connections(&self, name: &str) -> usize {
        let connections = {
            let mut endpoints = self.endpoints.lock();
            match endpoints.get_mut(name) {
                Some(endpoint) => std::mem::take(&mut endpoint.connections),
                None => Vec::new(),
            }
        };
        for connection in &connections {
            let _ = connection.inbound.send(Inbound::Exception(TransportError::ConnectionLost(
                format!("mock endpoint {name} dropped connection {}", connection.id),
            )));
        }
        connections.len()
    }

    /// Delivers `command` to every live connection to `name`.
    pub fn inject(&self, name: &str, command: Command) -> usize {
        let endpoints = self.endpoints.lock();
        let Some(endpoint) = endpoints.get(name) else {
            return 0;
        };
        for connection in &endpoint.connections {
            let _ = connection.inbound.send(Inbound::Command(command.clone()));
        }
        endpoint.connections.len()
    }

    /// Commands received by `name`, in arrival order.
    pub fn received(&self, name: &str) -> Vec<Command> {
        self.endpoints
            .lock()
            .get(name)
            .map(|endpoint| endpoint.received.clone())
            .unwrap_or_default()
    }

    /// Forgets the commands recorded for `name`.
    pub fn clear_received(&self, name: &str) {
        if let Some(endpoint) = self.endpoints.lock().get_mut(name) {
            endpoint.received.clear();
        }
    }

    /// Number of transports created for `name`, including those whose creation failed.
    pub fn create_count(&self, name: &str) -> u64 {
        self.endpoints
            .lock()
            .get(name)
            .map_or(0, |endpoint| endpoint.creates)
    }

    /// Number of `start()` calls made against `name`.
    pub fn start_attempts(&self, name: &str) -> u64 {
        self.endpoints
            .lock()
            .get(name)
            .map_or(0, |endpoint| endpoint.start_attempts)
    }

    /// Number of live connections to `name`.
    pub fn active_connections(&self, name: &str) -> usize {
        self.endpoints
            .lock()
            .get(name)
            .map_or(0, |endpoint| endpoint.connections.len())
    }

    pub(crate) fn record_create(&self, name: &str) {
        self.endpoints
            .lock()
            .entry(name.to_string())
            .or_default()
            .creates += 1;
    }

    /// Registers a new connection, or returns `None` if the endpoint refuses it.
    pub(crate) fn connect(&self, name: &str, inbound: mpsc::UnboundedSender<Inbound>) -> Option<u64> {
        let mut endpoints = self.endpoints.lock();
        let endpoint = endpoints.entry(name.to_string()).or_default();
        endpoint.start_attempts += 1;
        if !endpoint.available {
            return None;
        }
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        endpoint.connections.push(LiveConnection { id, inbound });
        Some(id)
    }

    pub(crate) fn disconnect(&self, name: &str, connection_id: u64) {
        if let Some(endpoint) = self.endpoints.lock().get_mut(name) {
            endpoint.connections.retain(|c| c.id != connection_id);
        }
    }

    /// Records a command sent by `connection_id`; returns `false` if the
    /// connection has been broken in the meantime.
    pub(crate) fn deliver(&self, name: &str, connection_id: u64, command: Command) -> bool {
        let mut endpoints = self.endpoints.lock();
        let Some(endpoint) = endpoints.get_mut(name) else {
            return false;
        };
        if !endpoint.connections.iter().any(|c| c.id == connection_id) {
            return false;
        }
        endpoint.received.push(command);
        true
    }
}

/// The endpoint name a mock URI addresses: `mock://name` or `mock:name`.
pub(crate) fn endpoint_name(uri: &Url) -> String {
    match uri.host_str() {
        Some(host) => match uri.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        },
        None => uri.path().trim_start_matches('/').to_string(),
    }
}
