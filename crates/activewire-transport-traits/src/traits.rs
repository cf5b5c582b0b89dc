//! Core transport traits.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::command::Command;
use crate::error::{TransportError, TransportResult};
use crate::metrics::TransportMetrics;

/// Boxed future returned by the object-safe transport methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = TransportResult<T>> + Send + 'a>>;

/// Receives inbound traffic and lifecycle notifications from a transport.
///
/// Callbacks run on the transport's own dispatch task and must not block.
pub trait TransportListener: Send + Sync {
    /// An inbound command arrived.
    fn on_command(&self, command: Command);

    /// The transport hit an error; for a plain transport this means it is unusable.
    fn on_exception(&self, error: TransportError);

    /// A fault-tolerant transport lost its connection and is reconnecting.
    fn transport_interrupted(&self) {}

    /// A fault-tolerant transport re-established its connection.
    fn transport_resumed(&self) {}
}

/// The core trait for all transport implementations.
///
/// A transport is a point-to-point, command-oriented connection. Implementations
/// are shared behind `Arc<dyn Transport>`, so every method takes `&self`.
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Establishes the connection and starts inbound dispatch.
    fn start(&self) -> TransportFuture<'_, ()>;

    /// Closes the connection and stops inbound dispatch.
    fn stop(&self) -> TransportFuture<'_, ()>;

    /// Sends a command without waiting for a response.
    fn oneway(&self, command: Command) -> TransportFuture<'_, ()>;

    /// Sends a command and waits for its correlated response.
    ///
    /// The command is sent with `response_required` set regardless of its
    /// original value. `timeout` of `None` waits indefinitely.
    fn request(&self, command: Command, timeout: Option<Duration>) -> TransportFuture<'_, Command>;

    /// Installs the listener that receives inbound commands and errors.
    fn set_listener(&self, listener: Arc<dyn TransportListener>);

    /// Returns `true` if the transport currently has a live connection.
    fn is_connected(&self) -> bool;

    /// Returns the address of the remote peer, if connected.
    fn remote_address(&self) -> Option<String> {
        None
    }

    /// Returns `true` if the transport survives connection loss on its own.
    fn is_fault_tolerant(&self) -> bool {
        false
    }

    /// Returns a snapshot of the transport's current metrics.
    fn metrics(&self) -> TransportMetrics {
        TransportMetrics::default()
    }

    /// Upcast used by [`narrow`] to test the concrete type.
    fn as_any(&self) -> &dyn Any;

    /// The transport this one delegates to, if it wraps another.
    fn inner_transport(&self) -> Option<Arc<dyn Transport>> {
        None
    }
}

/// Finds a transport of concrete type `T` in a wrapper chain.
///
/// Checks `transport` itself first, then each [`Transport::inner_transport`]
/// in turn. The result is for inspection; sending through it bypasses any
/// bookkeeping done by the wrappers.
pub fn narrow<T: Transport + 'static>(transport: &Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
    let mut current = Some(Arc::clone(transport));
    while let Some(candidate) = current {
        if candidate.as_any().is::<T>() {
            return Some(candidate);
        }
        current = candidate.inner_transport();
    }
    None
}

/// A factory for creating transports for one URI scheme.
pub trait TransportFactory: Send + Sync + std::fmt::Debug {
    /// The URI scheme this factory handles (e.g. `"tcp"`).
    fn scheme(&self) -> &str;

    /// Creates an unstarted transport for `uri`.
    ///
    /// Invalid options in the URI are reported here, never at `start()`.
    fn create(&self, uri: &Url) -> TransportResult<Arc<dyn Transport>>;
}
