//! The failover transport facade.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use activewire_transport_traits::{
    Command, CommandKind, Transport, TransportError, TransportFuture, TransportListener,
    TransportMetrics, TransportRegistry, TransportResult, TransportState,
};

use crate::config::{FailoverConfig, FailoverUri};
use crate::metrics::FailoverMetricsSnapshot;
use crate::state::{LinkStatus, Shared};

/// A transport that keeps one live connection out of a list of candidate URIs.
///
/// Sends issued while disconnected wait for the next connection (bounded by
/// the `timeout` option). Session state and, optionally, sent messages are
/// tracked and replayed on every new connection before any new send goes out.
///
/// ```rust,ignore
/// let transport = FailoverTransport::from_uri(
///     "failover:(tcp://a:61616,tcp://b:61616)?maxReconnectAttempts=5",
///     Arc::new(registry),
/// )?;
/// transport.set_listener(listener);
/// transport.start().await?;
/// transport.oneway(command).await?;
/// ```
pub struct FailoverTransport {
    shared: Arc<Shared>,
    started: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for FailoverTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverTransport")
            .field("shared", &self.shared)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

impl FailoverTransport {
    /// Creates an unstarted failover transport over `uris`.
    ///
    /// Child transports are created through `registry`.
    pub fn new(uris: Vec<Url>, config: FailoverConfig, registry: Arc<TransportRegistry>) -> Self {
        Self {
            shared: Shared::new(uris, config, registry),
            started: AtomicBool::new(false),
            loop_handle: Mutex::new(None),
        }
    }

    /// Creates a failover transport from a `failover:(...)` URI.
    pub fn from_uri(uri: &str, registry: Arc<TransportRegistry>) -> TransportResult<Self> {
        let parsed = FailoverUri::parse(uri)?;
        Ok(Self::new(parsed.uris, parsed.config, registry))
    }

    /// The configuration in effect.
    pub fn config(&self) -> &FailoverConfig {
        &self.shared.config
    }

    /// Asks the transport to move its connection to `uri`.
    ///
    /// The current connection is dropped and `uri` is tried first; it is added
    /// to the candidates if unknown. No-op if already connected to `uri`.
    pub fn reconnect_to(&self, uri: Url) -> TransportResult<()> {
        self.shared.check_open()?;
        self.shared.request_reconnect(Some(uri));
        Ok(())
    }

    /// Adds URIs to the configured candidate list.
    pub fn add_uris(&self, uris: impl IntoIterator<Item = Url>) {
        let mut pool = self.shared.pool.lock();
        for uri in uris {
            pool.add(false, uri);
        }
    }

    /// Removes URIs from the candidates.
    ///
    /// The connected URI is only dropped right away when `rebalance` is set,
    /// which also forces a reconnect; otherwise it goes at the next disconnect.
    pub fn remove_uris(&self, uris: &[Url], rebalance: bool) {
        let reconnect = self.shared.pool.lock().remove(false, uris, rebalance);
        if reconnect {
            self.shared.request_reconnect(None);
        }
    }

    /// The URI of the active connection, if any.
    pub fn connected_uri(&self) -> Option<Url> {
        self.shared.connected_uri()
    }

    /// The current candidate URIs in preference order.
    pub fn candidate_uris(&self) -> Vec<Url> {
        self.shared.pool.lock().candidates()
    }

    /// Returns `true` once `stop()` has been called.
    pub fn is_closed(&self) -> bool {
        matches!(self.shared.link_status(), LinkStatus::Closed)
    }

    /// Returns `true` once reconnecting has been given up.
    pub fn is_failed(&self) -> bool {
        matches!(self.shared.link_status(), LinkStatus::Failed(_))
    }

    /// Lifecycle state of the failover transport as a whole.
    pub fn state(&self) -> TransportState {
        self.shared.state()
    }

    /// Detailed failover counters.
    pub fn failover_metrics(&self) -> FailoverMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Number of started backup transports.
    pub fn backup_count(&self) -> usize {
        self.shared.backups.lock().len()
    }

    /// Number of commands retained for replay.
    pub fn tracked_command_count(&self) -> usize {
        self.shared.tracker.lock().len()
    }

    /// Sends `command` over the active connection, waiting for one if needed.
    ///
    /// Returns a locally produced response for commands that were settled
    /// without reaching a broker.
    async fn send_inner(&self, command: &Command) -> TransportResult<Option<Command>> {
        loop {
            self.shared.check_open()?;

            if command.is_stale_after_disconnect() && !self.shared.has_connection() {
                return Ok(self.shared.apply_offline(command));
            }

            let connected = self.shared.wait_for_connection().await?;
            let tracked = self.shared.tracker.lock().track(command);
            match connected.transport.oneway(command.clone()).await {
                Ok(()) => {
                    self.shared.metrics.record_sent(command.size());
                    return Ok(None);
                }
                Err(e) => {
                    let generation = connected.generation;
                    let uri = connected.uri.clone();
                    drop(connected);
                    debug!("Send of {} to {} failed: {}", command, uri, e);
                    self.shared.handle_transport_failure(generation, e).await;
                    if tracked {
                        // Goes out with the replay on the next connection.
                        return Ok(None);
                    }
                }
            }
        }
    }
}

impl Transport for FailoverTransport {
    fn start(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.shared.check_open()?;
            if self.started.swap(true, Ordering::AcqRel) {
                return Ok(());
            }

            let mut status = self.shared.status.subscribe();
            let handle = tokio::spawn(Arc::clone(&self.shared).run());
            *self.loop_handle.lock() = Some(handle);
            info!(
                "Failover transport started with {} candidate URI(s)",
                self.shared.pool.lock().len()
            );

            if !self.shared.config.startup_sync {
                return Ok(());
            }
            loop {
                let current = status.borrow_and_update().clone();
                match current {
                    LinkStatus::Connected => return Ok(()),
                    LinkStatus::Failed(error) => return Err(error),
                    LinkStatus::Closed => return Err(TransportError::Closed),
                    LinkStatus::Disconnected => {}
                }
                if status.changed().await.is_err() {
                    return Err(TransportError::Closed);
                }
            }
        })
    }

    fn stop(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let changed = self.shared.status.send_if_modified(|status| {
                if matches!(status, LinkStatus::Closed) {
                    false
                } else {
                    *status = LinkStatus::Closed;
                    true
                }
            });
            self.shared.shutdown.cancel();

            let handle = self.loop_handle.lock().take();
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    warn!("Reconnect task ended abnormally: {}", e);
                }
            }

            self.shared.release_transports().await;

            let abandoned = self.shared.tracker.lock().abandon_all(&TransportError::Closed);
            if changed {
                info!("Failover transport stopped ({} pending request(s) cancelled)", abandoned);
            }
            Ok(())
        })
    }

    fn oneway(&self, command: Command) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if let Some(response) = self.send_inner(&command).await? {
                if let Some(listener) = self.shared.listener() {
                    listener.on_command(response);
                }
            }
            Ok(())
        })
    }

    fn request(&self, command: Command, timeout: Option<Duration>) -> TransportFuture<'_, Command> {
        Box::pin(async move {
            let command = command.with_response_required();
            let id = command.command_id;
            let waiter = self.shared.tracker.lock().register_waiter(id);

            match self.send_inner(&command).await {
                Ok(None) => {}
                Ok(Some(response)) => {
                    self.shared.tracker.lock().cancel_waiter(id);
                    return Ok(response);
                }
                Err(e) => {
                    self.shared.tracker.lock().cancel_waiter(id);
                    return Err(e);
                }
            }

            let outcome = match timeout {
                None => waiter.await,
                Some(limit) => match tokio::time::timeout(limit, waiter).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        self.shared.tracker.lock().cancel_waiter(id);
                        return Err(TransportError::RequestTimeout {
                            command_id: id,
                            timeout: limit,
                        });
                    }
                },
            };
            let response = outcome.map_err(|_| TransportError::Closed)??;
            match response.kind {
                CommandKind::ExceptionResponse { message, .. } => {
                    Err(TransportError::RemoteException(message))
                }
                _ => Ok(response),
            }
        })
    }

    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        *self.shared.listener.write() = Some(listener);
    }

    fn is_connected(&self) -> bool {
        matches!(self.shared.link_status(), LinkStatus::Connected)
    }

    fn remote_address(&self) -> Option<String> {
        self.shared
            .current
            .read()
            .as_ref()
            .map(|(transport, uri)| transport.remote_address().unwrap_or_else(|| uri.to_string()))
    }

    fn is_fault_tolerant(&self) -> bool {
        true
    }

    fn metrics(&self) -> TransportMetrics {
        self.shared.metrics.snapshot().into()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn inner_transport(&self) -> Option<Arc<dyn Transport>> {
        self.shared
            .current
            .read()
            .as_ref()
            .map(|(transport, _)| Arc::clone(transport))
    }
}

impl Drop for FailoverTransport {
    // The reconnect task releases the child transports on its way out.
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
