//! State shared by the facade, the reconnect loop and the listener bridges.
//!
//! Locking:
//! - `slot` (tokio `RwLock`) is the reconnect mutex. Application sends hold a
//!   read guard for the duration of `track` + `oneway`; the reconnect loop
//!   takes the write guard to swap transports and replay, so nothing new can
//!   reach a fresh transport before the replay is complete and no transport is
//!   stopped while a send is still using it.
//! - `pool`, `tracker` and `backups` use short `parking_lot` critical sections
//!   and are never held across an await.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, RwLockReadGuard, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use activewire_transport_traits::{
    Command, CommandKind, ConnectionControl, Transport, TransportError, TransportListener,
    TransportRegistry, TransportResult, TransportState,
};

use crate::config::FailoverConfig;
use crate::metrics::FailoverMetrics;
use crate::tracker::CommandTracker;
use crate::uri_pool::UriPool;

/// Connection status published to waiting callers.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LinkStatus {
    Disconnected,
    Connected,
    Failed(TransportError),
    Closed,
}

impl LinkStatus {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Closed)
    }
}

/// The active transport.
#[derive(Debug)]
pub(crate) struct Connected {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) uri: Url,
    pub(crate) generation: u64,
}

/// A started, idle transport kept ready for promotion.
#[derive(Debug)]
pub(crate) struct BackupTransport {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) uri: Url,
    pub(crate) priority: bool,
}

pub(crate) struct Shared {
    pub(crate) config: FailoverConfig,
    pub(crate) registry: Arc<TransportRegistry>,
    pub(crate) pool: Mutex<UriPool>,
    pub(crate) tracker: Mutex<CommandTracker>,
    pub(crate) slot: tokio::sync::RwLock<Option<Connected>>,
    /// Lock-free mirror of `slot` for synchronous queries.
    pub(crate) current: RwLock<Option<(Arc<dyn Transport>, Url)>>,
    pub(crate) status: watch::Sender<LinkStatus>,
    pub(crate) trigger: Notify,
    pub(crate) shutdown: CancellationToken,
    pub(crate) listener: RwLock<Option<Arc<dyn TransportListener>>>,
    pub(crate) backups: Mutex<Vec<BackupTransport>>,
    pub(crate) metrics: FailoverMetrics,
    generations: AtomicU64,
    /// Generation whose inbound traffic is currently accepted; 0 = none.
    pub(crate) live_generation: AtomicU64,
    pub(crate) first_connection: AtomicBool,
    pub(crate) priority_backup_available: AtomicBool,
    pub(crate) reconnect_requested: AtomicBool,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("status", &*self.status.borrow())
            .field("connected", &self.current.read().as_ref().map(|(_, uri)| uri.to_string()))
            .field("pool", &*self.pool.lock())
            .field("backups", &self.backups.lock().len())
            .finish_non_exhaustive()
    }
}

impl Shared {
    pub(crate) fn new(
        uris: Vec<Url>,
        config: FailoverConfig,
        registry: Arc<TransportRegistry>,
    ) -> Arc<Self> {
        let pool = UriPool::new(
            uris,
            config.priority_uris.clone(),
            config.randomize,
            config.priority_backup,
        );
        let tracker = CommandTracker::new(config.track_messages, config.max_cache_size);
        let (status, _) = watch::channel(LinkStatus::Disconnected);
        Arc::new(Self {
            config,
            registry,
            pool: Mutex::new(pool),
            tracker: Mutex::new(tracker),
            slot: tokio::sync::RwLock::new(None),
            current: RwLock::new(None),
            status,
            trigger: Notify::new(),
            shutdown: CancellationToken::new(),
            listener: RwLock::new(None),
            backups: Mutex::new(Vec::new()),
            metrics: FailoverMetrics::new(),
            generations: AtomicU64::new(0),
            live_generation: AtomicU64::new(0),
            first_connection: AtomicBool::new(true),
            priority_backup_available: AtomicBool::new(false),
            reconnect_requested: AtomicBool::new(false),
        })
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.listener.read().clone()
    }

    pub(crate) fn link_status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    pub(crate) fn state(&self) -> TransportState {
        match self.link_status() {
            LinkStatus::Connected => TransportState::Connected,
            LinkStatus::Disconnected if self.first_connection.load(Ordering::Acquire) => {
                TransportState::Connecting
            }
            LinkStatus::Disconnected => TransportState::Disconnected,
            LinkStatus::Failed(error) => TransportState::Failed {
                reason: error.to_string(),
            },
            LinkStatus::Closed => TransportState::Closed,
        }
    }

    pub(crate) fn has_connection(&self) -> bool {
        self.current.read().is_some()
    }

    pub(crate) fn connected_uri(&self) -> Option<Url> {
        self.current.read().as_ref().map(|(_, uri)| uri.clone())
    }

    /// Fails with the terminal error once the transport is closed or failed.
    pub(crate) fn check_open(&self) -> TransportResult<()> {
        match &*self.status.borrow() {
            LinkStatus::Closed => Err(TransportError::Closed),
            LinkStatus::Failed(error) => Err(error.clone()),
            _ => Ok(()),
        }
    }

    /// Waits until a transport is installed and returns a read guard on it.
    ///
    /// Honors the `timeout` option: `None` waits forever, zero fails fast.
    pub(crate) async fn wait_for_connection(&self) -> TransportResult<RwLockReadGuard<'_, Connected>> {
        let deadline = self
            .config
            .timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);
        let mut status = self.status.subscribe();
        loop {
            let terminal = match &*status.borrow_and_update() {
                LinkStatus::Closed => Some(TransportError::Closed),
                LinkStatus::Failed(error) => Some(error.clone()),
                _ => None,
            };
            if let Some(error) = terminal {
                return Err(error);
            }

            let guard = self.slot.read().await;
            if let Ok(connected) = RwLockReadGuard::try_map(guard, |slot| slot.as_ref()) {
                return Ok(connected);
            }

            match deadline {
                None => {
                    if status.changed().await.is_err() {
                        return Err(TransportError::Closed);
                    }
                }
                Some(deadline) => match tokio::time::timeout_at(deadline, status.changed()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => return Err(TransportError::Closed),
                    Err(_) => {
                        return Err(TransportError::FailoverTimeout(
                            self.config.timeout.unwrap_or_default(),
                        ));
                    }
                },
            }
        }
    }

    /// Removes the active transport from the slot.
    ///
    /// With `expected` set, only a transport of that generation is removed.
    pub(crate) async fn detach(&self, expected: Option<u64>) -> Option<Connected> {
        let mut slot = self.slot.write().await;
        if let Some(generation) = expected {
            if slot.as_ref().map(|c| c.generation) != Some(generation) {
                return None;
            }
        }
        let old = slot.take()?;
        self.live_generation.store(0, Ordering::Release);
        *self.current.write() = None;
        {
            let mut pool = self.pool.lock();
            pool.set_connected(None);
            let removed = pool.apply_pending_removals();
            if removed > 0 {
                debug!("Applied {} deferred URI removal(s)", removed);
            }
        }
        self.status.send_if_modified(|status| {
            if matches!(status, LinkStatus::Connected) {
                *status = LinkStatus::Disconnected;
                true
            } else {
                false
            }
        });
        Some(old)
    }

    /// Stops a detached transport and tells the application it was interrupted.
    pub(crate) async fn retire(&self, old: Connected) {
        FailoverMetrics::incr(&self.metrics.disconnects);
        if let Err(e) = old.transport.stop().await {
            debug!("Error stopping transport {}: {}", old.uri, e);
        }
        if let Some(listener) = self.listener() {
            listener.transport_interrupted();
        }
    }

    /// Handles the failure of the transport of `generation`.
    ///
    /// Failures of transports that are no longer active are ignored.
    pub(crate) async fn handle_transport_failure(&self, generation: u64, error: TransportError) {
        if let Some(old) = self.detach(Some(generation)).await {
            warn!(
                "Transport ({}) failed: {}, attempting to automatically reconnect",
                old.uri, error
            );
            self.retire(old).await;
        }
        self.trigger.notify_one();
    }

    /// Enters the terminal failed state.
    pub(crate) async fn fail(&self, error: TransportError) {
        let changed = self.status.send_if_modified(|status| {
            if status.is_terminal() {
                false
            } else {
                *status = LinkStatus::Failed(error.clone());
                true
            }
        });
        if !changed {
            return;
        }
        error!("Failover transport failed permanently: {}", error);
        let abandoned = self.tracker.lock().abandon_all(&error);
        if abandoned > 0 {
            debug!("Abandoned {} pending request(s)", abandoned);
        }
        self.stop_backups().await;
        if let Some(listener) = self.listener() {
            listener.on_exception(error);
        }
    }

    /// Routes an inbound command from the transport of `generation`.
    pub(crate) fn dispatch_inbound(&self, generation: u64, command: Command) {
        if generation != self.live_generation.load(Ordering::Acquire) {
            trace!("Dropping {} from inactive transport #{}", command, generation);
            return;
        }
        FailoverMetrics::incr(&self.metrics.commands_received);

        if command.is_response() {
            let waiter = self.tracker.lock().resolve(&command);
            if let Some(waiter) = waiter {
                let _ = waiter.send(Ok(command));
                return;
            }
        }

        if let CommandKind::ConnectionControl(control) = &command.kind {
            self.handle_connection_control(control);
            return;
        }

        match self.listener() {
            Some(listener) => listener.on_command(command),
            None => debug!("No listener installed, dropping {}", command),
        }
    }

    /// Applies broker instructions carried by a connection-control command.
    pub(crate) fn handle_connection_control(&self, control: &ConnectionControl) {
        if let Some(target) = &control.reconnect_to {
            if self.config.reconnect_supported {
                match Url::parse(target.trim()) {
                    Ok(uri) => {
                        info!("Broker requested reconnect to {}", uri);
                        self.request_reconnect(Some(uri));
                    }
                    Err(e) => warn!("Ignoring invalid reconnect URI '{}': {}", target, e),
                }
            } else {
                debug!("Ignoring reconnect request to {} (reconnectSupported=false)", target);
            }
        }

        if !control.connected_brokers.is_empty() && self.config.update_uris_supported {
            let uris: Vec<Url> = control
                .connected_brokers
                .iter()
                .filter_map(|text| match Url::parse(text.trim()) {
                    Ok(uri) => Some(uri),
                    Err(e) => {
                        warn!("Ignoring invalid broker URI '{}': {}", text, e);
                        None
                    }
                })
                .collect();
            info!("Updating broker URI list: {:?}", control.connected_brokers);
            self.pool.lock().update_uris(uris);
        }

        if control.rebalance && self.config.rebalance_supported {
            let preferred = self.pool.lock().connected_is_preferred();
            if preferred {
                debug!("Rebalance requested, already connected to the preferred broker");
            } else {
                info!("Rebalancing connection");
                self.request_reconnect(None);
            }
        }
    }

    /// Asks the reconnect loop to drop the active transport and reconnect,
    /// preferring `target` when given.
    pub(crate) fn request_reconnect(&self, target: Option<Url>) {
        if let Some(uri) = target {
            if self.connected_uri().as_ref() == Some(&uri) {
                debug!("Already connected to {}", uri);
                return;
            }
            self.pool.lock().set_reconnect_target(uri);
        }
        self.reconnect_requested.store(true, Ordering::Release);
        self.trigger.notify_one();
    }

    /// Applies a removal or acknowledgement that would be stale after reconnect.
    ///
    /// Returns the synthetic response when the command asked for one.
    pub(crate) fn apply_offline(&self, command: &Command) -> Option<Command> {
        self.tracker.lock().track(command);
        debug!("{} not sent while disconnected", command);
        command
            .response_required
            .then(|| Command::response_to(command.command_id))
    }

    /// Stops the active transport and every backup.
    pub(crate) async fn release_transports(&self) {
        if let Some(old) = self.detach(None).await {
            debug!("Releasing transport {}", old.uri);
            if let Err(e) = old.transport.stop().await {
                debug!("Error stopping transport {}: {}", old.uri, e);
            }
        }
        self.stop_backups().await;
    }

    pub(crate) async fn stop_backups(&self) {
        let backups: Vec<BackupTransport> = std::mem::take(&mut *self.backups.lock());
        for backup in backups {
            if let Err(e) = backup.transport.stop().await {
                debug!("Error stopping backup {}: {}", backup.uri, e);
            }
        }
    }

    /// Drops a backup whose transport failed.
    pub(crate) fn drop_backup(&self, uri: &Url) -> Option<BackupTransport> {
        let mut backups = self.backups.lock();
        let index = backups.iter().position(|b| &b.uri == uri)?;
        Some(backups.remove(index))
    }
}
