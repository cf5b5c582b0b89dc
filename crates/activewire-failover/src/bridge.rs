//! Listeners installed on the physical transports.

use std::sync::{Arc, Weak};
use std::sync::atomic::Ordering;

use tracing::{debug, trace};
use url::Url;

use activewire_transport_traits::{Command, TransportError, TransportListener};

use crate::state::Shared;

/// Forwards traffic from one installed transport into the failover transport.
///
/// Each physical transport gets its own bridge tagged with a generation, so
/// late callbacks from a transport that has since been replaced are ignored.
pub(crate) struct BridgeListener {
    shared: Weak<Shared>,
    generation: u64,
}

impl BridgeListener {
    pub(crate) fn new(shared: &Arc<Shared>, generation: u64) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::downgrade(shared),
            generation,
        })
    }
}

impl TransportListener for BridgeListener {
    fn on_command(&self, command: Command) {
        if let Some(shared) = self.shared.upgrade() {
            shared.dispatch_inbound(self.generation, command);
        }
    }

    fn on_exception(&self, error: TransportError) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if shared.live_generation.load(Ordering::Acquire) != self.generation {
            trace!("Ignoring error from inactive transport #{}: {}", self.generation, error);
            return;
        }
        let generation = self.generation;
        tokio::spawn(async move {
            shared.handle_transport_failure(generation, error).await;
        });
    }
}

/// Watches an idle backup transport and discards it when it fails.
pub(crate) struct BackupListener {
    shared: Weak<Shared>,
    uri: Url,
}

impl BackupListener {
    pub(crate) fn new(shared: &Arc<Shared>, uri: Url) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::downgrade(shared),
            uri,
        })
    }
}

impl TransportListener for BackupListener {
    fn on_command(&self, command: Command) {
        trace!("Backup {} received {} while idle", self.uri, command);
    }

    fn on_exception(&self, error: TransportError) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if let Some(backup) = shared.drop_backup(&self.uri) {
            debug!("Backup transport {} failed: {}", self.uri, error);
            tokio::spawn(async move {
                let _ = backup.transport.stop().await;
            });
        }
    }
}
