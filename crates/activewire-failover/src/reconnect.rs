//! The reconnect control loop.
//!
//! One task per failover transport decides when to connect and to which URI.
//! Connection attempts report back through [`ReconnectOutcome`] rather than
//! errors; only a terminal outcome is turned into an error for callers.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};
use url::Url;

use activewire_transport_traits::{Transport, TransportError, TransportListener, TransportResult};

use crate::bridge::{BackupListener, BridgeListener};
use crate::metrics::FailoverMetrics;
use crate::state::{BackupTransport, Connected, LinkStatus, Shared};
use crate::uri_pool::NextUri;

/// How a reconnect cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReconnectOutcome {
    /// A transport is installed.
    Connected,
    /// The attempt limit was reached.
    Exhausted {
        /// Attempts (full passes over the candidates) made
        attempts: u32,
        /// The last connect failure
        last_error: String,
    },
    /// The pool has no URIs at all.
    NoCandidates,
    /// The failover transport was closed mid-cycle.
    Closed,
}

impl Shared {
    /// Body of the reconnect task.
    pub(crate) async fn run(self: Arc<Self>) {
        debug!("Reconnect loop started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if self.reconnect_requested.swap(false, Ordering::AcqRel) {
                if let Some(old) = self.detach(None).await {
                    info!("Reconnecting away from {} on request", old.uri);
                    self.retire(old).await;
                }
            }

            let connected = self.slot.read().await.is_some();
            if !connected {
                match self.do_reconnect().await {
                    ReconnectOutcome::Connected => {}
                    ReconnectOutcome::Exhausted {
                        attempts,
                        last_error,
                    } => {
                        self.fail(TransportError::ReconnectExhausted {
                            attempts,
                            last_error,
                        })
                        .await;
                        break;
                    }
                    ReconnectOutcome::NoCandidates => {
                        self.fail(TransportError::NoCandidates).await;
                        break;
                    }
                    ReconnectOutcome::Closed => break,
                }
            } else if self.priority_backup_available.swap(false, Ordering::AcqRel) {
                self.failback().await;
            }

            if self.config.wants_backups() && self.slot.read().await.is_some() {
                self.build_backups().await;
                if self.priority_backup_available.load(Ordering::Acquire) {
                    continue;
                }
            }

            let poll = self.config.wants_backups();
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = self.trigger.notified() => {}
                () = tokio::time::sleep(self.config.backup_poll_interval), if poll => {}
            }
        }
        self.release_transports().await;
        debug!("Reconnect loop stopped");
    }

    /// Runs one reconnect cycle until a transport is installed or the cycle ends.
    pub(crate) async fn do_reconnect(self: &Arc<Self>) -> ReconnectOutcome {
        let first = self.first_connection.load(Ordering::Acquire);
        let limit = self.config.attempt_limit(first);

        // A requested target is only satisfied by a backup to that same URI.
        let target = self.pool.lock().reconnect_target().cloned();
        if self.promote_backup(target.as_ref()).await {
            if target.is_some() {
                self.pool.lock().clear_reconnect_target();
            }
            return ReconnectOutcome::Connected;
        }

        let mut completed: u32 = 0;
        let mut last_error = String::from("no connection attempt made");
        loop {
            if self.shutdown.is_cancelled() {
                return ReconnectOutcome::Closed;
            }

            let next = self.pool.lock().get_next();
            match next {
                NextUri::Empty => {
                    warn!("No URIs available for connection");
                    return ReconnectOutcome::NoCandidates;
                }
                NextUri::Candidate(uri) => {
                    debug!("Attempting connect #{} to {}", completed + 1, uri);
                    match self.connect_to(&uri).await {
                        Ok(()) => return ReconnectOutcome::Connected,
                        Err(TransportError::Closed) => return ReconnectOutcome::Closed,
                        Err(e) => {
                            debug!("Connect fail to: {}, reason: {}", uri, e);
                            last_error = e.to_string();
                            self.pool.lock().mark_failed(&uri);
                        }
                    }
                }
                NextUri::AllFailed => {
                    completed += 1;
                    if !limit.allows_retry(completed) {
                        warn!(
                            "Failed to connect after {} attempt(s) (limit {}): {}",
                            completed, limit, last_error
                        );
                        return ReconnectOutcome::Exhausted {
                            attempts: completed,
                            last_error,
                        };
                    }

                    let delay = self.config.backoff.delay_for_retry(completed);
                    debug!("Waiting {:?} before reconnect attempt #{}", delay, completed + 1);
                    tokio::select! {
                        () = self.shutdown.cancelled() => return ReconnectOutcome::Closed,
                        () = tokio::time::sleep(delay) => {}
                    }
                    self.pool.lock().reset_failure_marks();
                }
            }
        }
    }

    /// Creates and starts a transport for `uri`, bounded by `connectTimeout`.
    async fn start_transport(
        &self,
        uri: &Url,
        listener: Arc<dyn TransportListener>,
    ) -> TransportResult<Arc<dyn Transport>> {
        FailoverMetrics::incr(&self.metrics.connect_attempts);
        let transport = match self.registry.create(uri) {
            Ok(transport) => transport,
            Err(e) => {
                FailoverMetrics::incr(&self.metrics.connect_failures);
                return Err(e);
            }
        };
        transport.set_listener(listener);

        let timeout = self.config.connect_timeout;
        let started = tokio::select! {
            () = self.shutdown.cancelled() => Err(TransportError::Closed),
            result = tokio::time::timeout(timeout, transport.start()) => match result {
                Ok(result) => result,
                Err(_) => Err(TransportError::ConnectionTimeout {
                    uri: uri.to_string(),
                    timeout,
                }),
            },
        };

        match started {
            Ok(()) => Ok(transport),
            Err(e) => {
                FailoverMetrics::incr(&self.metrics.connect_failures);
                if let Err(stop_error) = transport.stop().await {
                    debug!("Error stopping failed transport {}: {}", uri, stop_error);
                }
                Err(e)
            }
        }
    }

    async fn connect_to(self: &Arc<Self>, uri: &Url) -> TransportResult<()> {
        let generation = self.next_generation();
        self.live_generation.store(generation, Ordering::Release);
        let transport = match self
            .start_transport(uri, BridgeListener::new(self, generation))
            .await
        {
            Ok(transport) => transport,
            Err(e) => {
                let _ = self.live_generation.compare_exchange(
                    generation,
                    0,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                return Err(e);
            }
        };

        if let Err(e) = self
            .install(Arc::clone(&transport), uri.clone(), generation)
            .await
        {
            let _ = transport.stop().await;
            return Err(e);
        }
        Ok(())
    }

    /// Replays tracked commands into `transport` and makes it the active one.
    ///
    /// Holds the reconnect mutex for the whole replay, so application sends
    /// resume only after every tracked command went out.
    async fn install(
        &self,
        transport: Arc<dyn Transport>,
        uri: Url,
        generation: u64,
    ) -> TransportResult<()> {
        let mut slot = self.slot.write().await;
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let previous = slot.as_ref().map_or(0, |c| c.generation);
        self.live_generation.store(generation, Ordering::Release);

        let replay = self.tracker.lock().replay_log();
        let count = replay.len();
        for command in replay {
            if let Err(e) = transport.oneway(command).await {
                warn!("Replay to {} failed: {}", uri, e);
                self.live_generation.store(previous, Ordering::Release);
                return Err(e);
            }
        }
        if count > 0 {
            debug!("Replayed {} tracked command(s) to {}", count, uri);
            self.metrics
                .replayed_commands
                .fetch_add(count as u64, Ordering::Relaxed);
        }

        let old = slot.replace(Connected {
            transport: Arc::clone(&transport),
            uri: uri.clone(),
            generation,
        });
        *self.current.write() = Some((transport, uri.clone()));
        {
            let mut pool = self.pool.lock();
            pool.set_connected(Some(uri.clone()));
            pool.reset_failure_marks();
            if old.is_some() {
                pool.apply_pending_removals();
            }
        }
        self.first_connection.store(false, Ordering::Release);
        self.status.send_if_modified(|status| {
            if matches!(status, LinkStatus::Disconnected) {
                *status = LinkStatus::Connected;
                true
            } else {
                false
            }
        });
        drop(slot);

        FailoverMetrics::incr(&self.metrics.connections);
        if let Some(old) = old {
            info!("Disposing {} after switching to {}", old.uri, uri);
            FailoverMetrics::incr(&self.metrics.disconnects);
            if let Err(e) = old.transport.stop().await {
                debug!("Error stopping replaced transport {}: {}", old.uri, e);
            }
        }
        info!("Successfully connected to {}", uri);
        if let Some(listener) = self.listener() {
            listener.transport_resumed();
        }
        Ok(())
    }

    /// Promotes a live backup, priority ones first.
    ///
    /// With `target` set, only a backup to that URI qualifies.
    async fn promote_backup(self: &Arc<Self>, target: Option<&Url>) -> bool {
        loop {
            let backup = {
                let mut backups = self.backups.lock();
                let index = match target {
                    Some(target) => backups.iter().position(|b| &b.uri == target),
                    None if backups.is_empty() => None,
                    None => Some(backups.iter().position(|b| b.priority).unwrap_or(0)),
                };
                match index {
                    Some(index) => backups.remove(index),
                    None => return false,
                }
            };
            if !backup.transport.is_connected() {
                debug!("Discarding dead backup {}", backup.uri);
                let _ = backup.transport.stop().await;
                continue;
            }

            let generation = self.next_generation();
            backup
                .transport
                .set_listener(BridgeListener::new(self, generation));
            match self
                .install(Arc::clone(&backup.transport), backup.uri.clone(), generation)
                .await
            {
                Ok(()) => {
                    FailoverMetrics::incr(&self.metrics.backups_promoted);
                    info!("Promoted backup transport {}", backup.uri);
                    return true;
                }
                Err(e) => {
                    debug!("Backup {} could not be promoted: {}", backup.uri, e);
                    let _ = backup.transport.stop().await;
                    if e.is_closed() {
                        return false;
                    }
                }
            }
        }
    }

    /// Switches from a non-priority connection to a ready priority backup.
    async fn failback(self: &Arc<Self>) {
        let on_priority = {
            let pool = self.pool.lock();
            pool.connected().is_some_and(|uri| pool.is_priority(uri))
        };
        if on_priority {
            return;
        }
        let backup = {
            let mut backups = self.backups.lock();
            backups
                .iter()
                .position(|b| b.priority)
                .map(|index| backups.remove(index))
        };
        let Some(backup) = backup else {
            return;
        };
        if !backup.transport.is_connected() {
            let _ = backup.transport.stop().await;
            return;
        }

        info!("Failing back to priority URI {}", backup.uri);
        let generation = self.next_generation();
        backup
            .transport
            .set_listener(BridgeListener::new(self, generation));
        match self
            .install(Arc::clone(&backup.transport), backup.uri.clone(), generation)
            .await
        {
            Ok(()) => FailoverMetrics::incr(&self.metrics.backups_promoted),
            Err(e) => {
                warn!("Failback to {} failed: {}", backup.uri, e);
                let _ = backup.transport.stop().await;
            }
        }
    }

    /// Starts backups up to the pool size.
    ///
    /// With only `priorityBackup`, a single backup to a priority URI is kept
    /// while connected elsewhere; a successful one schedules a failback.
    /// While a failback is still owed, a priority candidate may take the pool
    /// one past its size; the promotion brings it back down.
    async fn build_backups(self: &Arc<Self>) {
        let limit = if self.config.backup {
            self.config.backup_pool_size
        } else {
            1
        };
        let (candidates, on_priority) = {
            let pool = self.pool.lock();
            let existing: Vec<Url> = self.backups.lock().iter().map(|b| b.uri.clone()).collect();
            let on_priority = pool.connected().is_some_and(|uri| pool.is_priority(uri));
            let candidates: Vec<(Url, bool)> = pool
                .candidates_excluding(&existing)
                .into_iter()
                .map(|uri| {
                    let priority = pool.is_priority(&uri);
                    (uri, priority)
                })
                .filter(|(_, priority)| self.config.backup || (*priority && !on_priority))
                .collect();
            (candidates, on_priority)
        };
        let seeking_priority = self.config.priority_backup
            && !on_priority
            && !self.backups.lock().iter().any(|b| b.priority);

        for (uri, priority) in candidates {
            if self.shutdown.is_cancelled() {
                break;
            }
            let full = self.backups.lock().len() >= limit;
            if full && !(seeking_priority && priority) {
                if seeking_priority {
                    continue;
                }
                break;
            }
            let listener = BackupListener::new(self, uri.clone());
            match self.start_transport(&uri, listener).await {
                Ok(transport) => {
                    debug!("Backup transport started: {}", uri);
                    FailoverMetrics::incr(&self.metrics.backups_started);
                    self.backups.lock().push(BackupTransport {
                        transport,
                        uri: uri.clone(),
                        priority,
                    });
                    if priority && self.config.priority_backup && !on_priority {
                        info!("Priority URI {} is reachable", uri);
                        self.priority_backup_available.store(true, Ordering::Release);
                        break;
                    }
                }
                Err(e) => debug!("Failed to start backup {}: {}", uri, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use activewire_mock::{MockNetwork, MockTransportFactory};
    use activewire_transport_traits::TransportRegistry;
    use pretty_assertions::assert_eq;

    use crate::backoff::{AttemptLimit, BackoffPolicy};
    use crate::config::FailoverConfig;

    fn shared(network: &Arc<MockNetwork>, uris: &[&str], config: FailoverConfig) -> Arc<Shared> {
        let registry = Arc::new(
            TransportRegistry::new()
                .with_factory(Arc::new(MockTransportFactory::new(Arc::clone(network)))),
        );
        Shared::new(
            uris.iter().map(|s| Url::parse(s).unwrap()).collect(),
            config,
            registry,
        )
    }

    fn quick() -> FailoverConfig {
        FailoverConfig::default().with_backoff(BackoffPolicy {
            initial_delay: std::time::Duration::from_millis(1),
            ..BackoffPolicy::default()
        })
    }

    #[tokio::test]
    async fn test_cycle_connects_to_first_reachable() {
        let network = MockNetwork::new();
        network.set_available("a", false);
        let shared = shared(&network, &["mock://a", "mock://b"], quick());

        assert_eq!(shared.do_reconnect().await, ReconnectOutcome::Connected);
        assert_eq!(shared.connected_uri().unwrap().as_str(), "mock://b");
        assert_eq!(network.start_attempts("a"), 1);
    }

    #[tokio::test]
    async fn test_cycle_exhausts_attempts() {
        let network = MockNetwork::new();
        let config = quick().with_max_reconnect_attempts(AttemptLimit::Retries(2));
        let shared = shared(&network, &["mock://a?failOnCreate=true"], config);

        match shared.do_reconnect().await {
            ReconnectOutcome::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(network.create_count("a"), 3);
    }

    #[tokio::test]
    async fn test_empty_pool_has_no_candidates() {
        let network = MockNetwork::new();
        let shared = shared(&network, &[], quick());
        assert_eq!(shared.do_reconnect().await, ReconnectOutcome::NoCandidates);
    }

    #[tokio::test]
    async fn test_cancelled_cycle_reports_closed() {
        let network = MockNetwork::new();
        network.set_available("a", false);
        let shared = shared(&network, &["mock://a"], quick());
        shared.shutdown.cancel();
        assert_eq!(shared.do_reconnect().await, ReconnectOutcome::Closed);
    }

    #[tokio::test]
    async fn test_backups_are_built_and_promoted() {
        let network = MockNetwork::new();
        let shared = shared(&network, &["mock://a", "mock://b"], quick().with_backup(1));

        assert_eq!(shared.do_reconnect().await, ReconnectOutcome::Connected);
        shared.build_backups().await;
        assert_eq!(shared.backups.lock().len(), 1);
        assert_eq!(network.active_connections("b"), 1);

        let old = shared.detach(None).await.unwrap();
        shared.retire(old).await;
        assert_eq!(shared.do_reconnect().await, ReconnectOutcome::Connected);
        assert_eq!(shared.connected_uri().unwrap().as_str(), "mock://b");
        assert_eq!(shared.metrics.snapshot().backups_promoted, 1);
    }
}
